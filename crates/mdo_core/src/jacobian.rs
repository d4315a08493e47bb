//! Local (per-component) Jacobians: the table components fill, the engine's
//! stored form, and finite-difference approximation.

use crate::component::{ExplicitComponent, ImplicitComponent};
use crate::error::ComponentError;
use crate::traits::{LinearOperator, ScaledIdentity};
use crate::variable::{find_local, LocalVar, Values, ValuesMut, VarKind};
use anyhow::anyhow;
use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdForm {
    Forward,
    Backward,
    Central,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    /// Step scales with the magnitude of the perturbed entry, never below
    /// `step`.
    Relative,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FdSettings {
    pub step: f64,
    pub form: FdForm,
    pub step_type: StepType,
}

impl Default for FdSettings {
    fn default() -> Self {
        Self {
            step: 1e-6,
            form: FdForm::Forward,
            step_type: StepType::Relative,
        }
    }
}

impl FdSettings {
    pub(crate) fn step_for(&self, value: f64) -> f64 {
        match self.step_type {
            StepType::Absolute => self.step,
            StepType::Relative => (value.abs() * self.step).max(self.step),
        }
    }
}

pub(crate) struct Block {
    pub row: usize,
    pub col: usize,
    pub wrt: VarKind,
    pub op: Box<dyn LinearOperator>,
}

/// Partial derivatives filled in by `compute_partials` / `linearize`.
///
/// Rows are the component's outputs (residuals), columns its inputs and, for
/// implicit components, its outputs.
pub struct Partials<'a> {
    rows: &'a [LocalVar],
    inputs: &'a [LocalVar],
    outputs: Option<&'a [LocalVar]>,
    blocks: BTreeMap<(String, String), Block>,
}

impl<'a> Partials<'a> {
    pub(crate) fn new(
        rows: &'a [LocalVar],
        inputs: &'a [LocalVar],
        outputs: Option<&'a [LocalVar]>,
    ) -> Self {
        Self {
            rows,
            inputs,
            outputs,
            blocks: BTreeMap::new(),
        }
    }

    /// Stores ∂of/∂wrt as an arbitrary operator, replacing any earlier block.
    pub fn set_operator(
        &mut self,
        of: &str,
        wrt: &str,
        op: Box<dyn LinearOperator>,
    ) -> Result<(), ComponentError> {
        let row = find_local(self.rows, of)
            .ok_or_else(|| anyhow!("partial derivative of unknown output '{of}'"))?;
        let (col, kind) = match find_local(self.inputs, wrt) {
            Some(var) => (var, VarKind::Input),
            None => match self.outputs.and_then(|outs| find_local(outs, wrt)) {
                Some(var) => (var, VarKind::Output),
                None => {
                    return Err(anyhow!(
                        "partial derivative of '{of}' with respect to unknown variable '{wrt}'"
                    )
                    .into())
                }
            },
        };
        let shape = op.shape();
        if shape != (row.size, col.size) {
            return Err(anyhow!(
                "partial ('{of}', '{wrt}') has shape {}x{} but {}x{} was expected",
                shape.0,
                shape.1,
                row.size,
                col.size
            )
            .into());
        }
        self.blocks.insert(
            (of.to_string(), wrt.to_string()),
            Block {
                row: row.offset,
                col: col.offset,
                wrt: kind,
                op,
            },
        );
        Ok(())
    }

    pub fn set_dense(&mut self, of: &str, wrt: &str, block: DMatrix<f64>) -> Result<(), ComponentError> {
        self.set_operator(of, wrt, Box::new(block))
    }

    /// Dense block given in row-major order.
    pub fn set_row_major(&mut self, of: &str, wrt: &str, data: &[f64]) -> Result<(), ComponentError> {
        let rows = find_local(self.rows, of).map(|v| v.size).unwrap_or(0);
        if rows == 0 || data.len() % rows != 0 {
            return Err(anyhow!(
                "partial ('{of}', '{wrt}'): {} entries do not fill whole rows",
                data.len()
            )
            .into());
        }
        let cols = data.len() / rows;
        self.set_dense(of, wrt, DMatrix::from_row_slice(rows, cols, data))
    }

    pub fn set_sparse(&mut self, of: &str, wrt: &str, block: CsrMatrix<f64>) -> Result<(), ComponentError> {
        self.set_operator(of, wrt, Box::new(block))
    }

    /// `value · I`; both variables must have the same size.
    pub fn set_diagonal(&mut self, of: &str, wrt: &str, value: f64) -> Result<(), ComponentError> {
        let size = find_local(self.rows, of).map(|v| v.size).unwrap_or(0);
        self.set_operator(of, wrt, Box::new(ScaledIdentity { size, scale: value }))
    }

    /// 1x1 block.
    pub fn set_scalar(&mut self, of: &str, wrt: &str, value: f64) -> Result<(), ComponentError> {
        self.set_dense(of, wrt, DMatrix::from_element(1, 1, value))
    }

    pub(crate) fn into_jacobian(self, explicit: bool) -> LocalJacobian {
        LocalJacobian {
            explicit,
            blocks: self.blocks.into_values().collect(),
        }
    }
}

/// Stored linearization of one component.
///
/// For explicit components the blocks hold ∂f/∂x and the residual Jacobian
/// is `[-∂f/∂x, I]`; for implicit components they hold ∂R/∂x and ∂R/∂y.
pub(crate) struct LocalJacobian {
    explicit: bool,
    blocks: Vec<Block>,
}

impl LocalJacobian {
    fn sign(&self) -> f64 {
        if self.explicit {
            -1.0
        } else {
            1.0
        }
    }

    /// y += (∂R/∂x) dp
    pub fn input_product(&self, dp: &[f64], y: &mut [f64]) {
        let sign = self.sign();
        for block in self.blocks.iter().filter(|b| b.wrt == VarKind::Input) {
            let (rows, cols) = block.op.shape();
            let mut tmp = vec![0.0; rows];
            block.op.apply(&dp[block.col..block.col + cols], &mut tmp);
            for (i, v) in tmp.into_iter().enumerate() {
                y[block.row + i] += sign * v;
            }
        }
    }

    /// dp += (∂R/∂x)ᵀ x
    pub fn input_product_t(&self, x: &[f64], dp: &mut [f64]) {
        let sign = self.sign();
        for block in self.blocks.iter().filter(|b| b.wrt == VarKind::Input) {
            let (rows, cols) = block.op.shape();
            let mut tmp = vec![0.0; cols];
            block.op.apply_transpose(&x[block.row..block.row + rows], &mut tmp);
            for (j, v) in tmp.into_iter().enumerate() {
                dp[block.col + j] += sign * v;
            }
        }
    }

    /// y += (∂R/∂y) du
    pub fn output_product(&self, du: &[f64], y: &mut [f64]) {
        if self.explicit {
            for (yi, di) in y.iter_mut().zip(du) {
                *yi += di;
            }
            return;
        }
        for block in self.blocks.iter().filter(|b| b.wrt == VarKind::Output) {
            let (rows, cols) = block.op.shape();
            block
                .op
                .apply(&du[block.col..block.col + cols], &mut y[block.row..block.row + rows]);
        }
    }

    /// du += (∂R/∂y)ᵀ x
    pub fn output_product_t(&self, x: &[f64], du: &mut [f64]) {
        if self.explicit {
            for (di, xi) in du.iter_mut().zip(x) {
                *di += xi;
            }
            return;
        }
        for block in self.blocks.iter().filter(|b| b.wrt == VarKind::Output) {
            let (rows, cols) = block.op.shape();
            block
                .op
                .apply_transpose(&x[block.row..block.row + rows], &mut du[block.col..block.col + cols]);
        }
    }

    /// ∂R/∂y as a dense `n x n` matrix.
    pub fn output_block(&self, n: usize) -> DMatrix<f64> {
        if self.explicit {
            return DMatrix::identity(n, n);
        }
        let mut dense = DMatrix::zeros(n, n);
        for block in self.blocks.iter().filter(|b| b.wrt == VarKind::Output) {
            let sub = block.op.to_dense();
            let mut target = dense.view_mut((block.row, block.col), sub.shape());
            target += &sub;
        }
        dense
    }
}

/// Runs `eval` at `base` with entry `index` shifted by `delta`.
fn perturbed<F>(base: &[f64], index: usize, delta: f64, eval: &mut F) -> Result<Vec<f64>, ComponentError>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, ComponentError>,
{
    let mut point = base.to_vec();
    point[index] += delta;
    eval(&point)
}

/// Finite-difference columns of `eval` with respect to every entry of `base`.
fn fd_columns<F>(
    settings: &FdSettings,
    base: &[f64],
    f0: &[f64],
    mut eval: F,
) -> Result<DMatrix<f64>, ComponentError>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, ComponentError>,
{
    let mut jac = DMatrix::zeros(f0.len(), base.len());
    for j in 0..base.len() {
        let h = settings.step_for(base[j]);
        let column: Vec<f64> = match settings.form {
            FdForm::Forward => {
                let fp = perturbed(base, j, h, &mut eval)?;
                fp.iter().zip(f0).map(|(a, b)| (a - b) / h).collect()
            }
            FdForm::Backward => {
                let fm = perturbed(base, j, -h, &mut eval)?;
                f0.iter().zip(&fm).map(|(a, b)| (a - b) / h).collect()
            }
            FdForm::Central => {
                let fp = perturbed(base, j, h, &mut eval)?;
                let fm = perturbed(base, j, -h, &mut eval)?;
                fp.iter().zip(&fm).map(|(a, b)| (a - b) / (2.0 * h)).collect()
            }
        };
        for (i, v) in column.into_iter().enumerate() {
            jac[(i, j)] = v;
        }
    }
    Ok(jac)
}

pub(crate) fn fd_explicit(
    component: &mut dyn ExplicitComponent,
    settings: &FdSettings,
    in_layout: &[LocalVar],
    out_layout: &[LocalVar],
    inputs: &[f64],
    outputs: &[f64],
) -> Result<LocalJacobian, ComponentError> {
    let mut eval = |x: &[f64]| -> Result<Vec<f64>, ComponentError> {
        let mut out = outputs.to_vec();
        component.compute(&Values::new(in_layout, x), &mut ValuesMut::new(out_layout, &mut out))?;
        Ok(out)
    };
    let f0 = eval(inputs)?;
    let jac = fd_columns(settings, inputs, &f0, &mut eval)?;
    Ok(LocalJacobian {
        explicit: true,
        blocks: vec![Block {
            row: 0,
            col: 0,
            wrt: VarKind::Input,
            op: Box::new(jac),
        }],
    })
}

pub(crate) fn fd_implicit(
    component: &mut dyn ImplicitComponent,
    settings: &FdSettings,
    in_layout: &[LocalVar],
    out_layout: &[LocalVar],
    inputs: &[f64],
    outputs: &[f64],
) -> Result<LocalJacobian, ComponentError> {
    let mut residual = |x: &[f64], y: &[f64]| -> Result<Vec<f64>, ComponentError> {
        let mut r = vec![0.0; y.len()];
        component.apply_nonlinear(
            &Values::new(in_layout, x),
            &Values::new(out_layout, y),
            &mut ValuesMut::new(out_layout, &mut r),
        )?;
        Ok(r)
    };
    let r0 = residual(inputs, outputs)?;
    let d_inputs = fd_columns(settings, inputs, &r0, |x| residual(x, outputs))?;
    let d_outputs = fd_columns(settings, outputs, &r0, |y| residual(inputs, y))?;
    Ok(LocalJacobian {
        explicit: false,
        blocks: vec![
            Block {
                row: 0,
                col: 0,
                wrt: VarKind::Input,
                op: Box::new(d_inputs),
            },
            Block {
                row: 0,
                col: 0,
                wrt: VarKind::Output,
                op: Box::new(d_outputs),
            },
        ],
    })
}
