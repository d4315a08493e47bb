//! Total derivatives of model outputs with respect to design variables.
//!
//! One linear solve of the root group runs per selected `wrt` entry in
//! forward mode, or per selected `of` entry in reverse mode. Automatic mode
//! picks whichever needs fewer solves.

use crate::error::{MdoError, Result};
use crate::model::NodeRef;
use crate::registry::Registry;
use crate::runtime::{Runtime, Source};
use crate::solvers::ConvergenceReport;
use crate::traits::Mode;
use nalgebra::DMatrix;
use std::collections::BTreeMap;
use tracing::debug;

/// Blocks of the total Jacobian keyed by `(of, wrt)` as requested.
pub type Totals = BTreeMap<(String, String), DMatrix<f64>>;

/// A variable, optionally restricted to some of its flat entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub name: String,
    pub indices: Option<Vec<usize>>,
}

impl Selection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indices: None,
        }
    }

    pub fn indexed(name: &str, indices: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            indices: Some(indices.to_vec()),
        }
    }
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Selection::new(name)
    }
}

impl From<String> for Selection {
    fn from(name: String) -> Self {
        Self { name, indices: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TotalsRequest {
    pub of: Vec<Selection>,
    pub wrt: Vec<Selection>,
    /// `None` picks the mode needing fewer linear solves.
    pub mode: Option<Mode>,
}

impl TotalsRequest {
    pub fn new<O, W>(of: impl IntoIterator<Item = O>, wrt: impl IntoIterator<Item = W>) -> Self
    where
        O: Into<Selection>,
        W: Into<Selection>,
    {
        Self {
            of: of.into_iter().map(Into::into).collect(),
            wrt: wrt.into_iter().map(Into::into).collect(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// A selection resolved to absolute entries of the output vector.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub name: String,
    pub entries: Vec<usize>,
}

pub(crate) fn resolve(registry: &Registry, selection: &Selection) -> Result<Resolved> {
    let var = registry
        .lookup(&selection.name)
        .ok_or_else(|| MdoError::UnknownVariable(selection.name.clone()))?;
    let all = registry.source_entries(var);
    let entries = match &selection.indices {
        None => all,
        Some(indices) => indices
            .iter()
            .map(|&i| {
                all.get(i).copied().ok_or_else(|| {
                    MdoError::InvalidRequest(format!(
                        "index {i} is out of range for '{}' with {} entries",
                        selection.name,
                        all.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?,
    };
    Ok(Resolved {
        name: selection.name.clone(),
        entries,
    })
}

pub(crate) fn resolve_all(registry: &Registry, selections: &[Selection]) -> Result<Vec<Resolved>> {
    selections.iter().map(|s| resolve(registry, s)).collect()
}

/// Forward if there are no more inputs than outputs, else reverse.
pub(crate) fn auto_mode(n_of: usize, n_wrt: usize) -> Mode {
    if n_wrt <= n_of {
        Mode::Forward
    } else {
        Mode::Reverse
    }
}

fn flatten(selections: &[Resolved]) -> Vec<usize> {
    selections.iter().flat_map(|s| s.entries.iter().copied()).collect()
}

/// Cuts a full Jacobian into named blocks.
pub(crate) fn split(jac: &DMatrix<f64>, of: &[Resolved], wrt: &[Resolved]) -> Totals {
    let mut totals = Totals::new();
    let mut row = 0;
    for o in of {
        let mut col = 0;
        for w in wrt {
            let block = DMatrix::from_fn(o.entries.len(), w.entries.len(), |i, j| jac[(row + i, col + j)]);
            totals.insert((o.name.clone(), w.name.clone()), block);
            col += w.entries.len();
        }
        row += o.entries.len();
    }
    totals
}

fn require_converged(report: ConvergenceReport, mode: Mode) -> Result<()> {
    if report.converged() {
        return Ok(());
    }
    Err(MdoError::DerivativeFailure {
        solver: report.solver,
        path: report.path,
        mode: mode.to_string(),
        iterations: report.iterations,
        norm: report.norm,
    })
}

pub(crate) fn compute(rt: &mut Runtime, request: &TotalsRequest) -> Result<Totals> {
    let model = rt.model;
    let of = resolve_all(&model.registry, &request.of)?;
    let wrt = resolve_all(&model.registry, &request.wrt)?;
    let of_entries = flatten(&of);
    let wrt_entries = flatten(&wrt);
    let mode = request
        .mode
        .unwrap_or_else(|| auto_mode(of_entries.len(), wrt_entries.len()));
    debug!(%mode, of = of_entries.len(), wrt = wrt_entries.len(), "computing totals");

    rt.linearize(0);
    rt.checkpoint_strict(0)?;

    let n = model.groups[0].u_range.len();
    let root = NodeRef::Group(0);
    let mut jac = DMatrix::zeros(of_entries.len(), wrt_entries.len());
    match mode {
        Mode::Forward => {
            for (k, &col) in wrt_entries.iter().enumerate() {
                let mut rhs = vec![0.0; n];
                rhs[col] = 1.0;
                require_converged(rt.solve_linear(root, mode, &rhs)?, mode)?;
                for (i, value) in rt.gather(&of_entries, Source::Du)?.into_iter().enumerate() {
                    jac[(i, k)] = value;
                }
            }
        }
        Mode::Reverse => {
            for (i, &row) in of_entries.iter().enumerate() {
                let mut rhs = vec![0.0; n];
                rhs[row] = 1.0;
                require_converged(rt.solve_linear(root, mode, &rhs)?, mode)?;
                for (k, value) in rt.gather(&wrt_entries, Source::Dr)?.into_iter().enumerate() {
                    jac[(i, k)] = value;
                }
            }
        }
    }
    Ok(split(&jac, &of, &wrt))
}
