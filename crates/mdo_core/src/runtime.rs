//! Execution engine for one worker: runs components, moves data between
//! them and exposes the group-level operations the solvers are built from.
//!
//! Component failures are not raised where they happen. They are kept until
//! the next [`Runtime::checkpoint`], where the group's workers agree on the
//! worst outcome so every worker takes the same branch.

use crate::comm::{Communicator, ReduceOp, TAG_REDUCE};
use crate::component::{Component, DerivativeMode};
use crate::error::{display_path, ComponentError, MdoError, Result};
use crate::jacobian::{fd_explicit, fd_implicit, LocalJacobian, Partials};
use crate::model::{Model, NodeRef};
use crate::recorder::{IterationRecord, Recorder};
use crate::solvers::{linear, nonlinear, ConvergenceReport, SolveState};
use crate::traits::Mode;
use crate::transfer::Phase;
use crate::variable::{Values, ValuesMut};
use crate::vectors::{axpy, zero, Vectors};
use anyhow::anyhow;
use nalgebra::{DMatrix, DVector, Dyn, LU};
use std::collections::HashMap;
use std::ops::Range;
use std::time::Instant;
use tracing::warn;

/// LU factors of an implicit component's ∂R/∂outputs and its transpose.
pub(crate) struct DiagonalLu {
    lu: LU<f64, Dyn, Dyn>,
    lu_t: LU<f64, Dyn, Dyn>,
}

/// Assembled Jacobian of one group, valid for one linearization.
pub(crate) struct DirectCache {
    pub epoch: u64,
    pub lu: LU<f64, Dyn, Dyn>,
    pub lu_t: LU<f64, Dyn, Dyn>,
}

/// Everything that survives between driver calls.
pub(crate) struct State {
    pub vecs: Vectors,
    jacobians: Vec<Option<LocalJacobian>>,
    diagonal: Vec<Option<DiagonalLu>>,
    pub direct: HashMap<usize, DirectCache>,
    /// Bumped on every linearization.
    pub epoch: u64,
}

impl State {
    pub fn new(model: &Model) -> Self {
        Self {
            vecs: Vectors::new(&model.registry),
            jacobians: (0..model.comps.len()).map(|_| None).collect(),
            diagonal: (0..model.comps.len()).map(|_| None).collect(),
            direct: HashMap::new(),
            epoch: 0,
        }
    }
}

enum Pending {
    Analysis(String),
    Fatal(MdoError),
}

impl Pending {
    fn code(&self) -> u8 {
        match self {
            Pending::Analysis(_) => 1,
            Pending::Fatal(_) => 2,
        }
    }
}

/// Which derivative vector a gather reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    U,
    Du,
    Dr,
}

pub(crate) struct Runtime<'a> {
    pub model: &'a Model,
    components: &'a mut [Component],
    pub state: &'a mut State,
    pub comm: &'a dyn Communicator,
    recorders: &'a mut [Box<dyn Recorder>],
    pending: Option<Pending>,
}

impl<'a> Runtime<'a> {
    pub fn new(
        model: &'a Model,
        components: &'a mut [Component],
        state: &'a mut State,
        comm: &'a dyn Communicator,
        recorders: &'a mut [Box<dyn Recorder>],
    ) -> Self {
        Self {
            model,
            components,
            state,
            comm,
            recorders,
            pending: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn runs(&self, node: NodeRef) -> bool {
        self.model.workers(node).contains(&self.rank())
    }

    fn local_comps(&self, node: NodeRef) -> impl Iterator<Item = usize> + 'a {
        let model = self.model;
        let rank = self.rank();
        model
            .comp_range(node)
            .filter(move |&c| model.comps[c].workers.contains(&rank))
    }

    // ---- failures ----

    fn defer(&mut self, failure: Pending) {
        let worse = match &self.pending {
            Some(current) => failure.code() > current.code(),
            None => true,
        };
        if worse {
            self.pending = Some(failure);
        }
    }

    /// Holds an error raised by a nested solve until the next checkpoint.
    pub fn defer_error(&mut self, err: MdoError) {
        if err.is_analysis() {
            self.defer(Pending::Analysis(err.to_string()));
        } else {
            self.defer(Pending::Fatal(err));
        }
    }

    fn defer_nonlinear(&mut self, c: usize, err: ComponentError) {
        let error = MdoError::from_component(&self.model.comps[c].path, err);
        self.defer_error(error);
    }

    fn defer_linear(&mut self, c: usize, err: ComponentError) {
        let error = MdoError::from_component(&self.model.comps[c].path, err);
        self.defer(Pending::Fatal(error));
    }

    /// Agrees on the pending failures of `group`'s workers. Fatal failures
    /// are returned as errors; an analysis failure is cleared and its message
    /// returned.
    pub fn checkpoint(&mut self, group: usize) -> Result<Option<String>> {
        let plan = &self.model.groups[group];
        let mut code = [self.pending.as_ref().map_or(0.0, |p| p.code() as f64)];
        self.comm
            .allreduce(plan.workers.clone(), &mut code, ReduceOp::Max, TAG_REDUCE)?;
        let pending = self.pending.take();
        match code[0] as u8 {
            0 => Ok(None),
            1 => Ok(Some(match pending {
                Some(Pending::Analysis(message)) => message,
                _ => format!(
                    "Analysis error on another worker of '{}'",
                    display_path(&plan.path)
                ),
            })),
            _ => Err(match pending {
                Some(Pending::Fatal(error)) => error,
                _ => MdoError::Communication(format!(
                    "a component of '{}' failed on another worker",
                    display_path(&plan.path)
                )),
            }),
        }
    }

    /// Like [`Runtime::checkpoint`], but any failure is an error.
    pub fn checkpoint_strict(&mut self, group: usize) -> Result<()> {
        match self.checkpoint(group)? {
            None => Ok(()),
            Some(message) => Err(MdoError::Analysis {
                path: display_path(&self.model.groups[group].path).to_string(),
                message,
            }),
        }
    }

    // ---- collectives ----

    /// Owned parts of `node`'s u slice, relative to its start.
    fn owned(&self, group: usize) -> Vec<Range<usize>> {
        let plan = &self.model.groups[group];
        let base = plan.u_range.start;
        let rank = self.rank();
        self.model.comps[plan.comps.clone()]
            .iter()
            .filter(|c| c.owner() == rank)
            .map(|c| c.u_range.start - base..c.u_range.end - base)
            .collect()
    }

    /// Euclidean norm over `group`'s u slice; `values` is relative to it.
    pub fn norm(&self, group: usize, values: &[f64]) -> Result<f64> {
        Ok(self.dot(group, values, values)?.sqrt())
    }

    pub fn dot(&self, group: usize, a: &[f64], b: &[f64]) -> Result<f64> {
        let mut sum = [0.0];
        for range in self.owned(group) {
            sum[0] += a[range.clone()].iter().zip(&b[range]).map(|(x, y)| x * y).sum::<f64>();
        }
        self.comm.allreduce(
            self.model.groups[group].workers.clone(),
            &mut sum,
            ReduceOp::Sum,
            TAG_REDUCE,
        )?;
        Ok(sum[0])
    }

    /// Keeps only owned entries, then sums across the group so every worker
    /// holds the complete vector.
    pub fn assemble(&self, group: usize, values: &[f64]) -> Result<Vec<f64>> {
        let mut full = vec![0.0; values.len()];
        for range in self.owned(group) {
            full[range.clone()].copy_from_slice(&values[range]);
        }
        self.comm.allreduce(
            self.model.groups[group].workers.clone(),
            &mut full,
            ReduceOp::Sum,
            TAG_REDUCE,
        )?;
        Ok(full)
    }

    /// True on every worker of `group` when it is true on any of them.
    pub fn any(&self, group: usize, flag: bool) -> Result<bool> {
        let mut value = [if flag { 1.0 } else { 0.0 }];
        self.comm.allreduce(
            self.model.groups[group].workers.clone(),
            &mut value,
            ReduceOp::Max,
            TAG_REDUCE,
        )?;
        Ok(value[0] > 0.0)
    }

    pub fn time_expired(&self, group: usize, started: Instant, limit: Option<f64>) -> Result<bool> {
        match limit {
            Some(limit) => self.any(group, started.elapsed().as_secs_f64() > limit),
            None => Ok(false),
        }
    }

    /// Values at absolute `entries` of a vector, read from their owners.
    pub fn gather(&self, entries: &[usize], source: Source) -> Result<Vec<f64>> {
        let rank = self.rank();
        let vector = match source {
            Source::U => &self.state.vecs.u,
            Source::Du => &self.state.vecs.du,
            Source::Dr => &self.state.vecs.dr,
        };
        let mut values: Vec<f64> = entries
            .iter()
            .map(|&i| match self.model.owner_of(i) {
                Some(owner) if owner == rank => vector[i],
                _ => 0.0,
            })
            .collect();
        self.comm.allreduce(
            self.model.groups[0].workers.clone(),
            &mut values,
            ReduceOp::Sum,
            TAG_REDUCE,
        )?;
        Ok(values)
    }

    pub fn record(&mut self, group: usize, solver: &str, iteration: usize, norm: f64) {
        if self.recorders.is_empty() {
            return;
        }
        let plan = &self.model.groups[group];
        let record = IterationRecord {
            rank: self.rank(),
            path: display_path(&plan.path).to_string(),
            solver: solver.to_string(),
            iteration,
            norm,
            values: self.state.vecs.u[plan.u_range.clone()].to_vec(),
        };
        for recorder in self.recorders.iter_mut() {
            recorder.record(&record);
        }
    }

    // ---- transfers ----

    /// Moves data into (or, in reverse, out of) child `child` of `group`.
    pub fn transfer(&mut self, group: usize, child: usize, phase: Phase) -> Result<()> {
        let model = self.model;
        let Some(set) = model.transfers.set(phase, group, child) else {
            return Ok(());
        };
        let v = &mut self.state.vecs;
        match phase {
            Phase::Nonlinear => set.run(self.comm, &v.u, &mut v.p, false),
            Phase::LinearForward => set.run(self.comm, &v.du, &mut v.dp, false),
            Phase::LinearReverse => set.run(self.comm, &v.dp, &mut v.du, true),
        }
    }

    /// Every transfer inside `group`, nested groups included.
    pub fn transfer_all(&mut self, group: usize, phase: Phase) -> Result<()> {
        let model = self.model;
        let plan = &model.groups[group];
        for child in 0..plan.children.len() {
            self.transfer(group, child, phase)?;
        }
        for &child in &plan.children {
            if let NodeRef::Group(sub) = child {
                if self.runs(child) {
                    self.transfer_all(sub, phase)?;
                }
            }
        }
        Ok(())
    }

    // ---- single components ----

    fn comp_compute(&mut self, c: usize) -> std::result::Result<(), ComponentError> {
        let plan = &self.model.comps[c];
        let v = &mut self.state.vecs;
        let inputs = Values::new(&plan.inputs, &v.p[plan.p_range.clone()]);
        let mut outputs = ValuesMut::new(&plan.outputs, &mut v.u[plan.u_range.clone()]);
        match &mut self.components[c] {
            Component::Explicit(comp) => comp.compute(&inputs, &mut outputs),
            Component::Implicit(comp) => comp.solve_nonlinear(&inputs, &mut outputs),
        }
    }

    fn comp_apply_nonlinear(&mut self, c: usize) -> std::result::Result<(), ComponentError> {
        let plan = &self.model.comps[c];
        let (u, p) = (plan.u_range.clone(), plan.p_range.clone());
        let v = &mut self.state.vecs;
        let inputs = Values::new(&plan.inputs, &v.p[p]);
        match &mut self.components[c] {
            Component::Explicit(comp) => {
                let mut computed = v.u[u.clone()].to_vec();
                comp.compute(&inputs, &mut ValuesMut::new(&plan.outputs, &mut computed))?;
                for ((r, y), f) in v.r[u.clone()].iter_mut().zip(&v.u[u]).zip(computed) {
                    *r = y - f;
                }
                Ok(())
            }
            Component::Implicit(comp) => {
                zero(&mut v.r, u.clone());
                let outputs = Values::new(&plan.outputs, &v.u[u.clone()]);
                comp.apply_nonlinear(&inputs, &outputs, &mut ValuesMut::new(&plan.outputs, &mut v.r[u]))
            }
        }
    }

    fn comp_linearize(&mut self, c: usize) -> std::result::Result<(), ComponentError> {
        let plan = &self.model.comps[c];
        let v = &self.state.vecs;
        let (inputs, outputs) = (&v.p[plan.p_range.clone()], &v.u[plan.u_range.clone()]);
        let jacobian = match (&mut self.components[c], plan.derivatives) {
            (Component::Implicit(comp), DerivativeMode::MatrixFree) => {
                let mut ignored = Partials::new(&plan.outputs, &plan.inputs, Some(&plan.outputs));
                comp.linearize(
                    &Values::new(&plan.inputs, inputs),
                    &Values::new(&plan.outputs, outputs),
                    &mut ignored,
                )?;
                None
            }
            (Component::Explicit(_), DerivativeMode::MatrixFree) => None,
            (Component::Explicit(comp), DerivativeMode::FiniteDifference(settings)) => Some(fd_explicit(
                comp.as_mut(),
                &settings,
                &plan.inputs,
                &plan.outputs,
                inputs,
                outputs,
            )?),
            (Component::Implicit(comp), DerivativeMode::FiniteDifference(settings)) => Some(fd_implicit(
                comp.as_mut(),
                &settings,
                &plan.inputs,
                &plan.outputs,
                inputs,
                outputs,
            )?),
            (Component::Explicit(comp), DerivativeMode::Partials) => {
                let mut partials = Partials::new(&plan.outputs, &plan.inputs, None);
                comp.compute_partials(&Values::new(&plan.inputs, inputs), &mut partials)?;
                Some(partials.into_jacobian(true))
            }
            (Component::Implicit(comp), DerivativeMode::Partials) => {
                let mut partials = Partials::new(&plan.outputs, &plan.inputs, Some(&plan.outputs));
                comp.linearize(
                    &Values::new(&plan.inputs, inputs),
                    &Values::new(&plan.outputs, outputs),
                    &mut partials,
                )?;
                Some(partials.into_jacobian(false))
            }
        };

        self.state.diagonal[c] = match &jacobian {
            Some(jac) if !plan.explicit => {
                let block = jac.output_block(plan.u_range.len());
                Some(DiagonalLu {
                    lu_t: block.transpose().lu(),
                    lu: block.lu(),
                })
            }
            _ => None,
        };
        self.state.jacobians[c] = jacobian;
        Ok(())
    }

    /// `A_p dp_c`, plus `A_u du_c` when `with_outputs`, over the component's
    /// residual rows.
    fn comp_forward(&mut self, c: usize, with_outputs: bool) -> std::result::Result<Vec<f64>, ComponentError> {
        let plan = &self.model.comps[c];
        let (u, p) = (plan.u_range.clone(), plan.p_range.clone());
        let v = &self.state.vecs;
        let mut y = vec![0.0; u.len()];
        if plan.derivatives != DerivativeMode::MatrixFree {
            let jac = self.state.jacobians[c]
                .as_ref()
                .ok_or_else(|| anyhow!("no linearization available"))?;
            jac.input_product(&v.dp[p], &mut y);
            if with_outputs {
                jac.output_product(&v.du[u], &mut y);
            }
            return Ok(y);
        }

        let inputs = Values::new(&plan.inputs, &v.p[p.clone()]);
        let mut d_inputs = v.dp[p].to_vec();
        match &mut self.components[c] {
            Component::Explicit(comp) => {
                let mut jv = vec![0.0; u.len()];
                comp.compute_jacvec_product(
                    &inputs,
                    &mut ValuesMut::new(&plan.inputs, &mut d_inputs),
                    &mut ValuesMut::new(&plan.outputs, &mut jv),
                    Mode::Forward,
                )?;
                for (i, yi) in y.iter_mut().enumerate() {
                    *yi = -jv[i];
                }
                if with_outputs {
                    axpy(&mut y, 1.0, &v.du[u]);
                }
            }
            Component::Implicit(comp) => {
                let mut d_outputs = if with_outputs {
                    v.du[u.clone()].to_vec()
                } else {
                    vec![0.0; u.len()]
                };
                comp.apply_linear(
                    &inputs,
                    &Values::new(&plan.outputs, &v.u[u]),
                    &mut ValuesMut::new(&plan.inputs, &mut d_inputs),
                    &mut ValuesMut::new(&plan.outputs, &mut d_outputs),
                    &mut ValuesMut::new(&plan.outputs, &mut y),
                    Mode::Forward,
                )?;
            }
        }
        Ok(y)
    }

    /// `dp_c = A_pᵀ dr_c`, and `du_c += A_uᵀ dr_c` when `with_outputs`.
    fn comp_reverse(&mut self, c: usize, with_outputs: bool) -> std::result::Result<(), ComponentError> {
        let plan = &self.model.comps[c];
        let (u, p) = (plan.u_range.clone(), plan.p_range.clone());
        let state = &mut *self.state;
        let v = &mut state.vecs;
        zero(&mut v.dp, p.clone());
        if plan.derivatives != DerivativeMode::MatrixFree {
            let jac = state.jacobians[c]
                .as_ref()
                .ok_or_else(|| anyhow!("no linearization available"))?;
            jac.input_product_t(&v.dr[u.clone()], &mut v.dp[p]);
            if with_outputs {
                jac.output_product_t(&v.dr[u.clone()], &mut v.du[u]);
            }
            return Ok(());
        }

        let inputs = Values::new(&plan.inputs, &v.p[p.clone()]);
        match &mut self.components[c] {
            Component::Explicit(comp) => {
                let mut jt = vec![0.0; p.len()];
                let mut d_outputs = v.dr[u.clone()].to_vec();
                comp.compute_jacvec_product(
                    &inputs,
                    &mut ValuesMut::new(&plan.inputs, &mut jt),
                    &mut ValuesMut::new(&plan.outputs, &mut d_outputs),
                    Mode::Reverse,
                )?;
                for (d, j) in v.dp[p].iter_mut().zip(jt) {
                    *d = -j;
                }
                if with_outputs {
                    let dr = v.dr[u.clone()].to_vec();
                    axpy(&mut v.du[u], 1.0, &dr);
                }
            }
            Component::Implicit(comp) => {
                let mut d_outputs = vec![0.0; u.len()];
                let mut d_residuals = v.dr[u.clone()].to_vec();
                comp.apply_linear(
                    &inputs,
                    &Values::new(&plan.outputs, &v.u[u.clone()]),
                    &mut ValuesMut::new(&plan.inputs, &mut v.dp[p]),
                    &mut ValuesMut::new(&plan.outputs, &mut d_outputs),
                    &mut ValuesMut::new(&plan.outputs, &mut d_residuals),
                    Mode::Reverse,
                )?;
                if with_outputs {
                    axpy(&mut v.du[u], 1.0, &d_outputs);
                }
            }
        }
        Ok(())
    }

    /// Forward: `du_c = A_u⁻¹ rhs`. Reverse: `dr_c = A_u⁻ᵀ rhs`.
    fn comp_solve_linear(&mut self, c: usize, mode: Mode, rhs: &[f64]) -> std::result::Result<(), ComponentError> {
        let plan = &self.model.comps[c];
        let u = plan.u_range.clone();
        if u.is_empty() {
            return Ok(());
        }
        let v = &mut self.state.vecs;
        if plan.explicit {
            let x = match mode {
                Mode::Forward => &mut v.du,
                Mode::Reverse => &mut v.dr,
            };
            x[u].copy_from_slice(rhs);
            return Ok(());
        }

        if plan.derivatives == DerivativeMode::MatrixFree {
            match mode {
                Mode::Forward => v.dr[u.clone()].copy_from_slice(rhs),
                Mode::Reverse => v.du[u.clone()].copy_from_slice(rhs),
            }
            let (du, dr) = (&mut v.du[u.clone()], &mut v.dr[u]);
            return match &mut self.components[c] {
                Component::Implicit(comp) => comp.solve_linear(
                    &mut ValuesMut::new(&plan.outputs, du),
                    &mut ValuesMut::new(&plan.outputs, dr),
                    mode,
                ),
                Component::Explicit(_) => Ok(()),
            };
        }

        let factors = self.state.diagonal[c]
            .as_ref()
            .ok_or_else(|| anyhow!("no linearization available"))?;
        let b = DVector::from_column_slice(rhs);
        let (lu, x) = match mode {
            Mode::Forward => (&factors.lu, &mut self.state.vecs.du),
            Mode::Reverse => (&factors.lu_t, &mut self.state.vecs.dr),
        };
        let solution = lu
            .solve(&b)
            .ok_or_else(|| anyhow!("the Jacobian of the residuals with respect to the outputs is singular"))?;
        x[u].copy_from_slice(solution.as_slice());
        Ok(())
    }

    // ---- group operations ----

    /// Runs `node`'s own nonlinear solve. Components report failures through
    /// the next checkpoint.
    pub fn solve_nonlinear(&mut self, node: NodeRef) -> Result<Option<ConvergenceReport>> {
        match node {
            NodeRef::Component(c) => {
                if let Err(err) = self.comp_compute(c) {
                    self.defer_nonlinear(c, err);
                }
                Ok(None)
            }
            NodeRef::Group(g) => nonlinear::solve(self, g).map(Some),
        }
    }

    /// One pass over the children in execution order, moving inputs in just
    /// before each child runs.
    pub fn run_children(&mut self, group: usize) -> Result<()> {
        let model = self.model;
        let plan = &model.groups[group];
        for &index in &plan.order {
            let child = plan.children[index];
            self.transfer(group, index, Phase::Nonlinear)?;
            if !self.runs(child) {
                continue;
            }
            match self.solve_nonlinear(child) {
                Ok(Some(report)) => {
                    if let Some(message) = report.failure {
                        self.defer(Pending::Analysis(message));
                    } else if !report.converged() {
                        warn!(
                            solver = %report.solver,
                            path = %report.path,
                            iterations = report.iterations,
                            norm = report.norm,
                            "subsystem solve did not converge"
                        );
                    }
                }
                Ok(None) => {}
                Err(err @ MdoError::Communication(_)) => return Err(err),
                Err(err) => self.defer_error(err),
            }
        }
        Ok(())
    }

    /// Residuals of every local component in `group` at the current state.
    pub fn apply_nonlinear(&mut self, group: usize) -> Result<()> {
        self.transfer_all(group, Phase::Nonlinear)?;
        for c in self.local_comps(NodeRef::Group(group)) {
            if let Err(err) = self.comp_apply_nonlinear(c) {
                self.defer_nonlinear(c, err);
            }
        }
        Ok(())
    }

    pub fn residual_norm(&self, group: usize) -> Result<f64> {
        let range = self.model.groups[group].u_range.clone();
        self.norm(group, &self.state.vecs.r[range])
    }

    /// Refreshes the local Jacobians of `group`'s components; failures are
    /// reported at the next checkpoint.
    pub fn linearize(&mut self, group: usize) {
        for c in self.local_comps(NodeRef::Group(group)) {
            if let Err(err) = self.comp_linearize(c) {
                self.defer_linear(c, err);
            }
        }
        self.state.epoch += 1;
    }

    /// Forward: `dr = A du` over `group`. Reverse: `du = Aᵀ dr`.
    pub fn apply_linear(&mut self, group: usize, mode: Mode) -> Result<()> {
        let plan = &self.model.groups[group];
        match mode {
            Mode::Forward => {
                zero(&mut self.state.vecs.dp, plan.p_range.clone());
                self.transfer_all(group, Phase::LinearForward)?;
                for c in self.local_comps(NodeRef::Group(group)) {
                    match self.comp_forward(c, true) {
                        Ok(y) => {
                            let u = self.model.comps[c].u_range.clone();
                            self.state.vecs.dr[u].copy_from_slice(&y);
                        }
                        Err(err) => self.defer_linear(c, err),
                    }
                }
            }
            Mode::Reverse => {
                zero(&mut self.state.vecs.du, plan.u_range.clone());
                for c in self.local_comps(NodeRef::Group(group)) {
                    if let Err(err) = self.comp_reverse(c, true) {
                        self.defer_linear(c, err);
                    }
                }
                self.transfer_all(group, Phase::LinearReverse)?;
            }
        }
        Ok(())
    }

    /// Coupling from already-transferred `dp` into `node`'s rows:
    /// `A_p dp` over its local components, relative to its u slice.
    pub fn input_coupling(&mut self, node: NodeRef) -> Vec<f64> {
        let base = self.model.u_range(node);
        let mut y = vec![0.0; base.len()];
        for c in self.local_comps(node) {
            match self.comp_forward(c, false) {
                Ok(values) => {
                    let start = self.model.comps[c].u_range.start - base.start;
                    y[start..start + values.len()].copy_from_slice(&values);
                }
                Err(err) => self.defer_linear(c, err),
            }
        }
        y
    }

    /// `dp = A_pᵀ dr` for `node`'s local components.
    pub fn input_adjoint(&mut self, node: NodeRef) {
        for c in self.local_comps(node) {
            if let Err(err) = self.comp_reverse(c, false) {
                self.defer_linear(c, err);
            }
        }
    }

    /// Solves `node`'s diagonal block: forward `A x = rhs` into `du`,
    /// reverse `Aᵀ x = rhs` into `dr`.
    pub fn solve_linear(&mut self, node: NodeRef, mode: Mode, rhs: &[f64]) -> Result<ConvergenceReport> {
        match node {
            NodeRef::Component(c) => {
                if self.runs(node) {
                    if let Err(err) = self.comp_solve_linear(c, mode, rhs) {
                        self.defer_linear(c, err);
                    }
                }
                let mut report = ConvergenceReport::new("DIAGONAL", &self.model.comps[c].path);
                report.state = SolveState::Converged;
                report.iterations = 1;
                Ok(report)
            }
            NodeRef::Group(g) => {
                let model = self.model;
                linear::solve(self, &model.groups[g].linear, g, mode, rhs)
            }
        }
    }

    /// The solution vector of a linear solve in `mode`, over `group`.
    pub fn solution(&self, group: usize, mode: Mode) -> &[f64] {
        let range = self.model.groups[group].u_range.clone();
        match mode {
            Mode::Forward => &self.state.vecs.du[range],
            Mode::Reverse => &self.state.vecs.dr[range],
        }
    }

    pub fn solution_mut(&mut self, group: usize, mode: Mode) -> &mut [f64] {
        let range = self.model.groups[group].u_range.clone();
        match mode {
            Mode::Forward => &mut self.state.vecs.du[range],
            Mode::Reverse => &mut self.state.vecs.dr[range],
        }
    }

    /// Where `apply_linear` leaves its product.
    pub fn product(&self, group: usize, mode: Mode) -> &[f64] {
        self.solution(group, mode.flip())
    }

    /// Dense matrix of `group`'s linear operator, assembled column by column.
    pub fn assemble_matrix(&mut self, group: usize) -> Result<DMatrix<f64>> {
        let n = self.model.groups[group].u_range.len();
        let mut matrix = DMatrix::zeros(n, n);
        for j in 0..n {
            let x = self.solution_mut(group, Mode::Forward);
            x.iter_mut().for_each(|v| *v = 0.0);
            x[j] = 1.0;
            self.apply_linear(group, Mode::Forward)?;
            let column = self.assemble(group, self.product(group, Mode::Forward))?;
            matrix.set_column(j, &DVector::from_vec(column));
        }
        Ok(matrix)
    }
}
