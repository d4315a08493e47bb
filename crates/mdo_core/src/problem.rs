//! Driver-facing entry point: owns the model tree, its setup products and the
//! worker's communicator.
//!
//! In a multi-worker run every worker builds the same tree and makes the same
//! calls in the same order, each with its own communicator.

use crate::comm::{Communicator, SerialComm, TAG_BROADCAST};
use crate::component::Component;
use crate::error::{display_path, MdoError, Result};
use crate::group::{Group, GroupDef};
use crate::jacobian::{FdForm, FdSettings};
use crate::model::{Model, NodeRef};
use crate::recorder::Recorder;
use crate::registry::Registry;
use crate::runtime::{Runtime, Source, State};
use crate::solvers::{nonlinear, ConvergenceReport};
use crate::totals::{self, Totals, TotalsRequest};
use crate::variable::VarKind;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, info};

pub struct Problem {
    def: GroupDef,
    components: Vec<Component>,
    comm: Box<dyn Communicator>,
    recorders: Vec<Box<dyn Recorder>>,
    model: Option<Model>,
    state: Option<State>,
}

impl Problem {
    /// A single-worker problem.
    pub fn new(root: Group) -> Self {
        Self::with_comm(root, SerialComm)
    }

    pub fn with_comm(root: Group, comm: impl Communicator + 'static) -> Self {
        let mut components = Vec::new();
        let def = root.detach(&mut components);
        Self {
            def,
            components,
            comm: Box::new(comm),
            recorders: Vec::new(),
            model: None,
            state: None,
        }
    }

    pub fn add_recorder(&mut self, recorder: impl Recorder + 'static) -> &mut Self {
        self.recorders.push(Box::new(recorder));
        self
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Resolves names, connections, orders and worker ranges, and resets
    /// every variable to its declared default. Safe to call again.
    pub fn setup(&mut self) -> Result<()> {
        let model = Model::build(&self.def, &mut self.components, self.comm.size(), self.comm.rank())?;
        info!(
            variables = model.registry.variables().len(),
            components = model.comps.len(),
            groups = model.groups.len(),
            workers = self.comm.size(),
            "model set up"
        );
        self.state = Some(State::new(&model));
        self.model = Some(model);
        Ok(())
    }

    fn model(&self) -> Result<&Model> {
        self.model.as_ref().ok_or(MdoError::NotSetUp)
    }

    fn runtime(&mut self) -> Result<Runtime<'_>> {
        let (Some(model), Some(state)) = (&self.model, &mut self.state) else {
            return Err(MdoError::NotSetUp);
        };
        Ok(Runtime::new(
            model,
            &mut self.components,
            state,
            self.comm.as_ref(),
            &mut self.recorders,
        ))
    }

    pub fn registry(&self) -> Result<&Registry> {
        Ok(&self.model()?.registry)
    }

    /// Solves the whole model with the root group's nonlinear solver.
    ///
    /// Running out of iterations is reported in the returned status; a
    /// diverging solve or a fatal component error is an `Err`.
    pub fn run_nonlinear(&mut self) -> Result<ConvergenceReport> {
        let mut rt = self.runtime()?;
        let report = nonlinear::solve(&mut rt, 0)?;
        rt.record(0, &report.solver, report.iterations, report.norm);
        debug!(state = ?report.state, iterations = report.iterations, "root solve finished");
        Ok(report)
    }

    /// Totals of every `of` output with respect to every `wrt` variable, in
    /// the mode needing fewer linear solves.
    pub fn compute_totals(&mut self, of: &[&str], wrt: &[&str]) -> Result<Totals> {
        self.compute_totals_with(&TotalsRequest::new(of.iter().copied(), wrt.iter().copied()))
    }

    pub fn compute_totals_with(&mut self, request: &TotalsRequest) -> Result<Totals> {
        let mut rt = self.runtime()?;
        totals::compute(&mut rt, request)
    }

    /// Approximates the requested totals by finite differences of full
    /// nonlinear solves, then restores the original state.
    pub fn check_totals(&mut self, request: &TotalsRequest, settings: &FdSettings) -> Result<Totals> {
        let model = self.model()?;
        let of = totals::resolve_all(&model.registry, &request.of)?;
        let wrt = totals::resolve_all(&model.registry, &request.wrt)?;
        let of_entries: Vec<usize> = of.iter().flat_map(|s| s.entries.iter().copied()).collect();
        let wrt_entries: Vec<usize> = wrt.iter().flat_map(|s| s.entries.iter().copied()).collect();

        let mut rt = self.runtime()?;
        let base = rt.gather(&wrt_entries, Source::U)?;
        nonlinear::solve(&mut rt, 0)?.into_result()?;
        let f0 = rt.gather(&of_entries, Source::U)?;

        let mut jac = DMatrix::zeros(of_entries.len(), wrt_entries.len());
        for (k, (&entry, &x0)) in wrt_entries.iter().zip(&base).enumerate() {
            let h = settings.step_for(x0);
            let column = fd_column(&mut rt, settings.form, entry, x0, h, &of_entries, &f0);
            rt.state.vecs.u[entry] = x0;
            if column.is_err() {
                // Leave the model at its unperturbed solution.
                nonlinear::solve(&mut rt, 0)?;
            }
            jac.set_column(k, &DVector::from_vec(column?));
        }
        nonlinear::solve(&mut rt, 0)?.into_result()?;
        Ok(totals::split(&jac, &of, &wrt))
    }

    /// Current value of a variable, by absolute path or promoted name.
    /// Collective across all workers.
    pub fn get_variable(&self, name: &str) -> Result<Vec<f64>> {
        let model = self.model()?;
        let state = self.state.as_ref().ok_or(MdoError::NotSetUp)?;
        let var = model
            .registry
            .lookup(name)
            .ok_or_else(|| MdoError::UnknownVariable(name.to_string()))?;
        let info = model.registry.variable(var);
        let mut values = match info.kind {
            VarKind::Output => state.vecs.u[info.range()].to_vec(),
            VarKind::Input => state.vecs.p[info.range()].to_vec(),
        };
        let owner = model.comps[info.component].owner();
        self.comm
            .broadcast(owner, 0..self.comm.size(), &mut values, TAG_BROADCAST)?;
        Ok(values)
    }

    /// Sets an output, or the source feeding an input. Every worker must make
    /// the same call.
    pub fn set_variable(&mut self, name: &str, value: &[f64]) -> Result<()> {
        let model = self.model.as_ref().ok_or(MdoError::NotSetUp)?;
        let state = self.state.as_mut().ok_or(MdoError::NotSetUp)?;
        let var = model
            .registry
            .lookup(name)
            .ok_or_else(|| MdoError::UnknownVariable(name.to_string()))?;
        let info = model.registry.variable(var);
        if value.len() != info.size {
            return Err(MdoError::InvalidRequest(format!(
                "'{name}' has {} entries, but {} values were given",
                info.size,
                value.len()
            )));
        }
        for (entry, &v) in model.registry.source_entries(var).into_iter().zip(value) {
            state.vecs.u[entry] = v;
        }
        Ok(())
    }

    /// Worker range of every group and component, keyed by path.
    pub fn worker_ranges(&self) -> Result<BTreeMap<String, Range<usize>>> {
        let model = self.model()?;
        let groups = model
            .groups
            .iter()
            .map(|g| (display_path(&g.path).to_string(), g.workers.clone()));
        let comps = model.comps.iter().map(|c| (c.path.clone(), c.workers.clone()));
        Ok(groups.chain(comps).collect())
    }

    /// Resolved execution order of a group's children, as names.
    pub fn execution_order(&self, group: &str) -> Result<Vec<String>> {
        let model = self.model()?;
        let index = model
            .group_by_path(group)
            .ok_or_else(|| MdoError::InvalidRequest(format!("'{group}' is not a group of the model")))?;
        let plan = &model.groups[index];
        Ok(plan.order.iter().map(|&i| plan.child_names[i].clone()).collect())
    }

    /// Whether this worker runs the component or group at `path`.
    pub fn runs(&self, path: &str) -> Result<bool> {
        let model = self.model()?;
        let node = match model.group_by_path(path) {
            Some(g) => NodeRef::Group(g),
            None => model
                .comps
                .iter()
                .position(|c| c.path == path)
                .map(NodeRef::Component)
                .ok_or_else(|| MdoError::InvalidRequest(format!("'{path}' is not part of the model")))?,
        };
        Ok(model.workers(node).contains(&self.rank()))
    }
}

/// Outputs at `of` after solving with entry `entry` of `u` set to `value`.
/// One finite-difference column. Every perturbed solve must converge.
fn fd_column(
    rt: &mut Runtime,
    form: FdForm,
    entry: usize,
    x0: f64,
    h: f64,
    of: &[usize],
    f0: &[f64],
) -> Result<Vec<f64>> {
    Ok(match form {
        FdForm::Forward => {
            let f = solve_at(rt, entry, x0 + h, of)?;
            f.iter().zip(f0).map(|(a, b)| (a - b) / h).collect()
        }
        FdForm::Backward => {
            let f = solve_at(rt, entry, x0 - h, of)?;
            f0.iter().zip(&f).map(|(a, b)| (a - b) / h).collect()
        }
        FdForm::Central => {
            let plus = solve_at(rt, entry, x0 + h, of)?;
            let minus = solve_at(rt, entry, x0 - h, of)?;
            plus.iter().zip(&minus).map(|(a, b)| (a - b) / (2.0 * h)).collect()
        }
    })
}

fn solve_at(rt: &mut Runtime, entry: usize, value: f64, of: &[usize]) -> Result<Vec<f64>> {
    rt.state.vecs.u[entry] = value;
    nonlinear::solve(rt, 0)?.into_result()?;
    rt.gather(of, Source::U)
}
