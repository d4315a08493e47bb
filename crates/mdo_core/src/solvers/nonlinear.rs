//! Nonlinear solvers acting on one group.

use super::{within_tolerance, ConvergenceReport, NewtonSettings, NlgsSettings, NonlinearSolver, SolveState};
use crate::error::Result;
use crate::model::NodeRef;
use crate::runtime::Runtime;
use crate::traits::Mode;
use crate::vectors::axpy;
use std::time::Instant;
use tracing::{debug, info, warn};

pub(crate) fn solve(rt: &mut Runtime, group: usize) -> Result<ConvergenceReport> {
    let model = rt.model;
    match &model.groups[group].nonlinear {
        NonlinearSolver::RunOnce => run_once(rt, group),
        NonlinearSolver::NonlinearGaussSeidel(settings) => nlgs(rt, group, settings),
        NonlinearSolver::Newton(settings) => newton(rt, group, settings),
    }
}

fn run_once(rt: &mut Runtime, group: usize) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport::new("RUN_ONCE", &rt.model.groups[group].path);
    rt.run_children(group)?;
    report.iterations = 1;
    if let Some(message) = rt.checkpoint(group)? {
        return Ok(report.failed(message));
    }
    report.state = SolveState::Converged;
    Ok(report)
}

/// Residual norm of `group` after an optional pass over its children. An
/// analysis failure anywhere in the group reads as an infinite norm.
fn evaluate(rt: &mut Runtime, group: usize, run_children: bool) -> Result<(f64, Option<String>)> {
    if run_children {
        rt.run_children(group)?;
    }
    rt.apply_nonlinear(group)?;
    match rt.checkpoint(group)? {
        Some(message) => Ok((f64::INFINITY, Some(message))),
        None => Ok((rt.residual_norm(group)?, None)),
    }
}

fn finish_max_iter(mut report: ConvergenceReport) -> ConvergenceReport {
    report.state = SolveState::MaxIterExceeded;
    warn!(
        solver = %report.solver,
        path = %report.path,
        iterations = report.iterations,
        norm = report.norm,
        "failed to converge"
    );
    report
}

fn finish_converged(mut report: ConvergenceReport) -> ConvergenceReport {
    report.state = SolveState::Converged;
    info!(
        solver = %report.solver,
        path = %report.path,
        iterations = report.iterations,
        norm = report.norm,
        "converged"
    );
    report
}

fn finish_failed(report: ConvergenceReport, message: String) -> ConvergenceReport {
    warn!(solver = %report.solver, path = %report.path, %message, "solve aborted by an analysis error");
    report.failed(message)
}

/// Runs the children in order until the group's residuals settle.
fn nlgs(rt: &mut Runtime, group: usize, settings: &NlgsSettings) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport::new("NLGS", &rt.model.groups[group].path);
    let started = Instant::now();

    let (norm0, failure) = evaluate(rt, group, false)?;
    if let Some(message) = failure {
        return Ok(finish_failed(report, message));
    }
    report.norm0 = norm0;
    report.norm = norm0;
    if norm0 <= settings.atol {
        return Ok(finish_converged(report));
    }

    report.state = SolveState::Iterating;
    let mut streak = 0;
    while report.iterations < settings.maxiter {
        let (norm, failure) = evaluate(rt, group, true)?;
        report.iterations += 1;
        report.norm = norm;
        if let Some(message) = failure {
            return Ok(finish_failed(report, message));
        }
        rt.record(group, "NLGS", report.iterations, norm);
        debug!(solver = "NLGS", path = %report.path, iteration = report.iterations, norm, norm0);

        if within_tolerance(norm, norm0, settings.atol, settings.rtol) {
            return Ok(finish_converged(report));
        }
        if settings.divergence.check(norm, norm0, &mut streak) {
            report.state = SolveState::Diverged;
            return report.into_result();
        }
        if rt.time_expired(group, started, settings.time_limit)? {
            break;
        }
    }
    Ok(finish_max_iter(report))
}

/// Newton's method on the group's residuals with a backtracking line search.
fn newton(rt: &mut Runtime, group: usize, settings: &NewtonSettings) -> Result<ConvergenceReport> {
    let model = rt.model;
    let u = model.groups[group].u_range.clone();
    let ls = &settings.line_search;
    let mut report = ConvergenceReport::new("NEWTON", &model.groups[group].path);
    let started = Instant::now();

    let (norm0, failure) = evaluate(rt, group, settings.solve_subsystems)?;
    if let Some(message) = failure {
        return Ok(finish_failed(report, message));
    }
    report.norm0 = norm0;
    report.norm = norm0;
    if norm0 <= settings.atol {
        return Ok(finish_converged(report));
    }

    report.state = SolveState::Iterating;
    let mut streak = 0;
    while report.iterations < settings.maxiter {
        rt.linearize(group);
        rt.checkpoint_strict(group)?;
        let rhs: Vec<f64> = rt.state.vecs.r[u.clone()].iter().map(|r| -r).collect();
        let inner = rt.solve_linear(NodeRef::Group(group), Mode::Forward, &rhs)?;
        if !inner.converged() {
            warn!(
                solver = %inner.solver,
                path = %inner.path,
                iterations = inner.iterations,
                norm = inner.norm,
                "Newton step computed from an unconverged linear solve"
            );
        }
        let step = rt.solution(group, Mode::Forward).to_vec();

        let mut alpha = settings.alpha;
        axpy(&mut rt.state.vecs.u[u.clone()], alpha, &step);
        let (mut trial, mut failure) = evaluate(rt, group, settings.solve_subsystems)?;
        // Backtracking measures progress against the initial residual.
        let mut ls_iter = 0;
        while ls_iter < ls.maxiter && trial > ls.atol && trial / norm0 > ls.rtol {
            alpha *= 0.5;
            axpy(&mut rt.state.vecs.u[u.clone()], -alpha, &step);
            (trial, failure) = evaluate(rt, group, settings.solve_subsystems)?;
            ls_iter += 1;
            debug!(solver = "NEWTON", path = %report.path, ls_iter, alpha, norm = trial, "backtracking");
        }

        report.iterations += 1;
        let norm = trial;
        report.norm = norm;
        if let Some(message) = failure {
            return Ok(finish_failed(report, message));
        }
        rt.record(group, "NEWTON", report.iterations, norm);
        debug!(solver = "NEWTON", path = %report.path, iteration = report.iterations, norm, norm0);

        if within_tolerance(norm, norm0, settings.atol, settings.rtol) {
            return Ok(finish_converged(report));
        }
        if settings.divergence.check(norm, norm0, &mut streak) {
            report.state = SolveState::Diverged;
            return report.into_result();
        }
        if rt.time_expired(group, started, settings.time_limit)? {
            break;
        }
    }
    Ok(finish_max_iter(report))
}

#[cfg(test)]
mod tests {
    use crate::component::IndepVarComp;
    use crate::error::MdoError;
    use crate::group::Group;
    use crate::problem::Problem;
    use crate::recorder::MemoryRecorder;
    use crate::solvers::{
        BacktrackingSettings, DivergenceSettings, NewtonSettings, NlgsSettings, NonlinearSolver, SolveState,
    };
    use crate::testing::{Broken, Linear, Offset, Quadratic};

    /// `a.y = c + k b.y`, `b.y = a.y`
    fn cycle(c: f64, k: f64, solver: NonlinearSolver) -> Problem {
        let mut root = Group::new();
        root.add_explicit("a", Offset::new(c, k), &[])
            .add_explicit("b", Linear::new(1.0), &[])
            .connect("a.y", "b.x")
            .connect("b.y", "a.x")
            .set_nonlinear_solver(solver);
        Problem::new(root)
    }

    fn quadratic(x0: f64) -> (Problem, MemoryRecorder) {
        let mut root = Group::new();
        root.add_explicit("p", IndepVarComp::new().with_output("c", 4.0), &["c"])
            .add_implicit("q", Quadratic::new(), &["c"])
            .set_nonlinear_solver(NonlinearSolver::newton());
        let recorder = MemoryRecorder::new();
        let mut problem = Problem::new(root);
        problem.add_recorder(recorder.clone());
        problem.setup().unwrap();
        problem.set_variable("q.x", &[x0]).unwrap();
        (problem, recorder)
    }

    #[test]
    fn run_once_executes_chain_in_order() {
        let mut root = Group::new();
        root.add_explicit("p", IndepVarComp::new().with_output("x", 3.0), &[])
            .add_explicit("b", Linear::new(5.0), &[])
            .add_explicit("a", Linear::new(2.0), &[])
            .connect("p.x", "a.x")
            .connect("a.y", "b.x");
        let mut problem = Problem::new(root);
        problem.setup().unwrap();
        let report = problem.run_nonlinear().unwrap();
        assert!(report.converged());
        assert_eq!(report.iterations, 1);
        assert_eq!(problem.get_variable("b.y").unwrap(), vec![30.0]);
    }

    #[test]
    fn gauss_seidel_converges_on_contracting_cycle() {
        let settings = NlgsSettings {
            rtol: 1e-8,
            ..NlgsSettings::default()
        };
        let mut problem = cycle(1.0, -0.5, NonlinearSolver::NonlinearGaussSeidel(settings));
        problem.setup().unwrap();
        let report = problem.run_nonlinear().unwrap();
        assert!(report.converged());
        assert!(report.iterations <= 50);
        let y = problem.get_variable("a.y").unwrap()[0];
        assert!((y - 2.0 / 3.0).abs() < 1e-8);
        assert!((problem.get_variable("b.y").unwrap()[0] - y).abs() < 1e-8);
    }

    #[test]
    fn running_out_of_iterations_is_a_status() {
        let settings = NlgsSettings {
            maxiter: 3,
            ..NlgsSettings::default()
        };
        let mut problem = cycle(1.0, -0.5, NonlinearSolver::NonlinearGaussSeidel(settings));
        problem.setup().unwrap();
        let report = problem.run_nonlinear().unwrap();
        assert_eq!(report.state, SolveState::MaxIterExceeded);
        assert_eq!(report.iterations, 3);
        assert!(report.clone().into_result().is_err());
    }

    #[test]
    fn growing_residuals_abort_the_solve() {
        let settings = NlgsSettings {
            divergence: DivergenceSettings {
                factor: 10.0,
                consecutive: 2,
            },
            ..NlgsSettings::default()
        };
        let mut problem = cycle(1.0, 2.0, NonlinearSolver::NonlinearGaussSeidel(settings));
        problem.setup().unwrap();
        match problem.run_nonlinear() {
            Err(MdoError::Divergence { solver, iterations, .. }) => {
                assert_eq!(solver, "NLGS");
                assert_eq!(iterations, 5);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn newton_solves_implicit_component() {
        let (mut problem, _) = quadratic(1.0);
        let report = problem.run_nonlinear().unwrap();
        assert!(report.converged());
        assert!((problem.get_variable("q.x").unwrap()[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn newton_backtracks_out_of_failed_evaluation() {
        let (mut problem, recorder) = quadratic(0.5);
        let report = problem.run_nonlinear().unwrap();
        assert!(report.converged());
        assert!((problem.get_variable("q.x").unwrap()[0] - 2.0).abs() < 1e-9);

        // The full step lands at x = 4.25, where the residual cannot be
        // evaluated; one halving brings it back to 2.375.
        let first = &recorder.records()[0];
        assert_eq!(first.solver, "NEWTON");
        assert_eq!(first.iteration, 1);
        assert!((first.values[1] - 2.375).abs() < 1e-12);
        assert!((first.norm - 1.640625).abs() < 1e-12);
    }

    #[test]
    fn line_search_compares_against_initial_residual() {
        // Damped steps shrink the residual by just under 5% each. Every
        // trial beats 0.9483 of the starting residual, while the second
        // one is worse than 0.9483 of its predecessor.
        let settings = NewtonSettings {
            maxiter: 3,
            alpha: 0.05,
            line_search: BacktrackingSettings {
                rtol: 0.9483,
                ..BacktrackingSettings::default()
            },
            ..NewtonSettings::default()
        };
        let mut root = Group::new();
        root.add_explicit("p", IndepVarComp::new().with_output("c", 4.0), &["c"])
            .add_implicit("q", Quadratic::new(), &["c"])
            .set_nonlinear_solver(NonlinearSolver::Newton(settings));
        let mut problem = Problem::new(root);
        problem.setup().unwrap();
        problem.set_variable("q.x", &[1.0]).unwrap();
        let report = problem.run_nonlinear().unwrap();
        assert_eq!(report.state, SolveState::MaxIterExceeded);

        let mut x = 1.0_f64;
        for _ in 0..3 {
            x -= 0.05 * (x * x - 4.0) / (2.0 * x);
        }
        assert!((problem.get_variable("q.x").unwrap()[0] - x).abs() < 1e-12);
    }

    #[test]
    fn exhausted_time_budget_stops_iterating() {
        let settings = NlgsSettings {
            time_limit: Some(0.0),
            ..NlgsSettings::default()
        };
        let mut problem = cycle(1.0, -0.5, NonlinearSolver::NonlinearGaussSeidel(settings));
        problem.setup().unwrap();
        let report = problem.run_nonlinear().unwrap();
        assert_eq!(report.state, SolveState::MaxIterExceeded);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn analysis_error_fails_the_solve_without_erroring() {
        let mut root = Group::new();
        root.add_explicit("p", IndepVarComp::new().with_output("c", 4.0), &["c"])
            .add_implicit("q", Quadratic::new(), &["c"])
            .set_nonlinear_solver(NonlinearSolver::nlgs());
        let mut problem = Problem::new(root);
        problem.setup().unwrap();
        problem.set_variable("q.x", &[4.0]).unwrap();
        let report = problem.run_nonlinear().unwrap();
        assert_eq!(report.state, SolveState::NotConverged);
        assert!(report.failure.unwrap().contains("outside the valid range"));
    }

    #[test]
    fn fatal_component_error_propagates() {
        let mut root = Group::new();
        root.add_explicit("p", IndepVarComp::new().with_output("x", 1.0), &[])
            .add_explicit("broken", Broken, &[])
            .connect("p.x", "broken.x");
        let mut problem = Problem::new(root);
        problem.setup().unwrap();
        let err = problem.run_nonlinear().unwrap_err();
        assert!(matches!(&err, MdoError::Component { path, .. } if path == "broken"));
        assert!(err.to_string().contains("solver library crashed"));
    }

    #[test]
    fn iterations_are_recorded() {
        let mut problem = cycle(1.0, -0.5, NonlinearSolver::nlgs());
        let recorder = MemoryRecorder::new();
        problem.add_recorder(recorder.clone());
        problem.setup().unwrap();
        let report = problem.run_nonlinear().unwrap();

        let records = recorder.records();
        assert_eq!(records.len(), report.iterations + 1);
        assert!(records.iter().all(|r| r.path == "<root>" && r.values.len() == 2));
        assert!(records.windows(2).take(report.iterations - 1).all(|w| w[1].norm < w[0].norm));
    }
}
