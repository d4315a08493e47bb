//! Linear solvers for `A x = b` (forward) and `Aᵀ x = b` (reverse) on one
//! group, where `A` is the group's residual Jacobian.
//!
//! `b` is laid out like the group's slice of the output vector. The solution
//! lands in `du` (forward) or `dr` (reverse).

use super::{within_tolerance, ConvergenceReport, GmresSettings, LgsSettings, LinearSolver, SolveState};
use crate::error::{MdoError, Result};
use crate::model::NodeRef;
use crate::runtime::{DirectCache, Runtime};
use crate::traits::Mode;
use crate::transfer::Phase;
use crate::vectors::{axpy, zero};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

pub(crate) fn solve(
    rt: &mut Runtime,
    solver: &LinearSolver,
    group: usize,
    mode: Mode,
    rhs: &[f64],
) -> Result<ConvergenceReport> {
    match solver {
        LinearSolver::RunOnce => gauss_seidel(rt, group, mode, rhs, None),
        LinearSolver::GaussSeidel(settings) => gauss_seidel(rt, group, mode, rhs, Some(settings)),
        LinearSolver::Gmres(settings) => gmres(rt, group, mode, rhs, settings),
        LinearSolver::Direct => direct(rt, group, mode, rhs),
    }
}

/// Solves a child's block, holding on to its error until the group's next
/// checkpoint so every worker of the group fails together.
fn solve_child(rt: &mut Runtime, child: NodeRef, mode: Mode, rhs: &[f64]) -> Result<bool> {
    match rt.solve_linear(child, mode, rhs) {
        Ok(report) => Ok(report.converged()),
        Err(err @ MdoError::Communication(_)) => Err(err),
        Err(err) => {
            rt.defer_error(err);
            Ok(false)
        }
    }
}

/// One block forward substitution in execution order. Returns whether every
/// child solve this worker ran converged.
fn sweep_forward(rt: &mut Runtime, group: usize, rhs: &[f64]) -> Result<bool> {
    let model = rt.model;
    let plan = &model.groups[group];
    let base = plan.u_range.start;
    let mut converged = true;
    for &index in &plan.order {
        let child = plan.children[index];
        zero(&mut rt.state.vecs.dp, model.p_range(child));
        rt.transfer(group, index, Phase::LinearForward)?;
        if !rt.runs(child) {
            continue;
        }
        let range = model.u_range(child);
        let coupling = rt.input_coupling(child);
        let local: Vec<f64> = rhs[range.start - base..range.end - base]
            .iter()
            .zip(coupling)
            .map(|(b, y)| b - y)
            .collect();
        converged &= solve_child(rt, child, Mode::Forward, &local)?;
    }
    Ok(converged)
}

/// One block backward substitution in reverse execution order.
fn sweep_reverse(rt: &mut Runtime, group: usize, rhs: &[f64]) -> Result<bool> {
    let model = rt.model;
    let plan = &model.groups[group];
    let base = plan.u_range.start;
    let mut converged = true;
    for &index in plan.order.iter().rev() {
        let child = plan.children[index];
        let range = model.u_range(child);
        zero(&mut rt.state.vecs.du, range.clone());
        rt.transfer(group, index, Phase::LinearReverse)?;
        if !rt.runs(child) {
            continue;
        }
        let local: Vec<f64> = rhs[range.start - base..range.end - base]
            .iter()
            .zip(&rt.state.vecs.du[range.clone()])
            .map(|(b, y)| b - y)
            .collect();
        converged &= solve_child(rt, child, Mode::Reverse, &local)?;
        rt.input_adjoint(child);
    }
    Ok(converged)
}

fn sweep(rt: &mut Runtime, group: usize, mode: Mode, rhs: &[f64]) -> Result<bool> {
    match mode {
        Mode::Forward => sweep_forward(rt, group, rhs),
        Mode::Reverse => sweep_reverse(rt, group, rhs),
    }
}

/// `b - A x` for the current solution.
fn residual(rt: &mut Runtime, group: usize, mode: Mode, rhs: &[f64]) -> Result<Vec<f64>> {
    rt.apply_linear(group, mode)?;
    rt.checkpoint_strict(group)?;
    Ok(rhs.iter().zip(rt.product(group, mode)).map(|(b, y)| b - y).collect())
}

/// Block Gauss-Seidel. Without settings this is a single sweep, exact when
/// the group's blocks are triangular in execution order.
fn gauss_seidel(
    rt: &mut Runtime,
    group: usize,
    mode: Mode,
    rhs: &[f64],
    settings: Option<&LgsSettings>,
) -> Result<ConvergenceReport> {
    let model = rt.model;
    let plan = &model.groups[group];
    let name = if settings.is_some() { "LN_GS" } else { "LN_RUN_ONCE" };
    let mut report = ConvergenceReport::new(name, &plan.path);

    rt.solution_mut(group, mode).iter_mut().for_each(|x| *x = 0.0);
    zero(&mut rt.state.vecs.dp, plan.p_range.clone());

    let Some(settings) = settings else {
        let children_converged = sweep(rt, group, mode, rhs)?;
        rt.checkpoint_strict(group)?;
        report.iterations = 1;
        if !rt.any(group, !children_converged)? {
            report.state = SolveState::Converged;
        }
        return Ok(report);
    };

    let norm0 = rt.norm(group, rhs)?;
    report.norm0 = norm0;
    if norm0 <= settings.atol {
        report.state = SolveState::Converged;
        return Ok(report);
    }

    report.state = SolveState::Iterating;
    while report.iterations < settings.maxiter {
        sweep(rt, group, mode, rhs)?;
        report.iterations += 1;
        let r = residual(rt, group, mode, rhs)?;
        report.norm = rt.norm(group, &r)?;
        debug!(solver = name, path = %report.path, %mode, iteration = report.iterations, norm = report.norm);
        if within_tolerance(report.norm, norm0, settings.atol, settings.rtol) {
            report.state = SolveState::Converged;
            return Ok(report);
        }
    }
    report.state = SolveState::MaxIterExceeded;
    Ok(report)
}

/// `A x` (forward) or `Aᵀ x` (reverse) on the group's slice.
fn operator(rt: &mut Runtime, group: usize, mode: Mode, x: &[f64]) -> Result<Vec<f64>> {
    rt.solution_mut(group, mode).copy_from_slice(x);
    rt.apply_linear(group, mode)?;
    rt.checkpoint_strict(group)?;
    Ok(rt.product(group, mode).to_vec())
}

fn precondition(
    rt: &mut Runtime,
    group: usize,
    mode: Mode,
    v: &[f64],
    preconditioner: Option<&LinearSolver>,
) -> Result<Vec<f64>> {
    match preconditioner {
        Some(solver) => {
            solve(rt, solver, group, mode, v)?;
            Ok(rt.solution(group, mode).to_vec())
        }
        None => Ok(v.to_vec()),
    }
}

fn givens(a: f64, b: f64) -> (f64, f64) {
    let r = a.hypot(b);
    if r == 0.0 {
        (1.0, 0.0)
    } else {
        (a / r, b / r)
    }
}

/// Restarted GMRES with optional right preconditioning, from a zero guess.
fn gmres(
    rt: &mut Runtime,
    group: usize,
    mode: Mode,
    rhs: &[f64],
    settings: &GmresSettings,
) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport::new("GMRES", &rt.model.groups[group].path);
    let preconditioner = settings.preconditioner.as_deref();
    let n = rhs.len();
    let m = settings.restart.max(1);

    let bnorm = rt.norm(group, rhs)?;
    report.norm0 = bnorm;
    report.norm = bnorm;
    let tol = settings.atol.max(settings.rtol * bnorm);
    let mut x = vec![0.0; n];
    if bnorm <= tol {
        rt.solution_mut(group, mode).copy_from_slice(&x);
        report.state = SolveState::Converged;
        return Ok(report);
    }

    report.state = SolveState::Iterating;
    let mut r = rhs.to_vec();
    let mut beta = bnorm;
    while report.iterations < settings.maxiter {
        let mut basis: Vec<Vec<f64>> = vec![r.iter().map(|ri| ri / beta).collect()];
        let mut directions: Vec<Vec<f64>> = Vec::with_capacity(m);
        let mut h = DMatrix::<f64>::zeros(m + 1, m);
        let mut cs = vec![0.0; m];
        let mut sn = vec![0.0; m];
        let mut g = vec![0.0; m + 1];
        g[0] = beta;

        let mut k = 0;
        while k < m && report.iterations < settings.maxiter {
            let z = precondition(rt, group, mode, &basis[k], preconditioner)?;
            let mut w = operator(rt, group, mode, &z)?;
            directions.push(z);
            for (i, v) in basis.iter().enumerate() {
                let hik = rt.dot(group, &w, v)?;
                h[(i, k)] = hik;
                axpy(&mut w, -hik, v);
            }
            let wnorm = rt.norm(group, &w)?;
            h[(k + 1, k)] = wnorm;

            for i in 0..k {
                let upper = cs[i] * h[(i, k)] + sn[i] * h[(i + 1, k)];
                h[(i + 1, k)] = -sn[i] * h[(i, k)] + cs[i] * h[(i + 1, k)];
                h[(i, k)] = upper;
            }
            let (c, s) = givens(h[(k, k)], h[(k + 1, k)]);
            cs[k] = c;
            sn[k] = s;
            h[(k, k)] = c * h[(k, k)] + s * h[(k + 1, k)];
            h[(k + 1, k)] = 0.0;
            g[k + 1] = -s * g[k];
            g[k] *= c;

            k += 1;
            report.iterations += 1;
            debug!(solver = "GMRES", path = %report.path, %mode, iteration = report.iterations, estimate = g[k].abs());
            if g[k].abs() <= tol || wnorm == 0.0 {
                break;
            }
            basis.push(w.iter().map(|wi| wi / wnorm).collect());
        }

        // A singular triangle means the Krylov space stopped growing; keep x.
        let y = h
            .view((0, 0), (k, k))
            .solve_upper_triangular(&DVector::from_column_slice(&g[..k]))
            .unwrap_or_else(|| DVector::zeros(k));
        for (yi, z) in y.iter().zip(&directions) {
            axpy(&mut x, *yi, z);
        }

        let ax = operator(rt, group, mode, &x)?;
        r = rhs.iter().zip(&ax).map(|(b, a)| b - a).collect();
        beta = rt.norm(group, &r)?;
        report.norm = beta;
        if beta <= tol {
            report.state = SolveState::Converged;
            break;
        }
    }
    if report.state != SolveState::Converged {
        report.state = SolveState::MaxIterExceeded;
    }
    rt.solution_mut(group, mode).copy_from_slice(&x);
    Ok(report)
}

/// LU of the group's assembled Jacobian, refactored once per linearization.
fn direct(rt: &mut Runtime, group: usize, mode: Mode, rhs: &[f64]) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport::new("DIRECT", &rt.model.groups[group].path);
    let epoch = rt.state.epoch;
    let fresh = rt.state.direct.get(&group).is_some_and(|cache| cache.epoch == epoch);
    if !fresh {
        let matrix = rt.assemble_matrix(group)?;
        rt.checkpoint_strict(group)?;
        let cache = DirectCache {
            epoch,
            lu_t: matrix.transpose().lu(),
            lu: matrix.lu(),
        };
        rt.state.direct.insert(group, cache);
    }

    let b = DVector::from_vec(rt.assemble(group, rhs)?);
    let solution = rt.state.direct.get(&group).and_then(|cache| match mode {
        Mode::Forward => cache.lu.solve(&b),
        Mode::Reverse => cache.lu_t.solve(&b),
    });
    report.iterations = 1;
    match solution {
        Some(x) => {
            rt.solution_mut(group, mode).copy_from_slice(x.as_slice());
            report.state = SolveState::Converged;
            Ok(report)
        }
        None => Ok(report.failed("the assembled Jacobian is singular".to_string())),
    }
}
