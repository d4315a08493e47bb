//! Solver selection, settings and convergence reporting.
//!
//! Settings structs carry documented defaults and (de)serialize with serde, so
//! a group's solvers can be described in JSON:
//!
//! ```
//! use mdo_core::solvers::NonlinearSolver;
//! let solver = NonlinearSolver::from_json(r#"{"newton": {"maxiter": 5}}"#).unwrap();
//! assert!(matches!(solver, NonlinearSolver::Newton(s) if s.maxiter == 5 && s.alpha == 1.0));
//! ```

pub(crate) mod linear;
pub(crate) mod nonlinear;

use crate::error::{MdoError, Result};
use serde::{Deserialize, Serialize};

/// Stops a solve whose residual keeps growing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceSettings {
    /// Growth over the initial norm that counts as diverging.
    pub factor: f64,
    /// Number of diverging iterations in a row before giving up.
    pub consecutive: usize,
}

impl Default for DivergenceSettings {
    fn default() -> Self {
        Self {
            factor: 1e6,
            consecutive: 3,
        }
    }
}

impl DivergenceSettings {
    /// Updates the run of diverging iterations and tells whether the solve
    /// has diverged. A non-finite norm diverges immediately.
    pub fn check(&self, norm: f64, norm0: f64, streak: &mut usize) -> bool {
        if !norm.is_finite() {
            return true;
        }
        if norm > self.factor * norm0 {
            *streak += 1;
        } else {
            *streak = 0;
        }
        *streak >= self.consecutive.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NlgsSettings {
    pub atol: f64,
    pub rtol: f64,
    pub maxiter: usize,
    pub divergence: DivergenceSettings,
    /// Wall-clock budget in seconds.
    pub time_limit: Option<f64>,
}

impl Default for NlgsSettings {
    fn default() -> Self {
        Self {
            atol: 1e-10,
            rtol: 1e-10,
            maxiter: 100,
            divergence: DivergenceSettings::default(),
            time_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktrackingSettings {
    pub atol: f64,
    pub rtol: f64,
    pub maxiter: usize,
}

impl Default for BacktrackingSettings {
    fn default() -> Self {
        Self {
            atol: 1e-10,
            rtol: 0.9,
            maxiter: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub atol: f64,
    pub rtol: f64,
    pub maxiter: usize,
    /// Initial step length; halved on every backtracking step.
    pub alpha: f64,
    /// Run the children's own solvers before every residual evaluation.
    pub solve_subsystems: bool,
    pub line_search: BacktrackingSettings,
    pub divergence: DivergenceSettings,
    pub time_limit: Option<f64>,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            atol: 1e-12,
            rtol: 1e-10,
            maxiter: 20,
            alpha: 1.0,
            solve_subsystems: true,
            line_search: BacktrackingSettings::default(),
            divergence: DivergenceSettings::default(),
            time_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonlinearSolver {
    /// Runs each child once, in order.
    #[default]
    RunOnce,
    NonlinearGaussSeidel(NlgsSettings),
    Newton(NewtonSettings),
}

impl NonlinearSolver {
    pub fn nlgs() -> Self {
        NonlinearSolver::NonlinearGaussSeidel(NlgsSettings::default())
    }

    pub fn newton() -> Self {
        NonlinearSolver::Newton(NewtonSettings::default())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MdoError::InvalidRequest(format!("nonlinear solver: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            NonlinearSolver::RunOnce => "RUN_ONCE",
            NonlinearSolver::NonlinearGaussSeidel(_) => "NLGS",
            NonlinearSolver::Newton(_) => "NEWTON",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LgsSettings {
    pub atol: f64,
    pub rtol: f64,
    pub maxiter: usize,
}

impl Default for LgsSettings {
    fn default() -> Self {
        Self {
            atol: 1e-10,
            rtol: 1e-10,
            maxiter: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmresSettings {
    pub atol: f64,
    pub rtol: f64,
    pub maxiter: usize,
    /// Krylov subspace size before a restart.
    pub restart: usize,
    /// Right preconditioner, run on the same group.
    pub preconditioner: Option<Box<LinearSolver>>,
}

impl Default for GmresSettings {
    fn default() -> Self {
        Self {
            atol: 1e-12,
            rtol: 1e-10,
            maxiter: 1000,
            restart: 20,
            preconditioner: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolver {
    /// One block substitution sweep; exact for block-triangular groups.
    #[default]
    RunOnce,
    GaussSeidel(LgsSettings),
    Gmres(GmresSettings),
    /// LU of the group's assembled Jacobian.
    Direct,
}

impl LinearSolver {
    pub fn gauss_seidel() -> Self {
        LinearSolver::GaussSeidel(LgsSettings::default())
    }

    pub fn gmres() -> Self {
        LinearSolver::Gmres(GmresSettings::default())
    }

    /// GMRES right-preconditioned by `preconditioner`.
    pub fn gmres_with(preconditioner: LinearSolver) -> Self {
        LinearSolver::Gmres(GmresSettings {
            preconditioner: Some(Box::new(preconditioner)),
            ..GmresSettings::default()
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MdoError::InvalidRequest(format!("linear solver: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            LinearSolver::RunOnce => "LN_RUN_ONCE",
            LinearSolver::GaussSeidel(_) => "LN_GS",
            LinearSolver::Gmres(_) => "GMRES",
            LinearSolver::Direct => "DIRECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveState {
    NotConverged,
    Iterating,
    Converged,
    MaxIterExceeded,
    Diverged,
}

/// Outcome of one nonlinear or linear solve on one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub solver: String,
    pub path: String,
    pub state: SolveState,
    pub iterations: usize,
    pub norm: f64,
    pub norm0: f64,
    /// Message of the analysis error that ended the solve, if any.
    pub failure: Option<String>,
}

impl ConvergenceReport {
    pub(crate) fn new(solver: &str, path: &str) -> Self {
        Self {
            solver: solver.to_string(),
            path: crate::error::display_path(path).to_string(),
            state: SolveState::NotConverged,
            iterations: 0,
            norm: 0.0,
            norm0: 0.0,
            failure: None,
        }
    }

    pub fn converged(&self) -> bool {
        self.state == SolveState::Converged
    }

    pub(crate) fn failed(mut self, message: String) -> Self {
        self.state = SolveState::NotConverged;
        self.failure = Some(message);
        self
    }

    /// Converts a non-converged outcome into the matching error. A solve
    /// ended by an analysis error reports that error.
    pub fn into_result(self) -> Result<Self> {
        if let Some(message) = self.failure {
            return Err(MdoError::Analysis {
                path: self.path,
                message,
            });
        }
        match self.state {
            SolveState::Converged => Ok(self),
            SolveState::Diverged => Err(MdoError::Divergence {
                solver: self.solver,
                path: self.path,
                iterations: self.iterations,
                norm: self.norm,
                norm0: self.norm0,
            }),
            _ => Err(MdoError::NonConvergence {
                solver: self.solver,
                path: self.path,
                iterations: self.iterations,
                norm: self.norm,
            }),
        }
    }
}

/// `||R|| <= max(atol, rtol * ||R0||)`
pub(crate) fn within_tolerance(norm: f64, norm0: f64, atol: f64, rtol: f64) -> bool {
    norm <= atol.max(rtol * norm0)
}
