//! The `mdo_core` crate is the derivative and solve engine for hierarchical
//! multidisciplinary design models.
//!
//! Key components:
//! - **Components**: `ExplicitComponent` (`y = f(x)`) and `ImplicitComponent`
//!   (`R(x, y) = 0`), with partials, matrix-free products or finite differences.
//! - **Groups**: trees of components with promotion, connections and
//!   dependency-derived execution order.
//! - **Registry**: the flat, promoted variable namespace built at setup.
//! - **Solvers**: nonlinear Gauss-Seidel and Newton; linear Gauss-Seidel,
//!   GMRES and a direct LU solver, in forward and reverse mode.
//! - **Transfers / Communicator**: precomputed data passing between workers.
//! - **Problem**: the driver entry point (`run_nonlinear`, `compute_totals`).
//!
//! ```
//! use mdo_core::{Group, IndepVarComp, Problem};
//!
//! let mut root = Group::new();
//! root.add_explicit("p", IndepVarComp::new().with_output("x", 3.0), &["x"]);
//! let mut problem = Problem::new(root);
//! problem.setup().unwrap();
//! problem.run_nonlinear().unwrap();
//! assert_eq!(problem.get_variable("x").unwrap(), vec![3.0]);
//! ```

pub mod comm;
pub mod component;
pub mod error;
pub mod group;
pub mod jacobian;
mod model;
mod partition;
pub mod problem;
pub mod recorder;
pub mod registry;
mod runtime;
pub mod solvers;
pub mod totals;
pub mod traits;
mod transfer;
pub mod variable;
mod vectors;

#[cfg(test)]
mod testing;

pub use comm::{Communicator, ReduceOp, SerialComm, ThreadComm};
pub use component::{Component, DerivativeMode, ExplicitComponent, ImplicitComponent, IndepVarComp};
pub use error::{ComponentError, MdoError, Result, StructuralError};
pub use group::{Group, Subsystem, System};
pub use jacobian::{FdForm, FdSettings, Partials, StepType};
pub use problem::Problem;
pub use recorder::{IterationRecord, JsonLinesRecorder, MemoryRecorder, Recorder};
pub use registry::{Connection, Registry, VarInfo};
pub use solvers::{ConvergenceReport, LinearSolver, NonlinearSolver, SolveState};
pub use totals::{Selection, Totals, TotalsRequest};
pub use traits::{csr_from_triplets, LinearOperator, Mode, ScaledIdentity};
pub use variable::{Values, ValuesMut, VarDeclarations, VarKind, VarValue};
