//! Error taxonomy of the engine.
//!
//! Structural problems are detected once, at setup, and are always fatal.
//! Run-time failures split into recoverable analysis errors raised by
//! components, solver outcomes (non-convergence, divergence) and opaque fatal
//! errors that component code returns unmodified.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MdoError>;

/// Error returned by component code.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// Non-fatal evaluation failure; the enclosing nonlinear solver may retry
    /// with a smaller step.
    #[error("analysis error: {0}")]
    Analysis(String),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ComponentError {
    pub fn analysis(message: impl Into<String>) -> Self {
        ComponentError::Analysis(message.into())
    }
}

/// Problems with the structure of a model, raised by `setup()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StructuralError {
    #[error("Promoted output '{name}' is provided by both '{first}' and '{second}'")]
    DuplicateOutput {
        name: String,
        first: String,
        second: String,
    },

    #[error("Input '{target}' (promoted as '{promoted}') is not connected to any output")]
    BrokenPromotion { target: String, promoted: String },

    #[error("{reason}")]
    ShapeMismatch {
        src: String,
        target: String,
        reason: String,
    },

    #[error("Input '{target}' is connected to both '{first}' and '{second}'")]
    MultipleSources {
        target: String,
        first: String,
        second: String,
    },

    #[error("'{path}' promotes '{pattern}' but has no variables matching that specification")]
    UnmatchedPromotion { path: String, pattern: String },

    #[error("Group '{group}' connects '{name}', which does not exist in that group")]
    UnknownEndpoint { group: String, name: String },

    #[error("Cannot connect '{src}' to '{target}': {reason}")]
    InvalidConnection {
        src: String,
        target: String,
        reason: String,
    },

    #[error("Group '{group}' already contains a subsystem named '{name}'")]
    DuplicateSubsystem { group: String, name: String },

    #[error("Variable '{path}' is declared more than once")]
    DuplicateVariable { path: String },

    #[error("'{name}' is not a valid name: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Variable '{path}' has shape {shape:?} but a default value of {len} entries")]
    InvalidValue {
        path: String,
        shape: Vec<usize>,
        len: usize,
    },

    #[error("Execution order of group '{group}' is invalid: {reason}")]
    InvalidOrder { group: String, reason: String },

    #[error("'{path}' needs {required} workers, but was given only {available}")]
    InsufficientWorkers {
        path: String,
        required: usize,
        available: usize,
    },
}

/// Every failure the engine reports.
#[derive(Debug, Error)]
pub enum MdoError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(
        "Group '{group}' contains a cycle among [{}] but has no iterative nonlinear solver",
        members.join(", ")
    )]
    UnresolvedCycle { group: String, members: Vec<String> },

    #[error("Analysis error in '{path}': {message}")]
    Analysis { path: String, message: String },

    #[error("{solver} in '{path}' failed to converge in {iterations} iterations (|R| = {norm:e})")]
    NonConvergence {
        solver: String,
        path: String,
        iterations: usize,
        norm: f64,
    },

    #[error("{solver} in '{path}' diverged at iteration {iterations} (|R| = {norm:e}, |R0| = {norm0:e})")]
    Divergence {
        solver: String,
        path: String,
        iterations: usize,
        norm: f64,
        norm0: f64,
    },

    #[error(
        "Total derivative computation failed: {solver} in '{path}' did not converge in {mode} mode \
         after {iterations} iterations (|r| = {norm:e})"
    )]
    DerivativeFailure {
        solver: String,
        path: String,
        mode: String,
        iterations: usize,
        norm: f64,
    },

    #[error("Component '{path}' failed: {source}")]
    Component {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("'{0}' is not a variable of the model")]
    UnknownVariable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Communication failure: {0}")]
    Communication(String),

    #[error("Problem has not been set up; call setup() first")]
    NotSetUp,
}

impl MdoError {
    pub(crate) fn from_component(path: &str, err: ComponentError) -> Self {
        match err {
            ComponentError::Analysis(message) => MdoError::Analysis {
                path: display_path(path).to_string(),
                message,
            },
            ComponentError::Fatal(source) => MdoError::Component {
                path: display_path(path).to_string(),
                source,
            },
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, MdoError::Structural(_) | MdoError::UnresolvedCycle { .. })
    }

    pub fn is_analysis(&self) -> bool {
        matches!(self, MdoError::Analysis { .. })
    }
}

/// Root group has an empty path internally.
pub(crate) fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}
