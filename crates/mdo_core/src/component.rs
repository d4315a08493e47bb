//! The contract every leaf unit of computation implements.
//!
//! Components come in two shapes sharing one capability set:
//!
//! - **Explicit** components compute outputs directly from inputs,
//!   `y = f(x)`. The engine treats them as the residual `R = y - f(x)`.
//! - **Implicit** components state residuals `R(x, y) = 0` and either solve
//!   them themselves or leave the work to the enclosing group's solver.
//!
//! Derivatives are provided either as partial-derivative blocks (dense,
//! sparse or operator), as matrix-free products, or approximated by finite
//! differences.

use crate::error::ComponentError;
use crate::jacobian::{FdSettings, Partials};
use crate::traits::Mode;
use crate::variable::{Values, ValuesMut, VarDeclarations, VarValue};
use anyhow::anyhow;

/// How a component provides its local derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DerivativeMode {
    /// `compute_partials` / `linearize` fill a [`Partials`] table.
    #[default]
    Partials,
    /// Products go through `compute_jacvec_product` (explicit) or
    /// `apply_linear` + `solve_linear` (implicit).
    MatrixFree,
    /// The engine approximates the partials by perturbing the component.
    FiniteDifference(FdSettings),
}

pub trait ExplicitComponent {
    /// Declares inputs and outputs. May be called more than once.
    fn setup(&mut self, vars: &mut VarDeclarations);

    /// Writes `outputs = f(inputs)`. Outputs hold their current values on
    /// entry.
    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError>;

    fn derivatives(&self) -> DerivativeMode {
        DerivativeMode::Partials
    }

    /// Fills ∂outputs/∂inputs. Blocks left unset are zero.
    fn compute_partials(
        &mut self,
        _inputs: &Values,
        _partials: &mut Partials,
    ) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Matrix-free product with ∂f/∂x.
    ///
    /// Forward: `d_outputs += (∂f/∂x) d_inputs`.
    /// Reverse: `d_inputs += (∂f/∂x)ᵀ d_outputs`.
    fn compute_jacvec_product(
        &mut self,
        _inputs: &Values,
        _d_inputs: &mut ValuesMut,
        _d_outputs: &mut ValuesMut,
        _mode: Mode,
    ) -> Result<(), ComponentError> {
        Err(anyhow!("compute_jacvec_product is not implemented").into())
    }

    fn required_workers(&self) -> usize {
        1
    }
}

pub trait ImplicitComponent {
    /// Declares inputs and outputs (states). May be called more than once.
    fn setup(&mut self, vars: &mut VarDeclarations);

    /// Evaluates `residuals = R(inputs, outputs)`.
    fn apply_nonlinear(
        &mut self,
        inputs: &Values,
        outputs: &Values,
        residuals: &mut ValuesMut,
    ) -> Result<(), ComponentError>;

    /// Drives the component's own residuals to zero. The default leaves the
    /// outputs untouched and relies on the enclosing group's solver.
    fn solve_nonlinear(
        &mut self,
        _inputs: &Values,
        _outputs: &mut ValuesMut,
    ) -> Result<(), ComponentError> {
        Ok(())
    }

    fn derivatives(&self) -> DerivativeMode {
        DerivativeMode::Partials
    }

    /// Fills ∂R/∂inputs and ∂R/∂outputs. Blocks left unset are zero.
    ///
    /// Matrix-free components are linearized too, so they can keep whatever
    /// `apply_linear` and `solve_linear` need; their partials are ignored.
    fn linearize(
        &mut self,
        _inputs: &Values,
        _outputs: &Values,
        _partials: &mut Partials,
    ) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Matrix-free product with the residual Jacobian.
    ///
    /// Forward: `d_residuals += ∂R/∂x d_inputs + ∂R/∂y d_outputs`.
    /// Reverse: `d_inputs += (∂R/∂x)ᵀ d_residuals`,
    /// `d_outputs += (∂R/∂y)ᵀ d_residuals`.
    #[allow(clippy::too_many_arguments)]
    fn apply_linear(
        &mut self,
        _inputs: &Values,
        _outputs: &Values,
        _d_inputs: &mut ValuesMut,
        _d_outputs: &mut ValuesMut,
        _d_residuals: &mut ValuesMut,
        _mode: Mode,
    ) -> Result<(), ComponentError> {
        Err(anyhow!("apply_linear is not implemented").into())
    }

    /// Solves the diagonal block.
    ///
    /// Forward: `∂R/∂y d_outputs = d_residuals` for `d_outputs`.
    /// Reverse: `(∂R/∂y)ᵀ d_residuals = d_outputs` for `d_residuals`.
    fn solve_linear(
        &mut self,
        _d_outputs: &mut ValuesMut,
        _d_residuals: &mut ValuesMut,
        _mode: Mode,
    ) -> Result<(), ComponentError> {
        Err(anyhow!("solve_linear is not implemented").into())
    }

    fn required_workers(&self) -> usize {
        1
    }
}

/// A leaf of the model tree.
pub enum Component {
    Explicit(Box<dyn ExplicitComponent>),
    Implicit(Box<dyn ImplicitComponent>),
}

impl Component {
    pub fn explicit(component: impl ExplicitComponent + 'static) -> Self {
        Component::Explicit(Box::new(component))
    }

    pub fn implicit(component: impl ImplicitComponent + 'static) -> Self {
        Component::Implicit(Box::new(component))
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Component::Explicit(_))
    }

    pub(crate) fn setup(&mut self, vars: &mut VarDeclarations) {
        match self {
            Component::Explicit(c) => c.setup(vars),
            Component::Implicit(c) => c.setup(vars),
        }
    }

    pub(crate) fn derivatives(&self) -> DerivativeMode {
        match self {
            Component::Explicit(c) => c.derivatives(),
            Component::Implicit(c) => c.derivatives(),
        }
    }

    pub(crate) fn required_workers(&self) -> usize {
        match self {
            Component::Explicit(c) => c.required_workers(),
            Component::Implicit(c) => c.required_workers(),
        }
        .max(1)
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Explicit(_) => write!(f, "Component::Explicit"),
            Component::Implicit(_) => write!(f, "Component::Implicit"),
        }
    }
}

/// Source of independent variables (design variables).
///
/// Its outputs keep whatever value was last set on them.
#[derive(Debug, Clone, Default)]
pub struct IndepVarComp {
    outputs: Vec<(String, VarValue)>,
}

impl IndepVarComp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: &str, value: impl Into<VarValue>) -> Self {
        self.outputs.push((name.to_string(), value.into()));
        self
    }
}

impl ExplicitComponent for IndepVarComp {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        for (name, value) in &self.outputs {
            vars.add_output(name, value.clone());
        }
    }

    fn compute(&mut self, _inputs: &Values, _outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        Ok(())
    }
}
