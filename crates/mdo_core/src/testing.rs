//! Small components shared by the unit tests.

use crate::component::{DerivativeMode, ExplicitComponent, ImplicitComponent};
use crate::error::ComponentError;
use crate::jacobian::Partials;
use crate::traits::{csr_from_triplets, Mode};
use crate::variable::{Values, ValuesMut, VarDeclarations};
use anyhow::anyhow;

/// `y = k x`
pub struct Linear {
    k: f64,
    derivatives: DerivativeMode,
}

impl Linear {
    pub fn new(k: f64) -> Self {
        Self {
            k,
            derivatives: DerivativeMode::Partials,
        }
    }

    pub fn with_derivatives(mut self, derivatives: DerivativeMode) -> Self {
        self.derivatives = derivatives;
        self
    }
}

impl ExplicitComponent for Linear {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("x", 1.0).add_output("y", 1.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        outputs.set_scalar("y", self.k * inputs.scalar("x"));
        Ok(())
    }

    fn derivatives(&self) -> DerivativeMode {
        self.derivatives
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        partials.set_scalar("y", "x", self.k)
    }

    fn compute_jacvec_product(
        &mut self,
        _inputs: &Values,
        d_inputs: &mut ValuesMut,
        d_outputs: &mut ValuesMut,
        mode: Mode,
    ) -> Result<(), ComponentError> {
        match mode {
            Mode::Forward => d_outputs["y"][0] += self.k * d_inputs.scalar("x"),
            Mode::Reverse => d_inputs["x"][0] += self.k * d_outputs.scalar("y"),
        }
        Ok(())
    }
}

/// `y = c + k x`
pub struct Offset {
    c: f64,
    k: f64,
}

impl Offset {
    pub fn new(c: f64, k: f64) -> Self {
        Self { c, k }
    }
}

impl ExplicitComponent for Offset {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("x", 1.0).add_output("y", 1.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        outputs.set_scalar("y", self.c + self.k * inputs.scalar("x"));
        Ok(())
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        partials.set_scalar("y", "x", self.k)
    }
}

/// A source that needs `n` workers.
pub struct Spread {
    n: usize,
}

impl Spread {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl ExplicitComponent for Spread {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_output("y", 0.0);
    }

    fn compute(&mut self, _inputs: &Values, _outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        Ok(())
    }

    fn required_workers(&self) -> usize {
        self.n
    }
}

/// `z = x + y`
pub struct Adder;

impl ExplicitComponent for Adder {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("x", 0.0).add_input("y", 0.0).add_output("z", 0.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        outputs.set_scalar("z", inputs.scalar("x") + inputs.scalar("y"));
        Ok(())
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        partials.set_scalar("z", "x", 1.0)?;
        partials.set_scalar("z", "y", 1.0)
    }
}

/// `w = 2 z`
pub struct Doubler;

impl ExplicitComponent for Doubler {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("z", 0.0).add_output("w", 0.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        outputs.set_scalar("w", 2.0 * inputs.scalar("z"));
        Ok(())
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        partials.set_scalar("w", "z", 2.0)
    }
}

/// `y = Σ wᵢ xᵢ` over inputs `x1, x2, ...`
pub struct WeightedSum {
    weights: Vec<f64>,
}

impl WeightedSum {
    pub fn new(weights: &[f64]) -> Self {
        Self {
            weights: weights.to_vec(),
        }
    }
}

impl ExplicitComponent for WeightedSum {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        for i in 0..self.weights.len() {
            vars.add_input(&format!("x{}", i + 1), 0.0);
        }
        vars.add_output("y", 0.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        let y = self
            .weights
            .iter()
            .enumerate()
            .map(|(i, w)| w * inputs.scalar(&format!("x{}", i + 1)))
            .sum();
        outputs.set_scalar("y", y);
        Ok(())
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        for (i, w) in self.weights.iter().enumerate() {
            partials.set_scalar("y", &format!("x{}", i + 1), *w)?;
        }
        Ok(())
    }
}

/// `y = k x` on vectors, with the partials stored as a diagonal operator or
/// as a sparse block.
pub struct Scale {
    size: usize,
    k: f64,
    sparse: bool,
}

impl Scale {
    pub fn new(size: usize, k: f64, sparse: bool) -> Self {
        Self { size, k, sparse }
    }
}

impl ExplicitComponent for Scale {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("x", vec![1.0; self.size])
            .add_output("y", vec![0.0; self.size]);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        let y: Vec<f64> = inputs["x"].iter().map(|x| self.k * x).collect();
        outputs.set("y", &y);
        Ok(())
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        if !self.sparse {
            return partials.set_diagonal("y", "x", self.k);
        }
        let triplets: Vec<_> = (0..self.size).map(|i| (i, i, self.k)).collect();
        partials.set_sparse("y", "x", csr_from_triplets(self.size, self.size, &triplets))
    }
}

/// First Sellar discipline: `y1 = z1² + z2 + x - 0.2 y2`.
pub struct SellarDis1;

impl ExplicitComponent for SellarDis1 {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("z", [5.0, 2.0])
            .add_input("x", 1.0)
            .add_input("y2", 1.0)
            .add_output("y1", 1.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        let z = &inputs["z"];
        let y1 = z[0] * z[0] + z[1] + inputs.scalar("x") - 0.2 * inputs.scalar("y2");
        outputs.set_scalar("y1", y1);
        Ok(())
    }

    fn compute_partials(&mut self, inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        let z = &inputs["z"];
        partials.set_row_major("y1", "z", &[2.0 * z[0], 1.0])?;
        partials.set_scalar("y1", "x", 1.0)?;
        partials.set_scalar("y1", "y2", -0.2)
    }
}

/// Second Sellar discipline: `y2 = sqrt(|y1|) + z1 + z2`.
pub struct SellarDis2;

impl ExplicitComponent for SellarDis2 {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("z", [5.0, 2.0])
            .add_input("y1", 1.0)
            .add_output("y2", 1.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        let z = &inputs["z"];
        let y2 = inputs.scalar("y1").abs().sqrt() + z[0] + z[1];
        outputs.set_scalar("y2", y2);
        Ok(())
    }

    fn compute_partials(&mut self, inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        let y1 = inputs.scalar("y1");
        partials.set_row_major("y2", "z", &[1.0, 1.0])?;
        partials.set_scalar("y2", "y1", y1.signum() * 0.5 / y1.abs().sqrt())
    }
}

/// Sellar objective and constraints.
pub struct SellarFunctions;

impl ExplicitComponent for SellarFunctions {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("z", [5.0, 2.0])
            .add_input("x", 1.0)
            .add_input("y1", 1.0)
            .add_input("y2", 1.0)
            .add_output("obj", 0.0)
            .add_output("con1", 0.0)
            .add_output("con2", 0.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        let z = &inputs["z"];
        let (x, y1, y2) = (inputs.scalar("x"), inputs.scalar("y1"), inputs.scalar("y2"));
        outputs.set_scalar("obj", x * x + z[1] + y1 + (-y2).exp());
        outputs.set_scalar("con1", 3.16 - y1);
        outputs.set_scalar("con2", y2 - 24.0);
        Ok(())
    }

    fn compute_partials(&mut self, inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        let (x, y2) = (inputs.scalar("x"), inputs.scalar("y2"));
        partials.set_row_major("obj", "z", &[0.0, 1.0])?;
        partials.set_scalar("obj", "x", 2.0 * x)?;
        partials.set_scalar("obj", "y1", 1.0)?;
        partials.set_scalar("obj", "y2", -(-y2).exp())?;
        partials.set_scalar("con1", "y1", -1.0)?;
        partials.set_scalar("con2", "y2", 1.0)
    }
}

/// `R = x² - c` in the state `x`. Evaluating at `x > 3` is an analysis error.
pub struct Quadratic {
    derivatives: DerivativeMode,
    x: f64,
}

impl Quadratic {
    pub fn new() -> Self {
        Self {
            derivatives: DerivativeMode::Partials,
            x: 0.5,
        }
    }

    pub fn with_derivatives(mut self, derivatives: DerivativeMode) -> Self {
        self.derivatives = derivatives;
        self
    }
}

impl ImplicitComponent for Quadratic {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("c", 4.0).add_output("x", 0.5);
    }

    fn apply_nonlinear(
        &mut self,
        inputs: &Values,
        outputs: &Values,
        residuals: &mut ValuesMut,
    ) -> Result<(), ComponentError> {
        let x = outputs.scalar("x");
        if x > 3.0 {
            return Err(ComponentError::analysis(format!("x = {x} is outside the valid range")));
        }
        residuals.set_scalar("x", x * x - inputs.scalar("c"));
        Ok(())
    }

    fn derivatives(&self) -> DerivativeMode {
        self.derivatives
    }

    fn linearize(&mut self, _inputs: &Values, outputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        self.x = outputs.scalar("x");
        partials.set_scalar("x", "x", 2.0 * self.x)?;
        partials.set_scalar("x", "c", -1.0)
    }

    fn apply_linear(
        &mut self,
        _inputs: &Values,
        outputs: &Values,
        d_inputs: &mut ValuesMut,
        d_outputs: &mut ValuesMut,
        d_residuals: &mut ValuesMut,
        mode: Mode,
    ) -> Result<(), ComponentError> {
        let slope = 2.0 * outputs.scalar("x");
        match mode {
            Mode::Forward => {
                d_residuals["x"][0] += slope * d_outputs.scalar("x") - d_inputs.scalar("c");
            }
            Mode::Reverse => {
                let dr = d_residuals.scalar("x");
                d_outputs["x"][0] += slope * dr;
                d_inputs["c"][0] -= dr;
            }
        }
        Ok(())
    }

    fn solve_linear(
        &mut self,
        d_outputs: &mut ValuesMut,
        d_residuals: &mut ValuesMut,
        mode: Mode,
    ) -> Result<(), ComponentError> {
        let slope = 2.0 * self.x;
        match mode {
            Mode::Forward => d_outputs.set_scalar("x", d_residuals.scalar("x") / slope),
            Mode::Reverse => d_residuals.set_scalar("x", d_outputs.scalar("x") / slope),
        }
        Ok(())
    }
}

/// Fails every evaluation with a fatal error.
pub struct Broken;

impl ExplicitComponent for Broken {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("x", 0.0).add_output("y", 0.0);
    }

    fn compute(&mut self, _inputs: &Values, _outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        Err(anyhow!("solver library crashed").into())
    }
}

/// `y = 3 x`, defined only for `x <= 1`.
pub struct Cliff;

impl ExplicitComponent for Cliff {
    fn setup(&mut self, vars: &mut VarDeclarations) {
        vars.add_input("x", 0.0).add_output("y", 0.0);
    }

    fn compute(&mut self, inputs: &Values, outputs: &mut ValuesMut) -> Result<(), ComponentError> {
        let x = inputs.scalar("x");
        if x > 1.0 {
            return Err(ComponentError::analysis(format!("x = {x} is past the edge")));
        }
        outputs.set_scalar("y", 3.0 * x);
        Ok(())
    }

    fn compute_partials(&mut self, _inputs: &Values, partials: &mut Partials) -> Result<(), ComponentError> {
        partials.set_scalar("y", "x", 3.0)
    }
}
