//! Flat storage for one worker.
//!
//! Every worker keeps full-length vectors; it only keeps the entries of the
//! components it runs current, and owns (for norms and gathers) the entries
//! of the components whose worker range starts at its rank.

use crate::registry::Registry;
use crate::variable::VarKind;
use nalgebra::{DVectorView, DVectorViewMut};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Vectors {
    /// Outputs and states.
    pub u: Vec<f64>,
    /// Residuals.
    pub r: Vec<f64>,
    /// Inputs.
    pub p: Vec<f64>,
    pub du: Vec<f64>,
    pub dr: Vec<f64>,
    pub dp: Vec<f64>,
}

impl Vectors {
    /// Vectors holding every variable's declared default.
    pub fn new(registry: &Registry) -> Self {
        let (nu, np) = (registry.u_size(), registry.p_size());
        let mut u = vec![0.0; nu];
        let mut p = vec![0.0; np];
        for var in registry.variables() {
            let target = match var.kind {
                VarKind::Output => &mut u,
                VarKind::Input => &mut p,
            };
            target[var.range()].copy_from_slice(&var.default);
        }
        Self {
            u,
            r: vec![0.0; nu],
            p,
            du: vec![0.0; nu],
            dr: vec![0.0; nu],
            dp: vec![0.0; np],
        }
    }
}

pub(crate) fn zero(v: &mut [f64], range: Range<usize>) {
    v[range].iter_mut().for_each(|x| *x = 0.0);
}

/// y += a x
pub(crate) fn axpy(y: &mut [f64], a: f64, x: &[f64]) {
    let n = y.len();
    DVectorViewMut::from_slice(y, n).axpy(a, &DVectorView::from_slice(x, n), 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_work_in_place() {
        let mut v = vec![1.0, 2.0, 3.0, 4.0];
        zero(&mut v, 1..3);
        assert_eq!(v, vec![1.0, 0.0, 0.0, 4.0]);
        axpy(&mut v[..2], 2.0, &[1.0, 1.0]);
        assert_eq!(v, vec![3.0, 2.0, 0.0, 4.0]);
    }
}
