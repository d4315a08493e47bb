use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVectorView, DVectorViewMut};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a linear solve or Jacobian product.
///
/// `Forward` works with `J` (one solve per design input), `Reverse` with `Jᵀ`
/// (one solve per requested output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Forward,
    Reverse,
}

impl Mode {
    pub fn flip(self) -> Mode {
        match self {
            Mode::Forward => Mode::Reverse,
            Mode::Reverse => Mode::Forward,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Forward => write!(f, "forward"),
            Mode::Reverse => write!(f, "reverse"),
        }
    }
}

/// A matrix-free linear map.
///
/// Both products accumulate into `y`, so callers can sum several blocks into
/// one output buffer.
pub trait LinearOperator {
    /// (rows, columns).
    fn shape(&self) -> (usize, usize);

    /// y += A x
    fn apply(&self, x: &[f64], y: &mut [f64]);

    /// y += Aᵀ x
    fn apply_transpose(&self, x: &[f64], y: &mut [f64]);

    /// Materializes the operator column by column.
    fn to_dense(&self) -> DMatrix<f64> {
        let (rows, cols) = self.shape();
        let mut dense = DMatrix::zeros(rows, cols);
        let mut unit = vec![0.0; cols];
        for (j, mut column) in dense.column_iter_mut().enumerate() {
            unit[j] = 1.0;
            self.apply(&unit, column.as_mut_slice());
            unit[j] = 0.0;
        }
        dense
    }
}

impl LinearOperator for DMatrix<f64> {
    fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let x = DVectorView::from_slice(x, self.ncols());
        DVectorViewMut::from_slice(y, self.nrows()).gemv(1.0, self, &x, 1.0);
    }

    fn apply_transpose(&self, x: &[f64], y: &mut [f64]) {
        let x = DVectorView::from_slice(x, self.nrows());
        DVectorViewMut::from_slice(y, self.ncols()).gemv_tr(1.0, self, &x, 1.0);
    }

    fn to_dense(&self) -> DMatrix<f64> {
        self.clone()
    }
}

impl LinearOperator for CsrMatrix<f64> {
    fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let x = DMatrixView::from_slice(x, self.ncols(), 1);
        let y = DMatrixViewMut::from_slice(y, self.nrows(), 1);
        spmm_csr_dense(1.0, y, 1.0, Op::NoOp(self), Op::NoOp(x));
    }

    fn apply_transpose(&self, x: &[f64], y: &mut [f64]) {
        let x = DMatrixView::from_slice(x, self.nrows(), 1);
        let y = DMatrixViewMut::from_slice(y, self.ncols(), 1);
        spmm_csr_dense(1.0, y, 1.0, Op::Transpose(self), Op::NoOp(x));
    }
}

/// `scale · I` without storing the matrix.
#[derive(Debug, Clone, Copy)]
pub struct ScaledIdentity {
    pub size: usize,
    pub scale: f64,
}

impl LinearOperator for ScaledIdentity {
    fn shape(&self) -> (usize, usize) {
        (self.size, self.size)
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        crate::vectors::axpy(&mut y[..self.size], self.scale, &x[..self.size]);
    }

    fn apply_transpose(&self, x: &[f64], y: &mut [f64]) {
        self.apply(x, y);
    }
}

/// Builds a CSR block from (row, col, value) triplets; duplicates are summed.
pub fn csr_from_triplets(
    nrows: usize,
    ncols: usize,
    triplets: &[(usize, usize, f64)],
) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(nrows, ncols);
    for &(i, j, v) in triplets {
        coo.push(i, j, v);
    }
    CsrMatrix::from(&coo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_and_sparse_products_agree() {
        let dense = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, -3.0, 4.0]);
        let sparse = csr_from_triplets(2, 3, &[(0, 0, 1.0), (0, 2, 2.0), (1, 1, -3.0), (1, 2, 4.0)]);
        let x = [1.0, 2.0, 3.0];

        let mut yd = vec![0.0; 2];
        let mut ys = vec![0.0; 2];
        dense.apply(&x, &mut yd);
        sparse.apply(&x, &mut ys);
        assert_eq!(yd, vec![7.0, 6.0]);
        assert_eq!(yd, ys);

        let w = [1.0, -1.0];
        let mut td = vec![0.0; 3];
        let mut ts = vec![0.0; 3];
        dense.apply_transpose(&w, &mut td);
        sparse.apply_transpose(&w, &mut ts);
        assert_eq!(td, vec![1.0, 3.0, -2.0]);
        assert_eq!(td, ts);
        assert_eq!(sparse.to_dense(), dense);
    }

    #[test]
    fn products_accumulate_into_output() {
        let op = ScaledIdentity {
            size: 2,
            scale: 3.0,
        };
        let mut y = vec![1.0, 1.0];
        op.apply(&[1.0, 2.0], &mut y);
        assert_eq!(y, vec![4.0, 7.0]);

        let dense = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, -3.0, 4.0]);
        let sparse = csr_from_triplets(2, 3, &[(0, 0, 1.0), (0, 2, 2.0), (1, 1, -3.0), (1, 2, 4.0)]);
        let ops: [&dyn LinearOperator; 2] = [&dense, &sparse];
        for op in ops {
            let mut y = vec![10.0, 20.0];
            op.apply(&[1.0, 2.0, 3.0], &mut y);
            assert_eq!(y, vec![17.0, 26.0]);
            let mut t = vec![1.0, 1.0, 1.0];
            op.apply_transpose(&[1.0, -1.0], &mut t);
            assert_eq!(t, vec![2.0, 4.0, -1.0]);
        }
    }
}
