// LINEAR SOLVER
// Narrow seam around the matrix solves used by trend fitting and kriging
//
// The numerical backend is pluggable so the state-machine and data-model
// code never touches linear algebra directly. The in-crate backend is
// dense Gaussian elimination with partial pivoting, which is plenty for
// the anchor counts a single irrigated region produces.

use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SolveError {
    #[error("matrix is singular or numerically degenerate at pivot {pivot}")]
    Singular { pivot: usize },

    #[error("dimension mismatch: matrix is {rows}x{cols}, rhs has {rhs}")]
    DimensionMismatch { rows: usize, cols: usize, rhs: usize },
}

/// Capability seam for `A x = b` solves.
pub trait LinearSolver: Send + Sync {
    fn solve(&self, a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, SolveError>;
}

/// Dense Gaussian elimination with partial pivoting.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseSolver;

const PIVOT_EPS: f64 = 1e-12;

impl LinearSolver for DenseSolver {
    fn solve(&self, a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, SolveError> {
        let (rows, cols) = a.dim();
        if rows != cols || rows != b.len() {
            return Err(SolveError::DimensionMismatch { rows, cols, rhs: b.len() });
        }
        let n = rows;
        let mut m = a.clone();
        let mut rhs = b.clone();

        for k in 0..n {
            // Partial pivot: largest magnitude in column k at/below row k.
            let mut pivot_row = k;
            let mut pivot_val = m[[k, k]].abs();
            for r in (k + 1)..n {
                if m[[r, k]].abs() > pivot_val {
                    pivot_val = m[[r, k]].abs();
                    pivot_row = r;
                }
            }
            if pivot_val < PIVOT_EPS || !pivot_val.is_finite() {
                return Err(SolveError::Singular { pivot: k });
            }
            if pivot_row != k {
                for c in 0..n {
                    m.swap([k, c], [pivot_row, c]);
                }
                rhs.swap(k, pivot_row);
            }
            for r in (k + 1)..n {
                let factor = m[[r, k]] / m[[k, k]];
                for c in k..n {
                    m[[r, c]] -= factor * m[[k, c]];
                }
                rhs[r] -= factor * rhs[k];
            }
        }

        // Back substitution
        let mut x = Array1::zeros(n);
        for k in (0..n).rev() {
            let mut sum = rhs[k];
            for c in (k + 1)..n {
                sum -= m[[k, c]] * x[c];
            }
            x[k] = sum / m[[k, k]];
        }
        Ok(x)
    }
}
