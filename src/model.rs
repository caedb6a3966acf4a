use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative pivot tolerance below which a normal-equation column is treated as dependent.
const PIVOT_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("cannot fit a model on zero rows")]
    NoSamples,
    #[error("feature matrix has {rows} rows but target has {targets}")]
    LengthMismatch { rows: usize, targets: usize },
    #[error("model expects {expected} features but received {found}")]
    FeatureCount { expected: usize, found: usize },
}

/// Ordinary least squares regression with an intercept term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<String>,
    pub target: String,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub n_samples: usize,
}

impl LinearModel {
    /// Fit on a `rows x features` design matrix.
    ///
    /// Inputs are centred so the intercept drops out of the normal equations.
    /// Columns that are linearly dependent on earlier ones receive a zero
    /// coefficient instead of failing the fit.
    pub fn fit(
        features: Vec<String>,
        target: impl Into<String>,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<Self, ModelError> {
        let (rows, cols) = x.dim();
        if rows == 0 {
            return Err(ModelError::NoSamples);
        }
        if rows != y.len() {
            return Err(ModelError::LengthMismatch {
                rows,
                targets: y.len(),
            });
        }
        if cols != features.len() {
            return Err(ModelError::FeatureCount {
                expected: features.len(),
                found: cols,
            });
        }

        let x_mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(cols));
        let y_mean = y.mean().unwrap_or(0.0);
        let xc = x - &x_mean;
        let yc = y - y_mean;

        let gram = xc.t().dot(&xc);
        let moment = xc.t().dot(&yc);
        let coefficients = solve_symmetric(gram, moment);
        let intercept = y_mean - coefficients.dot(&x_mean);

        Ok(Self {
            features,
            target: target.into(),
            coefficients: coefficients.to_vec(),
            intercept,
            n_samples: rows,
        })
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::FeatureCount {
                expected: self.coefficients.len(),
                found: x.ncols(),
            });
        }
        let coefficients = Array1::from(self.coefficients.clone());
        Ok(x.dot(&coefficients) + self.intercept)
    }
}

/// Gauss-Jordan elimination with partial pivoting. Free variables are set to zero.
fn solve_symmetric(mut a: Array2<f64>, mut b: Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let scale = a
        .diag()
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()))
        .max(1.0);
    let tolerance = PIVOT_TOLERANCE * scale;

    let mut pivots = Vec::with_capacity(n);
    let mut row = 0;
    for col in 0..n {
        if row == n {
            break;
        }
        let (best, best_abs) = (row..n)
            .map(|r| (r, a[[r, col]].abs()))
            .fold((row, -1.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
        if best_abs <= tolerance {
            continue;
        }
        if best != row {
            for c in 0..n {
                a.swap([best, c], [row, c]);
            }
            b.swap(best, row);
        }

        let pivot = a[[row, col]];
        for c in 0..n {
            a[[row, c]] /= pivot;
        }
        b[row] /= pivot;

        for r in 0..n {
            if r == row {
                continue;
            }
            let factor = a[[r, col]];
            if factor == 0.0 {
                continue;
            }
            for c in 0..n {
                a[[r, c]] -= factor * a[[row, c]];
            }
            b[r] -= factor * b[row];
        }
        pivots.push((row, col));
        row += 1;
    }

    let mut solution = Array1::zeros(n);
    for (r, c) in pivots {
        solution[c] = b[r];
    }
    solution
}
