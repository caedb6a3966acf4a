use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Goodness-of-fit figures for one evaluation. Scores that are undefined for
/// the sample size are `None` rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub r2: Option<f64>,
    pub mse: Option<f64>,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub n_samples: usize,
}

impl ModelMetrics {
    /// Defined metrics keyed by name, in a stable order.
    pub fn entries(&self) -> BTreeMap<&'static str, f64> {
        let mut map = BTreeMap::new();
        for (name, value) in [
            ("r2", self.r2),
            ("mse", self.mse),
            ("rmse", self.rmse),
            ("mae", self.mae),
        ] {
            if let Some(value) = value {
                map.insert(name, value);
            }
        }
        map
    }
}

pub fn compute_metrics(actual: &[f64], predicted: &[f64]) -> Result<ModelMetrics> {
    ensure_lengths_match(actual, predicted)?;

    let n = actual.len();
    if n == 0 {
        return Ok(ModelMetrics {
            r2: None,
            mse: None,
            rmse: None,
            mae: None,
            n_samples: 0,
        });
    }

    let mse = mean_squared_error(actual, predicted);
    Ok(ModelMetrics {
        r2: r2_score(actual, predicted),
        mse: Some(mse),
        rmse: Some(mse.sqrt()),
        mae: Some(mean_absolute_error(actual, predicted)),
        n_samples: n,
    })
}

fn ensure_lengths_match(actual: &[f64], predicted: &[f64]) -> Result<()> {
    if actual.len() != predicted.len() {
        return Err(anyhow!(
            "Cannot compute metrics: {} actual values vs {} predictions",
            actual.len(),
            predicted.len()
        ));
    }
    Ok(())
}

/// Coefficient of determination. Needs at least two samples; a constant
/// target scores 1.0 on a perfect prediction and 0.0 otherwise.
pub fn r2_score(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    if actual.len() < 2 || actual.len() != predicted.len() {
        return None;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();

    if ss_tot == 0.0 {
        return Some(if ss_res == 0.0 { 1.0 } else { 0.0 });
    }
    Some(1.0 - ss_res / ss_tot)
}

fn mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum::<f64>()
        / actual.len() as f64
}

fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}
