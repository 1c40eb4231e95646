//! Linear policy artifacts.
//!
//! A policy file is JSON:
//!
//! ```json
//! { "input_dim": 4, "weights": [[...], [...]], "bias": [0.0, 0.0] }
//! ```
//!
//! `weights` holds one row of `input_dim` coefficients per action; the
//! action with the highest logit wins.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// A single-layer policy mapping a state vector to action logits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPolicy {
    pub input_dim: usize,
    pub weights: Vec<Vec<f32>>,
    #[serde(default)]
    pub bias: Vec<f32>,
}

impl LinearPolicy {
    /// Read and validate a policy file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::model_load(path.display().to_string(), e.to_string()))?;
        let policy: LinearPolicy = serde_json::from_str(&content)
            .map_err(|e| Error::model_load(path.display().to_string(), e.to_string()))?;
        policy
            .validate()
            .map_err(|reason| Error::model_load(path.display().to_string(), reason))?;
        Ok(policy)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.input_dim == 0 {
            return Err("input_dim must be greater than 0".to_string());
        }
        if self.weights.is_empty() {
            return Err("policy has no actions".to_string());
        }
        if self.weights.len() > usize::from(u8::MAX) {
            return Err(format!("too many actions ({})", self.weights.len()));
        }
        if let Some(row) = self.weights.iter().position(|r| r.len() != self.input_dim) {
            return Err(format!(
                "weight row {row} has {} values, expected {}",
                self.weights[row].len(),
                self.input_dim
            ));
        }
        if !self.bias.is_empty() && self.bias.len() != self.weights.len() {
            return Err(format!(
                "bias has {} values, expected {}",
                self.bias.len(),
                self.weights.len()
            ));
        }
        if self.weights.iter().flatten().chain(&self.bias).any(|v| !v.is_finite()) {
            return Err("non-finite coefficient".to_string());
        }
        Ok(())
    }

    /// Number of actions this policy scores
    pub fn action_count(&self) -> usize {
        self.weights.len()
    }

    /// Raw action logits for one state
    pub fn forward(&self, state: &[f32]) -> Result<Vec<f32>> {
        if state.len() != self.input_dim {
            return Err(Error::Inference(format!(
                "state has {} features, policy expects {}",
                state.len(),
                self.input_dim
            )));
        }

        Ok(self
            .weights
            .iter()
            .enumerate()
            .map(|(action, row)| {
                let dot: f32 = row.iter().zip(state).map(|(w, x)| w * x).sum();
                dot + self.bias.get(action).copied().unwrap_or(0.0)
            })
            .collect())
    }

    /// Highest-scoring action for one state
    pub fn act(&self, state: &[f32]) -> Result<u8> {
        let logits = self.forward(state)?;
        Ok(argmax(&logits))
    }
}

/// Index of the largest value, first one on ties
pub fn argmax(values: &[f32]) -> u8 {
    let mut best = 0;
    for (idx, value) in values.iter().enumerate() {
        if value.total_cmp(&values[best]).is_gt() {
            best = idx;
        }
    }
    best.min(usize::from(u8::MAX)) as u8
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return vec![1.0 / logits.len().max(1) as f32; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}
