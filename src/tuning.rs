//! Live retrieval parameters.
//!
//! [`TuningStore`] holds the one [`TuningParameters`] value every request
//! reads. Readers copy it out under a short read lock; the feedback tuner is
//! the only writer. Writes are clamped to the configured bounds, so a
//! snapshot is always in range.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use adaptive_rag_core::RetrievalError;

use crate::config::TunerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningParameters {
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
    #[serde(default = "default_rerank_threshold")]
    pub rerank_threshold: f64,
    /// Dense weight in fusion; the sparse weight is `1 - hybrid_weight`.
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight: f64,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: Option<f64>,
}

fn default_retrieval_k() -> usize {
    5
}
fn default_rerank_threshold() -> f64 {
    0.7
}
fn default_hybrid_weight() -> f64 {
    0.5
}
fn default_quality_threshold() -> Option<f64> {
    Some(3.0)
}

impl Default for TuningParameters {
    fn default() -> Self {
        Self {
            retrieval_k: default_retrieval_k(),
            rerank_threshold: default_rerank_threshold(),
            hybrid_weight: default_hybrid_weight(),
            quality_threshold: default_quality_threshold(),
        }
    }
}

/// Inclusive limits for each tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterBounds {
    pub k: (usize, usize),
    pub threshold: (f64, f64),
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self::from(&TunerConfig::default())
    }
}

impl From<&TunerConfig> for ParameterBounds {
    fn from(config: &TunerConfig) -> Self {
        Self {
            k: (config.k_range[0], config.k_range[1]),
            threshold: (config.threshold_range[0], config.threshold_range[1]),
        }
    }
}

/// `Err(InvalidParameter)` when `value` lies outside `[min, max]`.
pub fn check_bounds(name: &str, value: f64, min: f64, max: f64) -> Result<f64, RetrievalError> {
    if value.is_nan() || value < min || value > max {
        return Err(RetrievalError::InvalidParameter {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn clamp_logged(name: &str, value: f64, min: f64, max: f64) -> f64 {
    match check_bounds(name, value, min, max) {
        Ok(v) => v,
        Err(e) => {
            let clamped = if value.is_nan() { min } else { value.clamp(min, max) };
            warn!(error = %e, clamped, "Parameter out of range, clamping");
            clamped
        }
    }
}

impl ParameterBounds {
    /// `params` with every field forced into range.
    pub fn clamp(&self, params: TuningParameters) -> TuningParameters {
        let (k_min, k_max) = self.k;
        let (t_min, t_max) = self.threshold;
        TuningParameters {
            retrieval_k: clamp_logged("retrieval_k", params.retrieval_k as f64, k_min as f64, k_max as f64)
                as usize,
            rerank_threshold: clamp_logged("rerank_threshold", params.rerank_threshold, t_min, t_max),
            hybrid_weight: clamp_logged("hybrid_weight", params.hybrid_weight, 0.0, 1.0),
            quality_threshold: params
                .quality_threshold
                .map(|q| clamp_logged("quality_threshold", q, 0.0, 5.0)),
        }
    }
}

/// Shared, always-in-bounds parameter cell.
#[derive(Debug)]
pub struct TuningStore {
    bounds: ParameterBounds,
    current: RwLock<TuningParameters>,
}

impl TuningStore {
    pub fn new(initial: TuningParameters, bounds: ParameterBounds) -> Self {
        Self {
            current: RwLock::new(bounds.clamp(initial)),
            bounds,
        }
    }

    pub fn bounds(&self) -> ParameterBounds {
        self.bounds
    }

    /// Copy of the current parameters.
    pub fn snapshot(&self) -> TuningParameters {
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Apply `update` to the current value; the result is clamped and returned.
    pub fn update(&self, update: impl FnOnce(&mut TuningParameters)) -> TuningParameters {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = *guard;
        update(&mut next);
        *guard = self.bounds.clamp(next);
        *guard
    }

    pub fn replace(&self, params: TuningParameters) -> TuningParameters {
        self.update(|p| *p = params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = TuningParameters::default();
        assert_eq!(p.retrieval_k, 5);
        assert_eq!(p.rerank_threshold, 0.7);
        assert_eq!(p.hybrid_weight, 0.5);
        assert_eq!(p.quality_threshold, Some(3.0));
    }

    #[test]
    fn test_check_bounds() {
        assert_eq!(check_bounds("k", 3.0, 3.0, 15.0), Ok(3.0));
        assert!(matches!(
            check_bounds("k", 16.0, 3.0, 15.0),
            Err(RetrievalError::InvalidParameter { .. })
        ));
        assert!(check_bounds("w", f64::NAN, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_writes_are_clamped() {
        let store = TuningStore::new(TuningParameters::default(), ParameterBounds::default());
        let p = store.update(|p| {
            p.retrieval_k = 40;
            p.rerank_threshold = 0.01;
            p.hybrid_weight = -1.0;
        });
        assert_eq!(p.retrieval_k, 15);
        assert_eq!(p.rerank_threshold, 0.1);
        assert_eq!(p.hybrid_weight, 0.0);
        assert_eq!(store.snapshot(), p);
    }

    #[test]
    fn test_initial_value_is_clamped() {
        let initial = TuningParameters {
            retrieval_k: 1,
            ..Default::default()
        };
        let store = TuningStore::new(initial, ParameterBounds::default());
        assert_eq!(store.snapshot().retrieval_k, 3);
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let p: TuningParameters = serde_json::from_str(r#"{"retrieval_k": 9}"#).unwrap();
        assert_eq!(p.retrieval_k, 9);
        assert_eq!(p.hybrid_weight, 0.5);
    }
}
