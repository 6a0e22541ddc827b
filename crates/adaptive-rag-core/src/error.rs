//! Error kinds shared by every retrieval component.
//!
//! Only [`RetrievalError::NotFitted`] and [`RetrievalError::Cancelled`] are
//! meant to reach a caller of the orchestrator. Provider failures are
//! recovered by skipping the stage that needed the provider, and bound
//! violations are clamped by the tuning store.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("Index has not been fitted")]
    NotFitted,
    #[error("Provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },
    #[error("Parameter '{name}' = {value} outside [{min}, {max}]")]
    InvalidParameter {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Request cancelled")]
    Cancelled,
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl RetrievalError {
    pub fn provider(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = RetrievalError> = std::result::Result<T, E>;
