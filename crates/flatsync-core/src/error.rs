//! Error taxonomy shared by every pipeline component.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure reaching the listing source.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A detail page did not have the expected shape.
    #[error("detail page {link} did not parse: {message}")]
    DetailParse { link: String, message: String },

    /// The record store could not be reached or rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// The downstream consumer did not accept a delivery.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn detail_parse(link: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DetailParse {
            link: link.into(),
            message: message.into(),
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// Step-level failures worth another attempt by the invoker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable(_) | SyncError::Store(_) | SyncError::Delivery(_)
        )
    }
}
