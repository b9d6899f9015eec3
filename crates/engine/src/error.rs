use std::time::Duration;

use mirror_core::crd::reasons;
use mirror_core::SelectorError;
use mirror_kubehub::StoreError;
use mirror_queue::Backoff;

/// Retry schedule for failures that need a user edit to clear.
const STEEP: Backoff = Backoff { base: Duration::from_secs(30), max: Duration::from_secs(600) };

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid selector: {0}")]
    InvalidSelector(#[from] SelectorError),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("object store: {0}")]
    Store(#[from] StoreError),
    #[error("status write still conflicting after {attempts} attempts")]
    StatusConflict { attempts: u32 },
    #[error("cleanup in namespace {namespace} failed: {source}")]
    Cleanup {
        namespace: String,
        #[source]
        source: StoreError,
    },
}

impl Error {
    /// Dispatcher backoff for this failure.
    pub fn backoff(&self) -> Backoff {
        match self {
            Error::InvalidSelector(_) | Error::InvalidSpec(_) => STEEP,
            _ => Backoff::default(),
        }
    }

    /// Short label for metrics and the Ready condition.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidSelector(_) => reasons::INVALID_SELECTOR,
            Error::InvalidSpec(_) => reasons::INVALID_SPEC,
            Error::Store(_) => "StoreError",
            Error::StatusConflict { .. } => "StatusConflict",
            Error::Cleanup { .. } => "CleanupFailed",
        }
    }
}
