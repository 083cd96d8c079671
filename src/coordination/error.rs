use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the coordination layer.
///
/// `ExhaustedRetries` deserves care at call sites: the shared value has been
/// re-seeded with the caller's best-effort value, but the attempted write is
/// unconfirmed and must not be assumed applied.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("{kind} `{name}` has already been registered")]
    AlreadyRegistered { kind: &'static str, name: String },
    #[error("invalid {kind} name: `{name}` is not registered")]
    InvalidName { kind: &'static str, name: String },
    #[error("unable to update {kind} `{name}` after {attempts} attempts; coordination service may be down")]
    ExhaustedRetries {
        kind: &'static str,
        name: String,
        attempts: u32,
    },
    #[error("coordination session is down")]
    Unavailable,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CoordinationError {
    pub fn already_registered(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyRegistered {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_name(kind: &'static str, name: impl Into<String>) -> Self {
        Self::InvalidName {
            kind,
            name: name.into(),
        }
    }

    pub fn exhausted_retries(kind: &'static str, name: impl Into<String>, attempts: u32) -> Self {
        Self::ExhaustedRetries {
            kind,
            name: name.into(),
            attempts,
        }
    }
}
