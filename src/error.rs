/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/error.rs
* This file defines the unified error type shared by every reconciler in the
* operator, together with the retryable sentinel that tells a controller's
* error policy to requeue with backoff instead of surfacing a terminal
* condition. Non-retryable errors are projected onto `Ready=False` conditions
* by the controller that observed them; they are never allowed to panic.
* SPDX-License-Identifier: Apache-2.0 */

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Any error returned by the Kubernetes API server.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The finalizer helper wraps reconcile errors with its own type; unwrap
    /// the interesting half and keep the rest as a string.
    #[error("finalizer error: {0}")]
    FinalizerError(String),

    /// Object state that the user has to fix (bad selector, missing field,
    /// missing namespace on a namespaced resource).
    #[error("invalid user input: {0}")]
    UserInputError(String),

    /// A selector in `targets`, `targetRestrictions`, or a partition failed
    /// to evaluate. Surfaces as `Ready=False` with a "targeting error"
    /// message on the owning Bundle.
    #[error("targeting error: {0}")]
    TargetingError(String),

    /// A secret referenced by a spec does not exist yet or is malformed.
    #[error("referenced secret {name:?}: {reason}")]
    SecretError { name: String, reason: String },

    /// The per-bundle values secret digest does not match `spec.valuesHash`.
    /// Always retryable; the CLI may still be writing the secret.
    #[error("failed to load values secret: {0}")]
    ValuesHashMismatch(String),

    /// Remote listing or authentication failure from the git poller.
    #[error("git error: {0}")]
    GitError(#[from] git2::Error),

    /// OCI registry push/delete failure. Retryable; the bundle keeps its
    /// previous contents reference.
    #[error("OCI registry error: {0}")]
    OciError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Transient condition the controller expects to heal on its own; the
    /// error policy requeues with backoff and no condition is rewritten.
    #[error("retryable: {0}")]
    RetryableError(String),
}

impl Error {
    /// Errors the error policy should retry with backoff rather than
    /// treating as a terminal misconfiguration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::ValuesHashMismatch(_)
                | Error::GitError(_)
                | Error::OciError(_)
                | Error::RetryableError(_)
        )
    }
}

impl<E> From<kube::runtime::finalizer::Error<E>> for Error
where
    E: std::error::Error + 'static,
{
    fn from(e: kube::runtime::finalizer::Error<E>) -> Self {
        Error::FinalizerError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::RetryableError("conflict".into()).is_retryable());
        assert!(Error::ValuesHashMismatch("digest mismatch".into()).is_retryable());
        assert!(!Error::UserInputError("no namespace".into()).is_retryable());
        assert!(!Error::TargetingError("bad operator".into()).is_retryable());
    }
}
