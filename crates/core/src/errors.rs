use thiserror::Error;

use crate::domain::invocation::InvocationStatus;
use crate::domain::run::RunStatus;
use crate::sanitizer::SanitizeViolation;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid run transition from {from:?} to {to:?}")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },
    #[error("invalid invocation transition from {from:?} to {to:?}")]
    InvalidInvocationTransition { from: InvocationStatus, to: InvocationStatus },
    #[error(transparent)]
    Sanitize(#[from] SanitizeViolation),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}
