//! Admission decisions and how they surface to callers and metrics.

use std::fmt;

use crate::error::GateError;
use crate::store::StoreOutcome;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// A concurrent decision for the same user held the lock.
    Contention,
    /// The allowed period since the last permitted action has not passed.
    PeriodNotElapsed,
}

/// The gate's answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Allowed,
    Denied(DenialReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

impl From<StoreOutcome> for Decision {
    fn from(outcome: StoreOutcome) -> Self {
        match outcome {
            StoreOutcome::Written => Decision::Allowed,
            StoreOutcome::PeriodNotElapsed => Decision::Denied(DenialReason::PeriodNotElapsed),
            StoreOutcome::Contention => Decision::Denied(DenialReason::Contention),
        }
    }
}

/// Final outcome of a call as reported to the metrics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    DeniedContention,
    DeniedPeriodNotElapsed,
    StorageFailure,
    /// The call was rejected before reaching the store.
    InvalidRequest,
}

impl Outcome {
    /// Value of the `status` metric label.
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Allowed => "success",
            _ => "failure",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::DeniedContention => "denied_contention",
            Outcome::DeniedPeriodNotElapsed => "denied_period_not_elapsed",
            Outcome::StorageFailure => "storage_failure",
            Outcome::InvalidRequest => "invalid_request",
        }
    }
}

impl From<Decision> for Outcome {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Allowed => Outcome::Allowed,
            Decision::Denied(DenialReason::Contention) => Outcome::DeniedContention,
            Decision::Denied(DenialReason::PeriodNotElapsed) => Outcome::DeniedPeriodNotElapsed,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller-facing layer should do with a gate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerResponse {
    /// Continue with normal processing.
    Proceed,
    /// Reject with a rate-limit-exceeded response.
    RateLimitExceeded,
    /// Reject the malformed request.
    InvalidRequest,
    /// Report an internal failure, distinct from rate limiting.
    InternalFailure,
    /// The deadline passed before the decision was known.
    ResultUnknown,
}

impl CallerResponse {
    pub fn from_result(result: &Result<Decision, GateError>) -> Self {
        match result {
            Ok(Decision::Allowed) => CallerResponse::Proceed,
            Ok(Decision::Denied(_)) => CallerResponse::RateLimitExceeded,
            Err(GateError::InvalidUser) => CallerResponse::InvalidRequest,
            Err(GateError::Storage(_)) => CallerResponse::InternalFailure,
            Err(GateError::OutcomeUnknown(_)) => CallerResponse::ResultUnknown,
        }
    }

    /// HTTP status code conventionally used for this response.
    pub fn status_code(&self) -> u16 {
        match self {
            CallerResponse::Proceed => 200,
            CallerResponse::RateLimitExceeded => 429,
            CallerResponse::InvalidRequest => 400,
            CallerResponse::InternalFailure => 500,
            CallerResponse::ResultUnknown => 503,
        }
    }
}
