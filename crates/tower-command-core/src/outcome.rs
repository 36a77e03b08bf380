//! The closed set of outcomes a command execution can produce.

use std::fmt;

/// What happened to one command invocation.
///
/// Every invocation records exactly one primary outcome (`Success`,
/// `Failure`, `Timeout`, `Rejected`, `ShortCircuited` or `BadRequest`) and,
/// when a fallback was attempted, exactly one fallback outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[repr(u8)]
pub enum ExecutionOutcome {
    /// The work completed in time and returned `Ok`.
    Success = 0,
    /// The work completed in time and returned an error.
    Failure = 1,
    /// The work did not complete before the deadline.
    Timeout = 2,
    /// The isolation pool had neither a free slot nor queue room.
    #[cfg_attr(feature = "serde", serde(rename = "REJECTED_BY_POOL"))]
    Rejected = 3,
    /// The circuit was open; the work was never attempted.
    ShortCircuited = 4,
    /// The work failed with an error classified as the caller's fault.
    ///
    /// Bad requests do not count toward circuit health and never trigger
    /// the fallback.
    BadRequest = 5,
    /// The fallback returned a value.
    FallbackSuccess = 6,
    /// The fallback returned an error.
    FallbackFailure = 7,
    /// The fallback concurrency limit was reached.
    FallbackRejected = 8,
    /// Fallback is enabled but none was supplied.
    FallbackMissing = 9,
}

impl ExecutionOutcome {
    /// Number of distinct outcomes.
    pub const COUNT: usize = 10;

    /// All outcomes, in index order.
    pub const ALL: [ExecutionOutcome; Self::COUNT] = [
        ExecutionOutcome::Success,
        ExecutionOutcome::Failure,
        ExecutionOutcome::Timeout,
        ExecutionOutcome::Rejected,
        ExecutionOutcome::ShortCircuited,
        ExecutionOutcome::BadRequest,
        ExecutionOutcome::FallbackSuccess,
        ExecutionOutcome::FallbackFailure,
        ExecutionOutcome::FallbackRejected,
        ExecutionOutcome::FallbackMissing,
    ];

    /// Dense index of this outcome, suitable for counter arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` for outcomes that count against circuit health.
    pub const fn is_error(self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Failure | ExecutionOutcome::Timeout | ExecutionOutcome::Rejected
        )
    }

    /// Returns `true` for outcomes that take part in health calculations
    /// (the denominator of the error percentage).
    pub const fn counts_toward_health(self) -> bool {
        matches!(self, ExecutionOutcome::Success) || self.is_error()
    }

    /// Returns `true` for outcomes describing the fallback path.
    pub const fn is_fallback(self) -> bool {
        matches!(
            self,
            ExecutionOutcome::FallbackSuccess
                | ExecutionOutcome::FallbackFailure
                | ExecutionOutcome::FallbackRejected
                | ExecutionOutcome::FallbackMissing
        )
    }

    /// Returns `true` if this primary outcome sends the invocation to the
    /// fallback path.
    pub const fn triggers_fallback(self) -> bool {
        matches!(self, ExecutionOutcome::ShortCircuited) || self.is_error()
    }

    /// Stable label used for metrics and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure => "failure",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::Rejected => "rejected",
            ExecutionOutcome::ShortCircuited => "short_circuited",
            ExecutionOutcome::BadRequest => "bad_request",
            ExecutionOutcome::FallbackSuccess => "fallback_success",
            ExecutionOutcome::FallbackFailure => "fallback_failure",
            ExecutionOutcome::FallbackRejected => "fallback_rejected",
            ExecutionOutcome::FallbackMissing => "fallback_missing",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
