//! XA return codes, flags and the structured resource error
//!
//! Codes follow the X/Open XA specification numbering so that drivers can pass
//! through whatever their resource manager reports.

use std::fmt;

// ============================================================================
// XA Return Codes
// ============================================================================

/// Normal execution.
pub const XA_OK: i32 = 0;
/// Routine returned with no effect and may be reissued.
pub const XA_RETRY: i32 = 4;
/// The branch was read-only and has been committed.
pub const XA_RDONLY: i32 = 3;
/// The branch was partially committed and partially rolled back.
pub const XA_HEURMIX: i32 = 5;
/// The branch was heuristically rolled back.
pub const XA_HEURRB: i32 = 6;
/// The branch was heuristically committed.
pub const XA_HEURCOM: i32 = 7;
/// The branch may have been heuristically completed.
pub const XA_HEURHAZ: i32 = 8;

/// Lower bound of the rollback codes.
pub const XA_RBBASE: i32 = 100;
pub const XA_RBROLLBACK: i32 = XA_RBBASE;
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;
/// Upper bound of the rollback codes.
pub const XA_RBEND: i32 = XA_RBTRANSIENT;

// ============================================================================
// XA Error Codes
// ============================================================================

/// Asynchronous operation already outstanding.
pub const XAER_ASYNC: i32 = -2;
/// A resource manager error occurred in the transaction branch.
pub const XAER_RMERR: i32 = -3;
/// The XID is not valid.
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments were given.
pub const XAER_INVAL: i32 = -5;
/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;
/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;
/// The XID already exists.
pub const XAER_DUPID: i32 = -8;
/// Resource manager doing work outside the global transaction.
pub const XAER_OUTSIDE: i32 = -9;

/// Decode an XA code into its symbolic name
pub fn code_name(code: i32) -> &'static str {
    match code {
        XA_OK => "XA_OK",
        XA_RDONLY => "XA_RDONLY",
        XA_RETRY => "XA_RETRY",
        XA_HEURMIX => "XA_HEURMIX",
        XA_HEURRB => "XA_HEURRB",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURHAZ => "XA_HEURHAZ",
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_RBDEADLOCK => "XA_RBDEADLOCK",
        XA_RBINTEGRITY => "XA_RBINTEGRITY",
        XA_RBOTHER => "XA_RBOTHER",
        XA_RBPROTO => "XA_RBPROTO",
        XA_RBTIMEOUT => "XA_RBTIMEOUT",
        XA_RBTRANSIENT => "XA_RBTRANSIENT",
        XAER_ASYNC => "XAER_ASYNC",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        XAER_OUTSIDE => "XAER_OUTSIDE",
        _ => "XA_UNKNOWN",
    }
}

// ============================================================================
// Flags & Votes
// ============================================================================

/// Flag passed to `start` when associating a connection with a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// New branch (TMNOFLAGS)
    NoFlags,
    /// Join a branch already known to the resource (TMJOIN)
    Join,
    /// Resume a suspended association (TMRESUME)
    Resume,
}

/// Flag passed to `end` when dissociating a connection from a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    /// Work completed (TMSUCCESS)
    Success,
    /// Work failed, the branch will be rolled back (TMFAIL)
    Fail,
    /// Temporarily suspend the association (TMSUSPEND)
    Suspend,
}

/// Phase-1 vote of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// XA_OK: branch prepared, awaiting the decision
    Commit,
    /// XA_RDONLY: nothing to commit, the branch is already finished
    ReadOnly,
}

// ============================================================================
// Error
// ============================================================================

/// Heuristic decision a resource took unilaterally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicKind {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

impl HeuristicKind {
    pub fn code(&self) -> i32 {
        match self {
            HeuristicKind::Commit => XA_HEURCOM,
            HeuristicKind::Rollback => XA_HEURRB,
            HeuristicKind::Mixed => XA_HEURMIX,
            HeuristicKind::Hazard => XA_HEURHAZ,
        }
    }
}

/// Coarse classification of an [`XaError`], driving retry and outcome policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The call had no effect and may be reissued (XA_RETRY)
    Transient,
    /// The resource manager cannot be reached (XAER_RMFAIL)
    Unavailable,
    /// The resource decided the branch outcome on its own
    Heuristic(HeuristicKind),
    /// The resource rejected the branch or the call (XAER_NOTA, XAER_INVAL, ...)
    Protocol,
    /// The resource rolled the branch back (XA_RB*)
    RolledBack,
}

impl ErrorClass {
    /// Whether a failed phase-2 call in this class may be reissued later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Unavailable)
    }
}

/// Error reported by a resource driver, carrying an XA code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaError {
    pub code: i32,
    pub message: String,
}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Symbolic name of the code, e.g. `XAER_RMFAIL`
    pub fn code_name(&self) -> &'static str {
        code_name(self.code)
    }

    pub fn class(&self) -> ErrorClass {
        match self.code {
            XA_RETRY => ErrorClass::Transient,
            XAER_RMFAIL => ErrorClass::Unavailable,
            XA_HEURCOM => ErrorClass::Heuristic(HeuristicKind::Commit),
            XA_HEURRB => ErrorClass::Heuristic(HeuristicKind::Rollback),
            XA_HEURMIX => ErrorClass::Heuristic(HeuristicKind::Mixed),
            XA_HEURHAZ => ErrorClass::Heuristic(HeuristicKind::Hazard),
            XA_RBBASE..=XA_RBEND => ErrorClass::RolledBack,
            _ => ErrorClass::Protocol,
        }
    }
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code_name())
    }
}

impl std::error::Error for XaError {}

pub type XaResult<T> = Result<T, XaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(XaError::new(XA_RETRY, "").class(), ErrorClass::Transient);
        assert_eq!(XaError::new(XAER_RMFAIL, "").class(), ErrorClass::Unavailable);
        assert_eq!(
            XaError::new(XA_HEURMIX, "").class(),
            ErrorClass::Heuristic(HeuristicKind::Mixed)
        );
        assert_eq!(XaError::new(XA_RBDEADLOCK, "").class(), ErrorClass::RolledBack);
        assert_eq!(XaError::new(XAER_INVAL, "").class(), ErrorClass::Protocol);
        assert_eq!(XaError::new(XAER_RMERR, "").class(), ErrorClass::Protocol);
        assert_eq!(XaError::new(-77, "").class(), ErrorClass::Protocol);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::Unavailable.is_retryable());
        assert!(!ErrorClass::Protocol.is_retryable());
        assert!(!ErrorClass::Heuristic(HeuristicKind::Hazard).is_retryable());
        assert!(!ErrorClass::RolledBack.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = XaError::new(XAER_RMERR, "resource 2 prepare failed");
        assert_eq!(err.to_string(), "resource 2 prepare failed (XAER_RMERR)");
        assert_eq!(code_name(12345), "XA_UNKNOWN");
        assert_eq!(HeuristicKind::Hazard.code(), XA_HEURHAZ);
    }
}
