//! Error types for protocol runs.
//!
//! Node-level failures are absorbed by the response aggregator and only
//! surface once they drop a round below its quorum threshold. Cryptographic
//! verification failures are never absorbed: they abort the run immediately,
//! because retrying with the same inputs reproduces the same failure.
use core::fmt;
use std::error;

/// Why a round failed to assemble a quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumFailure {
    /// At least one node refused because the account has made too many attempts.
    RateLimited,
    /// Too few nodes answered at all.
    NodesUnreachable,
}

/// Represents an error which can happen when running a protocol.
#[derive(Debug)]
pub enum ProtocolError {
    /// Fewer distinct successful node responses than the round required.
    QuorumNotMet(QuorumFailure),
    /// A point, scalar, or structured payload failed to decode.
    InvalidEncoding(String),
    /// An aggregate signature check failed. Fatal to the current run.
    SignatureAggregationFailed(String),
    /// The blind-signature check failed at the authentication round.
    ///
    /// Distinguished from infrastructure failure so a caller can prompt for
    /// the password again instead of reporting an outage.
    WrongPassword,
    /// A node rejected the final commit after verification had succeeded.
    ///
    /// Partial commits across a threshold system cannot be rolled back from
    /// the client alone; this is left for manual reconciliation.
    CommitFailed(String),
    /// A flow was continued before being started, or after it completed.
    NoSavedState,
    /// A scalar with no modular inverse (zero) reached an inversion.
    NotInvertible,
    /// Some assertion in the protocol failed.
    AssertionFailed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::QuorumNotMet(QuorumFailure::RateLimited) => {
                write!(f, "quorum not met: too many attempts")
            }
            ProtocolError::QuorumNotMet(QuorumFailure::NodesUnreachable) => {
                write!(f, "quorum not met: nodes for this account are unreachable")
            }
            ProtocolError::InvalidEncoding(e) => write!(f, "invalid encoding: {}", e),
            ProtocolError::SignatureAggregationFailed(e) => {
                write!(f, "aggregate signature check failed: {}", e)
            }
            ProtocolError::WrongPassword => write!(f, "wrong password"),
            ProtocolError::CommitFailed(e) => write!(f, "commit failed: {}", e),
            ProtocolError::NoSavedState => write!(f, "flow has no saved state to continue from"),
            ProtocolError::NotInvertible => write!(f, "scalar has no modular inverse"),
            ProtocolError::AssertionFailed(e) => write!(f, "assertion failed: {}", e),
        }
    }
}

impl error::Error for ProtocolError {}

/// Represents an error which can happen when *initializing* a flow.
///
/// These are related to bad parameters, and are usually more recoverable
/// than errors happening mid-protocol.
#[derive(Debug)]
pub enum InitializationError {
    BadParameters(String),
}

impl fmt::Display for InitializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitializationError::BadParameters(s) => write!(f, "bad parameters: {}", s),
        }
    }
}

impl error::Error for InitializationError {}
