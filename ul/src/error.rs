//! Crate-level error type.
//!
//! Errors raised while decoding, encoding or driving the protocol
//! end the association they occur in,
//! with the exception of [`Error::NegotiationRejected`]
//! and [`Error::UnsupportedAbstractSyntax`],
//! which leave the caller free to carry on.
use snafu::{Backtrace, Snafu};

use crate::dul::fsm::AbortReason;
use crate::pdu::AssociationRJ;

#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// received a PDU which could not be decoded
    MalformedPdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to encode a PDU
    EncodePdu { source: crate::pdu::writer::Error },

    #[snafu(display("Unexpected event: {}", description))]
    UnexpectedEvent {
        description: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Association rejected: {}", association_rj))]
    NegotiationRejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// transport connection failure
    Transport {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Association closed: {}", reason))]
    Closed {
        reason: AbortReason,
        backtrace: Backtrace,
    },

    #[snafu(display("Timed out while waiting for {}", operation))]
    TimeoutExpired {
        operation: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("No accepted presentation context for `{}`", abstract_syntax))]
    UnsupportedAbstractSyntax {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    /// failed to process a DIMSE message
    Command {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    /// invalid configuration
    Config {
        #[snafu(backtrace)]
        source: crate::association::config::Error,
    },
}

/// Type alias for a result from this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the association can go on after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NegotiationRejected { .. } | Error::UnsupportedAbstractSyntax { .. }
        )
    }

    /// Map the reason of an abort indication
    /// into the error seen by the service user.
    pub(crate) fn from_abort(reason: AbortReason, operation: &'static str) -> Self {
        match reason {
            AbortReason::Timeout => TimeoutExpiredSnafu { operation }.build(),
            reason => ClosedSnafu { reason }.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::AbortRQSource;
    use matches::matches;

    #[test]
    fn abort_reasons_map_to_closed_or_timeout() {
        assert!(matches!(
            Error::from_abort(AbortReason::Timeout, "the release response"),
            Error::TimeoutExpired {
                operation: "the release response",
                ..
            }
        ));
        assert!(matches!(
            Error::from_abort(AbortReason::TransportClosed, "the association response"),
            Error::Closed {
                reason: AbortReason::TransportClosed,
                ..
            }
        ));
        let error = Error::from_abort(
            AbortReason::Peer(AbortRQSource::ServiceUser),
            "the association response",
        );
        assert!(matches!(error, Error::Closed { .. }));
        assert!(!error.is_recoverable());
    }
}
