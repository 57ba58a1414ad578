use blocktalk_elm327_lib::{describe, Status, StatusSet};
use derive_more::{Display, Error, From};

/// Errors from the link, segment transport and diagnostic session.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    #[display("timed out waiting for the adapter")]
    TransportTimeout,
    #[display("adapter prompt not received")]
    NoPrompt,
    #[display("expected {expected:?}, adapter reported {received:?}")]
    UnexpectedStatus {
        expected: StatusSet,
        received: StatusSet,
    },
    #[display("could not decode adapter output")]
    Processing,
    #[display("protocol violation: {reason}")]
    ProtocolViolation { reason: String },
    #[display("sequence mismatch: expected {expected:X}, got {received:X}")]
    SequenceMismatch { expected: u8, received: u8 },
    #[display("negative response to service {service:02X} (reason {reason:02X?})")]
    NegativeResponse { service: u8, reason: Option<u8> },
    #[display("no channel open")]
    ChannelClosed,
    #[display("port not open")]
    PortClosed,
    #[display("request of {len} bytes does not fit a single frame")]
    TooLong { len: usize },
    #[display("I/O error: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("config error: {_0}")]
    #[from]
    Config(serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation { reason: reason.into() }
    }

    /// Map the flags of a failed batch to the most specific error.
    pub(crate) fn from_status(expected: StatusSet, received: StatusSet) -> Self {
        if received.contains(Status::Timeout) {
            Self::TransportTimeout
        } else if received.contains(Status::NoPrompt) {
            Self::NoPrompt
        } else if received.contains(Status::ProcessingError) {
            Self::Processing
        } else {
            log::debug!("Unexpected adapter status:\n{}", describe(received));
            Self::UnexpectedStatus { expected, received }
        }
    }

    /// Whether the channel can no longer be trusted after this error.
    ///
    /// Adapter status problems (`CAN ERROR`, `STOPPED`, ...) fail a single
    /// request; everything else means the peer and we are out of step.
    pub fn breaks_channel(&self) -> bool {
        !matches!(
            self,
            Self::UnexpectedStatus { .. } | Self::Processing | Self::NegativeResponse { .. }
        )
    }

    /// Whether the adapter stopped answering altogether.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TransportTimeout | Self::NoPrompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let none = StatusSet::empty();
        assert!(matches!(Error::from_status(none, Status::Timeout.into()), Error::TransportTimeout));
        assert!(matches!(
            Error::from_status(none, Status::NoData | Status::NoPrompt),
            Error::NoPrompt
        ));
        assert!(matches!(
            Error::from_status(Status::Ok.into(), Status::Unknown.into()),
            Error::UnexpectedStatus { .. }
        ));
    }

    #[test]
    fn test_status_errors_keep_channel() {
        assert!(!Error::from_status(none(), Status::CanError.into()).breaks_channel());
        assert!(!Error::from_status(none(), Status::Stopped.into()).breaks_channel());
        assert!(Error::from_status(none(), Status::Timeout.into()).breaks_channel());
        assert!(Error::violation("bad ack").breaks_channel());
        assert!(Error::SequenceMismatch { expected: 1, received: 2 }.breaks_channel());
    }

    fn none() -> StatusSet {
        StatusSet::empty()
    }

    #[test]
    fn test_display() {
        let e = Error::NegativeResponse {
            service: 0x21,
            reason: Some(0x31),
        };
        assert!(e.to_string().starts_with("negative response to service 21"));
        assert_eq!(Error::violation("bad opcode").to_string(), "protocol violation: bad opcode");
    }
}
