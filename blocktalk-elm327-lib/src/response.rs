//! Classification of adapter output lines.

use enumset::{EnumSet, EnumSetType};
use log::warn;

use crate::frame::{CanFrame, FrameError};

/// Prompt the adapter prints when it is ready for the next command.
pub const PROMPT: &str = ">";

/// Conditions observed while reading one response batch.
#[derive(EnumSetType, Debug)]
pub enum Status {
    /// No line arrived in time.
    Timeout,
    /// The prompt never showed up within the retry budget.
    NoPrompt,
    Ok,
    Stopped,
    /// The adapter answered `?`.
    Unknown,
    /// The command was echoed back (`ATE1`).
    AtEcho,
    NoData,
    /// A line could not be decoded.
    ProcessingError,
    CanError,
}

/// Set of [`Status`] flags collected over a batch.
pub type StatusSet = EnumSet<Status>;

impl Status {
    pub fn description(self) -> &'static str {
        match self {
            Self::Timeout => "timed out waiting for the adapter",
            Self::NoPrompt => "adapter prompt not received",
            Self::Ok => "adapter answered OK",
            Self::Stopped => "adapter stopped monitoring",
            Self::Unknown => "adapter did not understand the command",
            Self::AtEcho => "adapter echoed the command",
            Self::NoData => "no data on the bus",
            Self::ProcessingError => "could not decode an adapter line",
            Self::CanError => "CAN bus error",
        }
    }
}

/// Render a status set as one description per line, for error logs.
pub fn describe(status: StatusSet) -> String {
    if status.is_empty() {
        return "no status".to_string();
    }
    status
        .iter()
        .map(Status::description)
        .collect::<Vec<_>>()
        .join("\n")
}

/// What a single adapter line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineResponse {
    AtEcho,
    Ok,
    Stopped,
    Unknown,
    NoData,
    CanError,
    Timeout,
    Prompt,
    Frame(CanFrame),
    ProcessingError(FrameError),
}

impl LineResponse {
    /// Classify a line as returned by a [`crate::LineSource`]; `None` means
    /// nothing arrived in time.
    pub fn classify(line: Option<&str>) -> Self {
        let Some(line) = line.map(str::trim) else {
            return Self::Timeout;
        };
        match line {
            "" => Self::Timeout,
            PROMPT => Self::Prompt,
            "OK" => Self::Ok,
            "STOPPED" => Self::Stopped,
            "?" => Self::Unknown,
            "NO DATA" => Self::NoData,
            "CAN ERROR" => Self::CanError,
            _ if line.starts_with("AT") => Self::AtEcho,
            _ => match CanFrame::parse(line) {
                Ok(frame) => Self::Frame(frame),
                Err(e) => {
                    warn!("Unparseable adapter line: {e}");
                    Self::ProcessingError(e)
                }
            },
        }
    }

    /// The status flag this line raises, if it is a status line.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::AtEcho => Some(Status::AtEcho),
            Self::Ok => Some(Status::Ok),
            Self::Stopped => Some(Status::Stopped),
            Self::Unknown => Some(Status::Unknown),
            Self::NoData => Some(Status::NoData),
            Self::CanError => Some(Status::CanError),
            Self::Timeout => Some(Status::Timeout),
            Self::ProcessingError(_) => Some(Status::ProcessingError),
            Self::Prompt | Self::Frame(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_lines() {
        assert_eq!(LineResponse::classify(Some("OK")), LineResponse::Ok);
        assert_eq!(LineResponse::classify(Some("NO DATA")), LineResponse::NoData);
        assert_eq!(LineResponse::classify(Some("CAN ERROR")), LineResponse::CanError);
        assert_eq!(LineResponse::classify(Some("?")), LineResponse::Unknown);
        assert_eq!(LineResponse::classify(Some("STOPPED")), LineResponse::Stopped);
        assert_eq!(LineResponse::classify(Some(">")), LineResponse::Prompt);
        assert_eq!(LineResponse::classify(Some("AT SH 200")), LineResponse::AtEcho);
        assert_eq!(LineResponse::classify(None), LineResponse::Timeout);
        assert_eq!(LineResponse::classify(Some("")), LineResponse::Timeout);
    }

    #[test]
    fn test_classify_frame_and_garbage() {
        assert!(matches!(
            LineResponse::classify(Some("300 1 B1")),
            LineResponse::Frame(f) if f.data() == [0xB1]
        ));
        let garbage = LineResponse::classify(Some("BUS INIT: ...ERROR"));
        assert!(matches!(garbage, LineResponse::ProcessingError(_)));
        assert_eq!(garbage.status(), Some(Status::ProcessingError));
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(StatusSet::empty()), "no status");
        let text = describe(Status::NoData | Status::Timeout);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("no data on the bus"));
    }
}
