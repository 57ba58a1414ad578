//! Batch readers: collect everything the adapter prints for one command, up to
//! and including the `>` prompt.

use std::time::Duration;

use log::{debug, warn};

use crate::frame::CanFrame;
use crate::response::{LineResponse, Status, StatusSet};

/// Lines to wait for the prompt when nothing unusual happened.
pub const PROMPT_RETRIES: usize = 20;

/// Lines to wait for the prompt once a status line has been seen.
pub const PROMPT_RETRIES_AFTER_STATUS: usize = 1;

/// Lines to drain after a status or string answer.
const TRAILING_LINES: usize = 3;

/// Anything that yields completed adapter lines.
pub trait LineSource {
    /// Next line, waiting up to `timeout` when `wait` is set; otherwise only
    /// an already queued line is returned. `None` means nothing arrived.
    fn next_line(&mut self, timeout: Duration, wait: bool) -> Option<String>;
}

/// CAN frames and status flags from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBatch {
    pub frames: Vec<CanFrame>,
    pub status: StatusSet,
}

/// Read one CAN response batch.
///
/// A missing first line sets [`Status::Timeout`] and ends the batch. Status
/// lines set their flag and shrink the prompt budget to
/// [`PROMPT_RETRIES_AFTER_STATUS`]. Undecodable lines set
/// [`Status::ProcessingError`] and reading carries on.
pub fn read_frames(source: &mut impl LineSource, timeout: Duration) -> FrameBatch {
    let mut batch = FrameBatch::default();
    let mut response = LineResponse::classify(source.next_line(timeout, true).as_deref());

    if response == LineResponse::AtEcho {
        batch.status |= Status::AtEcho;
        response = LineResponse::classify(source.next_line(timeout, true).as_deref());
    }

    if response == LineResponse::Timeout {
        batch.status |= Status::Timeout;
        return batch;
    }

    let mut budget = PROMPT_RETRIES;
    if let Some(status) = leading_status(&response) {
        batch.status |= status;
        budget = PROMPT_RETRIES_AFTER_STATUS;
        response = LineResponse::classify(source.next_line(timeout, true).as_deref());
    }

    // Each line before the prompt uses up one unit of the budget
    let mut handled = 0;
    loop {
        match response {
            LineResponse::Prompt => return batch,
            LineResponse::Timeout => {
                batch.status |= Status::Timeout;
                return batch;
            }
            _ if handled >= budget => {
                warn!("Prompt not received after {} frames", batch.frames.len());
                batch.status |= Status::NoPrompt;
                return batch;
            }
            LineResponse::Frame(frame) => batch.frames.push(frame),
            other => {
                if let Some(status) = other.status() {
                    batch.status |= status;
                }
            }
        }
        handled += 1;
        response = LineResponse::classify(source.next_line(timeout, true).as_deref());
    }
}

/// Read the answer to a configuration command (`OK`, `?`, ...).
pub fn read_status(source: &mut impl LineSource, timeout: Duration) -> StatusSet {
    let mut status = StatusSet::empty();
    let mut response = LineResponse::classify(source.next_line(timeout, true).as_deref());

    if response == LineResponse::AtEcho {
        status |= Status::AtEcho;
        response = LineResponse::classify(source.next_line(timeout, true).as_deref());
    }

    match response {
        LineResponse::Prompt => return status,
        LineResponse::Timeout => return status | Status::Timeout,
        LineResponse::Frame(frame) => {
            debug!("Unexpected frame in status reply: {frame:?}");
            status |= Status::ProcessingError;
        }
        other => {
            if let Some(flag) = other.status() {
                status |= flag;
            }
        }
    }

    status | wait_for_prompt(source, timeout)
}

/// Read a free-text answer (`ATI`, `AT@1`, `STDI`, ...).
///
/// The first line is the answer; a few more lines are drained waiting for the
/// prompt.
pub fn read_string(source: &mut impl LineSource, timeout: Duration) -> (Option<String>, StatusSet) {
    match source.next_line(timeout, true) {
        None => (None, Status::Timeout.into()),
        Some(line) if line == crate::response::PROMPT => (None, StatusSet::empty()),
        Some(line) => (Some(line), wait_for_prompt(source, timeout)),
    }
}

fn wait_for_prompt(source: &mut impl LineSource, timeout: Duration) -> StatusSet {
    for _ in 0..TRAILING_LINES {
        match LineResponse::classify(source.next_line(timeout, true).as_deref()) {
            LineResponse::Prompt => return StatusSet::empty(),
            LineResponse::Timeout => return Status::Timeout.into(),
            _ => {}
        }
    }
    Status::NoPrompt.into()
}

fn leading_status(response: &LineResponse) -> Option<Status> {
    match response {
        LineResponse::Ok
        | LineResponse::Stopped
        | LineResponse::Unknown
        | LineResponse::NoData
        | LineResponse::CanError => response.status(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned lines; runs dry like an adapter that went silent.
    struct Script(VecDeque<String>);

    impl Script {
        fn new(lines: &[&str]) -> Self {
            Self(lines.iter().map(|l| (*l).to_string()).collect())
        }
    }

    impl LineSource for Script {
        fn next_line(&mut self, _timeout: Duration, _wait: bool) -> Option<String> {
            self.0.pop_front()
        }
    }

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_frames_until_prompt() {
        let mut src = Script::new(&["300 1 B1", "300 4 10 00 02 50", ">"]);
        let batch = read_frames(&mut src, T);
        assert!(batch.status.is_empty());
        assert_eq!(batch.frames.len(), 2);
        assert_eq!(batch.frames[1].data(), &[0x10, 0x00, 0x02, 0x50]);
    }

    #[test]
    fn test_no_data_batch() {
        let mut src = Script::new(&["NO DATA", ">"]);
        let batch = read_frames(&mut src, T);
        assert_eq!(batch.status, StatusSet::from(Status::NoData));
        assert!(batch.frames.is_empty());
    }

    #[test]
    fn test_echo_is_flagged_and_skipped() {
        let mut src = Script::new(&["AT SH 300", "OK", ">"]);
        let status = read_status(&mut src, T);
        assert_eq!(status, Status::AtEcho | Status::Ok);
    }

    #[test]
    fn test_silent_adapter_is_timeout() {
        let mut src = Script::new(&[]);
        assert_eq!(read_frames(&mut src, T).status, StatusSet::from(Status::Timeout));
        assert_eq!(read_status(&mut src, T), StatusSet::from(Status::Timeout));
        assert_eq!(read_string(&mut src, T), (None, Status::Timeout.into()));
    }

    #[test]
    fn test_bad_line_flags_processing_error_and_continues() {
        let mut src = Script::new(&["300 2 A1", "300 1 B1", ">"]);
        let batch = read_frames(&mut src, T);
        assert_eq!(batch.status, StatusSet::from(Status::ProcessingError));
        assert_eq!(batch.frames.len(), 1);
    }

    #[test]
    fn test_missing_prompt_after_status() {
        let mut src = Script::new(&["NO DATA", "300 1 B1", "300 1 B2", ">"]);
        let batch = read_frames(&mut src, T);
        assert!(batch.status.contains(Status::NoData));
        assert!(batch.status.contains(Status::NoPrompt));
        // Only one line is allowed after a status line
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.frames[0].data(), &[0xB1]);
    }

    #[test]
    fn test_prompt_budget_is_twenty_lines() {
        let mut lines = vec!["300 1 B1"; PROMPT_RETRIES];
        lines.push(">");
        let batch = read_frames(&mut Script::new(&lines), T);
        assert!(batch.status.is_empty());
        assert_eq!(batch.frames.len(), PROMPT_RETRIES);

        let mut lines = vec!["300 1 B1"; PROMPT_RETRIES + 1];
        lines.push(">");
        let batch = read_frames(&mut Script::new(&lines), T);
        assert_eq!(batch.status, StatusSet::from(Status::NoPrompt));
        assert_eq!(batch.frames.len(), PROMPT_RETRIES);
    }

    #[test]
    fn test_prompt_lost_mid_batch() {
        let mut src = Script::new(&["300 1 B1"]);
        let batch = read_frames(&mut src, T);
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.status, StatusSet::from(Status::Timeout));
    }

    #[test]
    fn test_status_without_prompt() {
        let mut src = Script::new(&["OK", "x", "y", "z", ">"]);
        assert_eq!(read_status(&mut src, T), Status::Ok | Status::NoPrompt);
    }

    #[test]
    fn test_read_string() {
        let mut src = Script::new(&["ELM327 v1.5", ">"]);
        assert_eq!(read_string(&mut src, T), (Some("ELM327 v1.5".to_string()), StatusSet::empty()));
    }
}
