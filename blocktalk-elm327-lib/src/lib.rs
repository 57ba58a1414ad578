//! ELM327 protocol implementation for raw CAN communication
//!
//! This library provides the text side of talking to an ELM327-compatible
//! adapter with headers and DLC display enabled: splitting the byte stream into
//! lines, classifying each line, decoding CAN frame lines, and reading whole
//! response batches up to the `>` prompt. It also carries the adapter-side AT
//! command state used by simulated adapters.

mod adapter;
mod frame;
mod line;
mod reader;
mod response;

pub use adapter::{AdapterState, ELM_VERSION};
pub use frame::{format_bytes, CanFrame, FrameData, FrameError, MAX_FRAME_LEN, MAX_STANDARD_ID};
pub use line::LineAssembler;
pub use reader::{
    read_frames, read_status, read_string, FrameBatch, LineSource, PROMPT_RETRIES,
    PROMPT_RETRIES_AFTER_STATUS,
};
pub use response::{describe, LineResponse, Status, StatusSet, PROMPT};
