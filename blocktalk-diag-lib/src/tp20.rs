//! VW TP 2.0 over an ELM327.
//!
//! A logical channel to one module is negotiated through the setup identifier
//! `0x200 + destination`, then messages are carried as 7-byte data segments
//! with a 4-bit sequence number and acknowledged in blocks.

use std::time::{Duration, Instant};

use blocktalk_elm327_lib::{
    describe, format_bytes, read_frames, read_status, read_string, CanFrame, FrameBatch,
    LineSource, Status, StatusSet,
};
use log::{debug, error, info, warn};
use smallvec::SmallVec;

use crate::config::MAX_RECV_TIMEOUT_MS;
use crate::error::{Error, Result};
use crate::link::Link;

/// Identifier channel setup requests go to (plus the destination address).
pub const SETUP_BASE_ID: u16 = 0x200;
/// The only receive identifier a setup reply may assign.
pub const EXPECTED_RX_ID: u16 = 0x300;
/// Largest block size a peer may ask for.
pub const MAX_BLOCK_SIZE: u8 = 0x0F;
/// Largest message a 16-bit length header can describe.
pub const MAX_MESSAGE_LEN: usize = 0xFFFF;

const SEGMENT_PAYLOAD: usize = 7;
const LENGTH_MASK: u16 = 0x7FFF;

/// Our channel parameters: block size 15, T1 100 ms, T3 10 ms.
const PARAMETERS: [u8; 5] = [0x0F, 0x8A, 0xFF, 0x4A, 0xFF];

const OP_PARAMS_REQUEST: u8 = 0xA0;
const OP_PARAMS_RESPONSE: u8 = 0xA1;
const OP_CHANNEL_TEST: u8 = 0xA3;
const OP_BREAK: u8 = 0xA4;
const OP_DISCONNECT: u8 = 0xA8;
const OP_SETUP_REQUEST: u8 = 0xC0;
const OP_SETUP_RESPONSE: u8 = 0xD0;
const ACK_NIBBLE: u8 = 0xB;

// ============================================================================
// Wire: what the segment layer needs from the adapter link
// ============================================================================

/// Line-level access to the adapter.
pub trait Wire: LineSource {
    /// Send one text command (`\r` appended).
    fn write_line(&mut self, text: &str) -> Result<()>;
    /// Send one CAN payload of at most 8 bytes.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;
}

impl Wire for Link {
    fn write_line(&mut self, text: &str) -> Result<()> {
        Link::write_line(self, text)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        Link::write_bytes(self, bytes)
    }
}

// ============================================================================
// Segments: pure encode / reassemble
// ============================================================================

/// How a data segment is framed (high nibble of its first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// `0x0`: more follow, the peer must acknowledge this one
    AckMore,
    /// `0x1`: last segment, acknowledgement expected
    AckLast,
    /// `0x2`: more follow, no acknowledgement
    More,
    /// `0x3`: last segment, no acknowledgement
    Last,
}

impl SegmentKind {
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x0 => Some(Self::AckMore),
            0x1 => Some(Self::AckLast),
            0x2 => Some(Self::More),
            0x3 => Some(Self::Last),
            _ => None,
        }
    }

    pub fn opcode(self) -> u8 {
        match self {
            Self::AckMore => 0x0,
            Self::AckLast => 0x1,
            Self::More => 0x2,
            Self::Last => 0x3,
        }
    }

    pub fn wants_ack(self) -> bool {
        matches!(self, Self::AckMore | Self::AckLast)
    }

    pub fn is_last(self) -> bool {
        matches!(self, Self::AckLast | Self::Last)
    }
}

/// One outgoing data segment: framing byte plus up to 7 payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub bytes: SmallVec<u8, 8>,
}

impl Segment {
    pub fn seq(&self) -> u8 {
        self.bytes[0] & 0x0F
    }

    /// Acknowledgement the peer answers this segment with.
    pub fn expected_ack(&self) -> u8 {
        (ACK_NIBBLE << 4) | ((self.seq() + 1) & 0x0F)
    }
}

/// Split `payload` behind a big-endian length header into data segments,
/// advancing `tx_seq` once per segment. Every `block_size`-th segment asks
/// for an acknowledgement, as does the last one.
pub fn encode_segments(payload: &[u8], tx_seq: &mut u8, block_size: u8) -> Vec<Segment> {
    let block_size = usize::from(block_size.max(1));
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut message = Vec::with_capacity(payload.len() + 2);
    message.extend_from_slice(&len.to_be_bytes());
    message.extend_from_slice(payload);

    let count = message.len().div_ceil(SEGMENT_PAYLOAD);
    message
        .chunks(SEGMENT_PAYLOAD)
        .enumerate()
        .map(|(i, chunk)| {
            let kind = if i + 1 == count {
                SegmentKind::AckLast
            } else if (i + 1) % block_size == 0 {
                SegmentKind::AckMore
            } else {
                SegmentKind::More
            };
            let mut bytes = SmallVec::new();
            bytes.push((kind.opcode() << 4) | *tx_seq);
            bytes.extend_from_slice(chunk);
            *tx_seq = (*tx_seq + 1) & 0x0F;
            Segment { kind, bytes }
        })
        .collect()
}

/// Collects incoming data segments into messages.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected: Option<usize>,
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message is partially collected.
    pub fn in_progress(&self) -> bool {
        self.expected.is_some()
    }

    /// Feed one segment (framing byte included). Returns the message once its
    /// last segment arrives.
    ///
    /// # Errors
    ///
    /// Unknown opcodes, out-of-order sequence numbers, a first segment too
    /// short for the length header and a message shorter than its header
    /// says are all violations.
    pub fn push(&mut self, segment: &[u8], rx_seq: &mut u8) -> Result<Option<Vec<u8>>> {
        let Some(&first) = segment.first() else {
            return Err(Error::violation("empty segment"));
        };
        let kind = SegmentKind::from_opcode(first >> 4)
            .ok_or_else(|| Error::violation(format!("unexpected opcode {first:02X}")))?;
        let seq = first & 0x0F;
        if seq != *rx_seq {
            return Err(Error::SequenceMismatch {
                expected: *rx_seq,
                received: seq,
            });
        }
        *rx_seq = (*rx_seq + 1) & 0x0F;

        let body = &segment[1..];
        match self.expected {
            None => {
                if segment.len() < 3 {
                    return Err(Error::violation("first segment too short for length"));
                }
                let len = u16::from_be_bytes([body[0], body[1]]) & LENGTH_MASK;
                self.expected = Some(usize::from(len));
                self.buffer.clear();
                self.buffer.extend_from_slice(&body[2..]);
            }
            Some(_) => self.buffer.extend_from_slice(body),
        }

        if !kind.is_last() {
            return Ok(None);
        }

        let expected = self.expected.take().unwrap_or(0);
        let mut message = std::mem::take(&mut self.buffer);
        if message.len() < expected {
            return Err(Error::violation(format!(
                "message of {} bytes, header said {expected}",
                message.len()
            )));
        }
        message.truncate(expected);
        Ok(Some(message))
    }
}

// ============================================================================
// Channel: handshake, segmented exchange and keep-alive
// ============================================================================

/// Timing and flow parameters agreed with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParameters {
    pub block_size: u8,
    pub t1: u8,
    pub t3: u8,
}

impl ChannelParameters {
    fn from_response(data: &[u8]) -> Option<Self> {
        if data.len() != 6 || data[0] != OP_PARAMS_RESPONSE || data[1] > MAX_BLOCK_SIZE {
            return None;
        }
        Some(Self {
            block_size: data[1],
            t1: data[2],
            t3: data[4],
        })
    }
}

/// An open channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub destination: u8,
    pub tx_id: u16,
    pub rx_id: u16,
    pub parameters: ChannelParameters,
    tx_seq: u8,
    rx_seq: u8,
}

/// Segment transport over one adapter.
pub struct Tp20<W: Wire> {
    wire: W,
    channel: Option<Channel>,
    /// Receive timeout currently programmed into the adapter.
    recv_timeout: Option<u16>,
    line_timeout: Duration,
    keep_alive_interval: Duration,
    last_keep_alive: Instant,
}

impl<W: Wire> Tp20<W> {
    pub fn new(wire: W, line_timeout: Duration, keep_alive_interval: Duration) -> Self {
        Self {
            wire,
            channel: None,
            recv_timeout: None,
            line_timeout,
            keep_alive_interval,
            last_keep_alive: Instant::now(),
        }
    }

    pub fn wire(&self) -> &W {
        &self.wire
    }

    pub fn wire_mut(&mut self) -> &mut W {
        &mut self.wire
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn destination(&self) -> Option<u8> {
        self.channel.as_ref().map(|c| c.destination)
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn set_keep_alive_interval(&mut self, interval: Duration) {
        self.keep_alive_interval = interval;
    }

    /// When the next channel test is due, if a channel is open.
    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.channel
            .as_ref()
            .map(|_| self.last_keep_alive + self.keep_alive_interval)
    }

    /// Forget adapter-side state, e.g. after the port was reopened.
    pub fn reset(&mut self) {
        self.channel = None;
        self.recv_timeout = None;
    }

    /// Bring a freshly opened adapter into CAN mode for TP 2.0.
    ///
    /// # Errors
    ///
    /// Any required command not answered with `OK`.
    pub fn initialise_adapter(&mut self) -> Result<()> {
        self.reset();

        // First answer may still carry echo or leftovers from before
        self.wire.write_line("AT E0")?;
        let _ = read_status(&mut self.wire, self.line_timeout);
        self.command_ok("AT E0")?;

        if let Some(version) = self.query("AT I")? {
            info!("Adapter: {version}");
        }
        if let Some(device) = self.query("AT @1")? {
            info!("Device: {device}");
        }

        match self.query("ST I")? {
            Some(stn) if stn != "?" => {
                info!("STN firmware: {stn}");
                for command in ["ST DI", "ST MFR", "ST SN"] {
                    if let Some(answer) = self.query(command)? {
                        info!("{command}: {answer}");
                    }
                }
                self.command_ok("ST FAP 000,000")?;
            }
            _ => debug!("Not an STN adapter"),
        }

        for command in ["AT PB C0 01", "AT SP B", "AT H1", "AT D1", "AT L0"] {
            self.command_ok(command)?;
        }
        info!("Adapter initialised");
        Ok(())
    }

    /// Negotiate a channel to `destination`, closing any open one first.
    ///
    /// # Errors
    ///
    /// Any deviation from the expected handshake; the channel stays closed.
    pub fn open_channel(&mut self, destination: u8, timeout_ms: u16) -> Result<()> {
        if self.channel.is_some() {
            self.close_channel();
        }
        info!("Opening channel to {destination:02X}");

        let result = self.handshake(destination, timeout_ms);
        match &result {
            Ok(()) => {
                self.last_keep_alive = Instant::now();
                info!("Channel to {destination:02X} open");
            }
            Err(e) => {
                warn!("Channel setup to {destination:02X} failed: {e}");
                self.channel = None;
            }
        }
        result
    }

    fn handshake(&mut self, destination: u8, timeout_ms: u16) -> Result<()> {
        self.apply_recv_timeout(timeout_ms)?;
        let setup_reply_id = SETUP_BASE_ID + u16::from(destination);
        self.command_ok(&format!("AT SH {SETUP_BASE_ID:03X}"))?;
        self.command_ok(&format!("AT CRA {setup_reply_id:03X}"))?;

        self.wire
            .write_bytes(&[destination, OP_SETUP_REQUEST, 0x00, 0x10, 0x00, 0x03, 0x01])?;
        let reply = self.single_frame()?;
        let d = reply.data();
        if d.len() != 7 || d[1] != OP_SETUP_RESPONSE {
            return Err(Error::violation(format!("bad setup reply {}", format_frame(&reply))));
        }
        let rx_id = (u16::from(d[3] & 0x0F) << 8) | u16::from(d[2]);
        let tx_id = (u16::from(d[5] & 0x0F) << 8) | u16::from(d[4]);
        let versions = (d[3] >> 4, d[5] >> 4);
        if versions != (0, 0) {
            return Err(Error::violation(format!(
                "unsupported channel version {}/{}",
                versions.0, versions.1
            )));
        }
        if rx_id != EXPECTED_RX_ID {
            return Err(Error::violation(format!("unexpected receive id {rx_id:03X}")));
        }

        self.command_ok(&format!("AT SH {tx_id:03X}"))?;
        self.command_ok(&format!("AT CRA {rx_id:03X}"))?;

        let mut request = vec![OP_PARAMS_REQUEST];
        request.extend_from_slice(&PARAMETERS);
        self.wire.write_bytes(&request)?;
        let reply = self.single_frame()?;
        let parameters = ChannelParameters::from_response(reply.data()).ok_or_else(|| {
            Error::violation(format!("bad parameter reply {}", format_frame(&reply)))
        })?;
        debug!("Channel parameters {parameters:?}, tx {tx_id:03X} rx {rx_id:03X}");

        self.channel = Some(Channel {
            destination,
            tx_id,
            rx_id,
            parameters,
            tx_seq: 0,
            rx_seq: 0,
        });
        Ok(())
    }

    /// Send `A8` and forget the channel.
    pub fn close_channel(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        info!("Closing channel to {:02X}", channel.destination);
        if self.wire.write_bytes(&[OP_DISCONNECT]).is_ok() {
            let batch = read_frames(&mut self.wire, self.line_timeout);
            debug!("Disconnect answered with {} frames", batch.frames.len());
        }
    }

    /// Close the channel for failures that leave it unusable; adapter status
    /// problems only fail the request.
    fn fail(&mut self, error: Error) -> Error {
        if error.breaks_channel() {
            self.abort(error)
        } else {
            warn!("Request failed, channel kept: {error}");
            error
        }
    }

    /// Tear the channel down after a failure.
    fn abort(&mut self, error: Error) -> Error {
        if let Some(channel) = &self.channel {
            error!("Channel to {:02X} failed: {error}", channel.destination);
        }
        if error.is_timeout() {
            self.channel = None;
        } else {
            self.close_channel();
        }
        error
    }

    /// Send `payload` and collect every message the peer answers with.
    ///
    /// # Errors
    ///
    /// Timeouts and protocol violations close the channel. A peer that
    /// answers with `NO DATA` or an adapter status line leaves it open.
    pub fn send_data(&mut self, payload: &[u8], timeout_ms: u16) -> Result<Vec<Vec<u8>>> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        if payload.is_empty() || payload.len() > MAX_MESSAGE_LEN {
            return Err(Error::violation(format!("cannot send {} bytes", payload.len())));
        }
        let segments = encode_segments(payload, &mut channel.tx_seq, channel.parameters.block_size);

        if let Err(e) = self.apply_recv_timeout(timeout_ms) {
            return Err(self.abort(e));
        }

        let Some((last, intermediate)) = segments.split_last() else {
            return Err(Error::violation("nothing to send"));
        };
        for segment in intermediate {
            if let Err(e) = self.send_segment(segment) {
                return Err(self.abort(e));
            }
        }
        self.receive(last)
    }

    fn send_segment(&mut self, segment: &Segment) -> Result<()> {
        self.wire.write_bytes(&segment.bytes)?;
        let batch = self.read_batch()?;
        if segment.kind.wants_ack() {
            match batch.frames.as_slice() {
                [ack] if batch.status.is_empty() && ack.data() == [segment.expected_ack()] => Ok(()),
                _ => Err(unexpected(&batch, "acknowledgement")),
            }
        } else if batch.frames.is_empty() && batch.status == StatusSet::only(Status::NoData) {
            Ok(())
        } else {
            Err(unexpected(&batch, "no answer"))
        }
    }

    fn receive(&mut self, last: &Segment) -> Result<Vec<Vec<u8>>> {
        if let Err(e) = self.wire.write_bytes(&last.bytes) {
            return Err(self.abort(e));
        }
        let batch = match self.read_batch() {
            Ok(b) => b,
            Err(e) => return Err(self.abort(e)),
        };

        if batch.frames.is_empty() && batch.status == StatusSet::only(Status::NoData) {
            warn!("Request not answered");
            return Err(Error::from_status(StatusSet::empty(), batch.status));
        }
        if !batch.status.is_empty() {
            return Err(self.fail(Error::from_status(StatusSet::empty(), batch.status)));
        }
        match batch.frames.split_first() {
            Some((ack, rest)) if ack.data() == [last.expected_ack()] && !rest.is_empty() => {
                self.reassemble(rest.to_vec()).map_err(|e| self.fail(e))
            }
            _ => Err(self.abort(unexpected(&batch, "acknowledgement and data"))),
        }
    }

    fn reassemble(&mut self, mut frames: Vec<CanFrame>) -> Result<Vec<Vec<u8>>> {
        let mut messages = Vec::new();
        let mut reassembler = Reassembler::new();

        loop {
            let mut rx_seq = self.channel.as_ref().ok_or(Error::ChannelClosed)?.rx_seq;
            let count = frames.len();
            let mut final_kind = None;

            for (i, frame) in frames.iter().enumerate() {
                let data = frame.data();
                let opcode = data.first().map_or(0xF, |b| b >> 4);
                let kind = SegmentKind::from_opcode(opcode).ok_or_else(|| {
                    Error::violation(format!("unexpected frame {}", format_frame(frame)))
                })?;
                if (kind.is_last() || kind.wants_ack()) && i + 1 != count {
                    return Err(Error::violation("segment that ends a burst is not last in batch"));
                }
                if let Some(message) = reassembler.push(data, &mut rx_seq)? {
                    debug!("Received {} byte message", message.len());
                    messages.push(message);
                }
                final_kind = Some(kind);
            }

            if let Some(channel) = self.channel.as_mut() {
                channel.rx_seq = rx_seq;
            }

            let batch = match final_kind {
                None => return Err(Error::violation("empty data batch")),
                Some(SegmentKind::Last) => return Ok(messages),
                Some(SegmentKind::More) => self.read_batch()?,
                Some(kind @ (SegmentKind::AckLast | SegmentKind::AckMore)) => {
                    self.wire.write_bytes(&[(ACK_NIBBLE << 4) | rx_seq])?;
                    let batch = self.read_batch()?;
                    if kind == SegmentKind::AckLast
                        && batch.frames.is_empty()
                        && batch.status == StatusSet::only(Status::NoData)
                    {
                        return Ok(messages);
                    }
                    if kind == SegmentKind::AckLast {
                        debug!("Another message follows");
                    }
                    batch
                }
            };

            if !batch.status.is_empty() || batch.frames.is_empty() {
                return Err(unexpected(&batch, "more data"));
            }
            frames = batch.frames;
        }
    }

    /// Send a channel test and refresh the parameters from its answer.
    ///
    /// # Errors
    ///
    /// No or a malformed answer; the channel is closed.
    pub fn keep_alive(&mut self) -> Result<()> {
        if self.channel.is_none() {
            return Ok(());
        }
        debug!("Keep-alive");
        self.last_keep_alive = Instant::now();

        let result = self.wire.write_bytes(&[OP_CHANNEL_TEST]).and_then(|()| self.read_batch());
        let batch = match result {
            Ok(b) => b,
            Err(e) => return Err(self.abort(e)),
        };
        let parameters = match batch.frames.as_slice() {
            [reply] if batch.status.is_empty() => ChannelParameters::from_response(reply.data()),
            _ => None,
        };
        let Some(parameters) = parameters else {
            return Err(self.abort(unexpected(&batch, "channel parameters")));
        };
        let channel = self.channel.as_mut().ok_or(Error::ChannelClosed)?;
        channel.parameters = parameters;
        Ok(())
    }

    /// Program the adapter receive timeout if it differs from the last one.
    fn apply_recv_timeout(&mut self, timeout_ms: u16) -> Result<()> {
        let timeout_ms = timeout_ms.min(MAX_RECV_TIMEOUT_MS);
        if self.recv_timeout == Some(timeout_ms) {
            return Ok(());
        }
        let result = self.command_ok(&format!("AT ST {:02X}", timeout_ms / 4));
        self.recv_timeout = result.is_ok().then_some(timeout_ms);
        result
    }

    /// Read one batch and handle peer commands embedded in it.
    fn read_batch(&mut self) -> Result<FrameBatch> {
        let mut batch = read_frames(&mut self.wire, self.line_timeout);
        batch.status.remove(Status::AtEcho);
        if batch.status.remove(Status::ProcessingError) {
            warn!("Skipped undecodable adapter output");
        }
        if batch.status.contains(Status::Timeout) || batch.status.contains(Status::NoPrompt) {
            return Err(Error::from_status(StatusSet::empty(), batch.status));
        }
        self.check_for_commands(&mut batch)?;
        Ok(batch)
    }

    fn check_for_commands(&mut self, batch: &mut FrameBatch) -> Result<()> {
        let before = batch.frames.len();
        let mut closed = false;
        let mut test_requested = false;

        batch.frames.retain(|frame| match frame.data() {
            [OP_CHANNEL_TEST, ..] => {
                test_requested = true;
                false
            }
            [OP_DISCONNECT | OP_BREAK, ..] => {
                closed = true;
                false
            }
            _ => true,
        });

        if closed {
            if let Some(channel) = self.channel.take() {
                warn!("Peer closed channel to {:02X}", channel.destination);
            }
            return Err(Error::ChannelClosed);
        }
        if test_requested {
            debug!("Answering channel test");
            let mut reply = vec![OP_PARAMS_RESPONSE];
            reply.extend_from_slice(&PARAMETERS);
            self.wire.write_bytes(&reply)?;
            let mut answer = read_frames(&mut self.wire, self.line_timeout);
            answer.status.remove(Status::AtEcho);
            if !answer.frames.is_empty() || answer.status != StatusSet::only(Status::NoData) {
                warn!(
                    "Unexpected answer to channel test reply: {} frames\n{}",
                    answer.frames.len(),
                    describe(answer.status)
                );
            }
            self.last_keep_alive = Instant::now();
        }
        if before > 0 && batch.frames.is_empty() && batch.status.is_empty() {
            batch.status |= Status::NoData;
        }
        Ok(())
    }

    fn single_frame(&mut self) -> Result<CanFrame> {
        let mut batch = self.read_batch()?;
        if batch.status.is_empty() && batch.frames.len() == 1 {
            if let Some(frame) = batch.frames.pop() {
                return Ok(frame);
            }
        }
        Err(unexpected(&batch, "a single frame"))
    }

    fn command_ok(&mut self, command: &str) -> Result<()> {
        self.wire.write_line(command)?;
        let mut status = read_status(&mut self.wire, self.line_timeout);
        status.remove(Status::AtEcho);
        if status == StatusSet::only(Status::Ok) {
            Ok(())
        } else {
            warn!("{command} failed:\n{}", describe(status));
            Err(Error::from_status(Status::Ok.into(), status))
        }
    }

    fn query(&mut self, command: &str) -> Result<Option<String>> {
        self.wire.write_line(command)?;
        let (answer, status) = read_string(&mut self.wire, self.line_timeout);
        if status.contains(Status::Timeout) {
            return Err(Error::TransportTimeout);
        }
        Ok(answer)
    }
}

fn format_frame(frame: &CanFrame) -> String {
    format!("{:03X} {}", frame.id(), format_bytes(frame.data()))
}

fn unexpected(batch: &FrameBatch, wanted: &str) -> Error {
    if !batch.status.is_empty() && batch.status != StatusSet::only(Status::NoData) {
        return Error::from_status(StatusSet::empty(), batch.status);
    }
    let frames: Vec<String> = batch.frames.iter().map(format_frame).collect();
    Error::violation(format!(
        "expected {wanted}, got [{}] ({})",
        frames.join(", "),
        describe(batch.status)
    ))
}
