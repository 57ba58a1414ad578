//! Mock ELM327 adapter wired to a simulated TP 2.0 vehicle
//!
//! [`MockAdapter`] behaves like the serial side of a real adapter: bytes
//! written to it are echoed and interpreted as commands, and responses become
//! readable afterwards. It is used in-memory by tests and over TCP by the
//! `blocktalk-mock-elm327` binary.

mod ecu;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use blocktalk_elm327_lib::{AdapterState, CanFrame};
use log::debug;

pub use ecu::{
    Cell, MockCar, MockEcu, MockModule, MockSettings, ECU_RX_ID, ECU_TX_ID, GATEWAY_ADDRESS,
    SETUP_BASE_ID,
};

/// How long a read waits for output before reporting `TimedOut`.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

struct Inner {
    state: AdapterState,
    ecu: MockEcu,
    command: Vec<u8>,
    output: VecDeque<u8>,
}

impl Inner {
    fn process_command(&mut self, command: &str) -> String {
        let cmd = command.trim().to_uppercase();
        let compact: String = cmd.chars().filter(|c| !c.is_whitespace()).collect();

        if compact.starts_with("AT") {
            // Override AT@1 for mock adapter identification
            if compact == "AT@1" {
                return self.state.reply("Mock ELM327");
            }
            return self.state.handle_at_command(&compact);
        }
        if compact.starts_with("ST") {
            return self.handle_st_command(&compact);
        }

        match parse_hex_bytes(&compact) {
            Some(bytes) => {
                let frames = self.ecu.on_frame(self.state.send_header, &bytes);
                self.frames_response(&frames)
            }
            None => self.state.reply("?"),
        }
    }

    fn frames_response(&mut self, frames: &[CanFrame]) -> String {
        let le = self.state.line_ending();
        let settings = &mut self.ecu.settings;
        if frames.is_empty() {
            return self.state.frames_response(frames);
        }
        if let Some(status) = settings.replace_next_reply.take() {
            return format!("{status}{le}{le}>");
        }
        let mut response = self.state.frames_response(frames);
        if std::mem::take(&mut settings.garble_next_reply) {
            response.insert_str(0, &format!("3X0 2 ZZ QQ{le}"));
        }
        response
    }

    fn handle_st_command(&self, cmd: &str) -> String {
        if !self.ecu.settings.stn {
            return self.state.reply("?");
        }
        let text = match cmd {
            "STI" => "STN1110 v4.2.0",
            "STDI" => "OBDLink SX r4.2",
            "STMFR" => "ScanTool.net LLC",
            "STSN" => "110012345678",
            _ if cmd.starts_with("STFAP") => "OK",
            _ => "?",
        };
        self.state.reply(text)
    }
}

fn parse_hex_bytes(compact: &str) -> Option<Vec<u8>> {
    if compact.is_empty() || compact.len() % 2 != 0 || compact.len() > 16 {
        return None;
    }
    if !compact.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&compact[i..i + 2], 16).ok())
        .collect()
}

struct Shared {
    inner: Mutex<Inner>,
    ready: Condvar,
}

/// In-memory ELM327 with a simulated car behind it. Clones share the same
/// adapter, so a test can keep a handle for fault injection.
#[derive(Clone)]
pub struct MockAdapter {
    shared: Arc<Shared>,
    read_timeout: Duration,
}

impl MockAdapter {
    pub fn new(car: MockCar) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: AdapterState::new(),
                    ecu: MockEcu::new(car),
                    command: Vec::new(),
                    output: VecDeque::new(),
                }),
                ready: Condvar::new(),
            }),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Change fault-injection settings; takes effect on the next command.
    pub fn update_settings(&self, f: impl FnOnce(&mut MockSettings)) {
        let mut inner = self.shared.inner.lock().unwrap();
        f(&mut inner.ecu.settings);
    }

    /// Address of the module the simulated bus currently has a channel with.
    pub fn channel_address(&self) -> Option<u8> {
        self.shared.inner.lock().unwrap().ecu.channel_address()
    }

    /// How many module-initiated channel tests the tester has answered.
    pub fn channel_tests_answered(&self) -> usize {
        self.shared.inner.lock().unwrap().ecu.channel_tests_answered
    }

    /// Current adapter-side AT settings.
    pub fn adapter_state(&self) -> AdapterState {
        self.shared.inner.lock().unwrap().state.clone()
    }
}

impl Write for MockAdapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        for &ch in buf {
            // Echo character if enabled
            if inner.state.echo_enabled {
                inner.output.push_back(ch);
            }

            // Carriage return terminates command
            if ch == b'\r' {
                let command = String::from_utf8_lossy(&inner.command).into_owned();
                inner.command.clear();
                if command.trim().is_empty() {
                    continue;
                }
                debug!("RX: {}", command.trim());
                let response = inner.process_command(&command);
                debug!("TX: {}", response.escape_debug());
                inner.output.extend(response.bytes());
            } else if ch != b'\n' {
                // Accumulate command (ignore linefeeds)
                inner.command.push(ch);
            }
        }
        drop(inner);
        self.shared.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.shared.inner.lock().unwrap();
        let (mut inner, _) = self
            .shared
            .ready
            .wait_timeout_while(inner, self.read_timeout, |i| i.output.is_empty())
            .unwrap();

        if inner.output.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no adapter output"));
        }
        let n = buf.len().min(inner.output.len());
        for (slot, byte) in buf.iter_mut().zip(inner.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
