//! Adapter-side AT command state, for simulated adapters.

use crate::frame::CanFrame;

/// Identification string returned by `ATZ` and `ATI`.
pub const ELM_VERSION: &str = "ELM327 v1.5";

/// Per-connection adapter settings (ELM327 side of the conversation)
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // These are independent ELM327 protocol flags
pub struct AdapterState {
    /// Echo received characters back (ATE0/ATE1)
    pub echo_enabled: bool,
    /// Add linefeeds after carriage returns (ATL0/ATL1)
    pub linefeeds_enabled: bool,
    /// Print spaces between response bytes (ATS0/ATS1)
    pub spaces_enabled: bool,
    /// Show CAN identifiers in responses (ATH0/ATH1)
    pub headers_enabled: bool,
    /// Show the data length digit in responses (ATD0/ATD1)
    pub dlc_enabled: bool,
    /// Identifier used for transmitted frames (ATSH)
    pub send_header: u16,
    /// Only show frames with this identifier (ATCRA); `None` shows all
    pub receive_address: Option<u16>,
    /// Response timeout in milliseconds (ATST, 4 ms units)
    pub timeout_ms: u16,
    /// Last protocol selected with ATSP
    pub protocol: char,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
            dlc_enabled: false,
            send_header: 0x7DF,
            receive_address: None,
            timeout_ms: 200,
            protocol: '0',
        }
    }
}

impl AdapterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format a line ending based on current settings
    pub fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Whether a frame with this identifier passes the `ATCRA` filter.
    pub fn accepts(&self, id: u16) -> bool {
        self.receive_address.is_none_or(|addr| addr == id)
    }

    /// Render a received frame according to the header/DLC/space settings.
    pub fn format_frame(&self, frame: &CanFrame) -> String {
        frame.to_line(self.headers_enabled, self.dlc_enabled, self.spaces_enabled)
    }

    /// Full response (without echo) for a batch of received frames.
    pub fn frames_response(&self, frames: &[CanFrame]) -> String {
        let le = self.line_ending();
        let shown: Vec<&CanFrame> = frames.iter().filter(|f| self.accepts(f.id())).collect();
        if shown.is_empty() {
            return format!("NO DATA{le}{le}>");
        }
        let mut response = String::new();
        for frame in shown {
            response.push_str(&self.format_frame(frame));
            response.push_str(le);
        }
        response.push_str(le);
        response.push('>');
        response
    }

    /// Wrap a plain answer with line endings and the prompt.
    pub fn reply(&self, text: &str) -> String {
        let le = self.line_ending();
        format!("{le}{text}{le}>")
    }

    /// Handle an AT command and return the response.
    /// Spaces inside the command are ignored, as on a real adapter.
    pub fn handle_at_command(&mut self, command: &str) -> String {
        let cmd: String = command
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        let le = self.line_ending();

        let response_text = match cmd.as_str() {
            "ATZ" => {
                *self = AdapterState::default();
                let le = self.line_ending();
                return format!("{le}{ELM_VERSION}{le}>");
            }
            "ATE0" => {
                self.echo_enabled = false;
                "OK"
            }
            "ATE1" => {
                self.echo_enabled = true;
                "OK"
            }
            "ATL0" => {
                self.linefeeds_enabled = false;
                "OK"
            }
            "ATL1" => {
                self.linefeeds_enabled = true;
                "OK"
            }
            "ATS0" => {
                self.spaces_enabled = false;
                "OK"
            }
            "ATS1" => {
                self.spaces_enabled = true;
                "OK"
            }
            "ATH0" => {
                self.headers_enabled = false;
                "OK"
            }
            "ATH1" => {
                self.headers_enabled = true;
                "OK"
            }
            "ATD0" => {
                self.dlc_enabled = false;
                "OK"
            }
            "ATD1" => {
                self.dlc_enabled = true;
                "OK"
            }
            "ATI" => ELM_VERSION,
            "AT@1" => return self.device_description(),
            _ if cmd.starts_with("ATSP") => match cmd[4..].chars().next() {
                Some(p) if p.is_ascii_hexdigit() => {
                    self.protocol = p;
                    "OK"
                }
                _ => "?",
            },
            _ if cmd.starts_with("ATSH") => match parse_id(&cmd[4..]) {
                Some(id) => {
                    self.send_header = id;
                    "OK"
                }
                None => "?",
            },
            _ if cmd.starts_with("ATCRA") => {
                if cmd.len() == 5 {
                    self.receive_address = None;
                    "OK"
                } else if let Some(id) = parse_id(&cmd[5..]) {
                    self.receive_address = Some(id);
                    "OK"
                } else {
                    "?"
                }
            }
            _ if cmd.starts_with("ATST") => match u8::from_str_radix(&cmd[4..], 16) {
                Ok(units) => {
                    self.timeout_ms = u16::from(units) * 4;
                    "OK"
                }
                Err(_) => "?",
            },
            // User CAN profile (ATPB) and adaptive timing are accepted as-is
            _ if cmd.starts_with("ATPB") || cmd.starts_with("ATAT") => "OK",
            _ => "?",
        };

        // Note: for commands that change the linefeed setting, the OLD setting
        // is used since le was captured before the match
        format!("{le}{response_text}{le}>")
    }

    /// Override this to provide a custom device description for AT@1
    pub fn device_description(&self) -> String {
        self.reply("ELM327")
    }
}

fn parse_id(digits: &str) -> Option<u16> {
    if digits.len() != 3 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}
