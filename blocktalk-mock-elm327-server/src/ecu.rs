//! Simulated vehicle: a TP 2.0 gateway plus a handful of KWP2000 modules.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use blocktalk_elm327_lib::CanFrame;
use log::{debug, warn};

/// Identifier the tester sends channel setup requests to (plus the destination).
pub const SETUP_BASE_ID: u16 = 0x200;
/// Identifier the simulated modules transmit on once a channel is open.
pub const ECU_TX_ID: u16 = 0x300;
/// Identifier the simulated modules listen on once a channel is open.
pub const ECU_RX_ID: u16 = 0x740;
/// Bus address of the gateway module.
pub const GATEWAY_ADDRESS: u8 = 0x1F;

/// One measurement cell of a block: a fixed `(id, a, b)` triple, or the
/// simulated engine speed.
#[derive(Debug, Clone, Copy)]
pub enum Cell {
    Fixed(u8, u8, u8),
    EngineSpeed,
}

#[derive(Debug, Clone)]
pub struct MockModule {
    pub number: u8,
    pub address: u8,
    pub part_number: String,
    pub component: String,
    pub ecu_info: Vec<String>,
    pub blocks: BTreeMap<u8, [Cell; 4]>,
}

/// Knobs for fault injection.
#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Reported in the high nibble of the channel setup reply; non-zero is invalid.
    pub channel_version: u8,
    /// Answer `A3` channel tests.
    pub keep_alive_replies: bool,
    /// Answer the STN `ST` command set.
    pub stn: bool,
    /// Block size the modules advertise for tester transmissions.
    pub block_size: u8,
    /// Caps how many segments a module sends before waiting for an ACK.
    pub response_burst: Option<u8>,
    /// Put an undecodable line ahead of the next reply carrying frames (one-shot).
    pub garble_next_reply: bool,
    /// Replace the next reply carrying frames with this status line (one-shot).
    pub replace_next_reply: Option<String>,
    /// Follow the next response with an `A3` channel test from the module (one-shot).
    pub inject_channel_test: bool,
    /// Follow the next response with this opcode (`A8` or `A4`) and drop the
    /// channel (one-shot).
    pub disconnect_after_reply: Option<u8>,
    /// Queue this payload as a second message right after the next response
    /// (one-shot).
    pub follow_up_message: Option<Vec<u8>>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            channel_version: 0,
            keep_alive_replies: true,
            stn: false,
            block_size: 0x0F,
            response_burst: None,
            garble_next_reply: false,
            replace_next_reply: None,
            inject_channel_test: false,
            disconnect_after_reply: None,
            follow_up_message: None,
        }
    }
}

/// The simulated car.
#[derive(Debug, Clone)]
pub struct MockCar {
    pub modules: Vec<MockModule>,
    /// Extra gateway list entries `(number, address, status)` for modules that
    /// do not answer.
    pub unlisted: Vec<(u8, u8, u8)>,
}

impl Default for MockCar {
    fn default() -> Self {
        use Cell::{EngineSpeed, Fixed};

        let engine_blocks = BTreeMap::from([
            // Engine speed, coolant 90 °C, battery 14.0 V, status bits
            (1, [EngineSpeed, Fixed(0x1A, 0, 90), Fixed(0x15, 100, 140), Fixed(0x10, 0b1010, 0x01)]),
            // Engine speed, manifold pressure, load, throttle
            (3, [EngineSpeed, Fixed(0x12, 25, 40), Fixed(0x14, 128, 50), Fixed(0x17, 128, 64)]),
            // Engine speed, vehicle speed 10 km/h, duty cycle, injection time
            (5, [EngineSpeed, Fixed(0x07, 20, 50), Fixed(0x21, 0, 42), Fixed(0x16, 100, 25)]),
            // Engine speed, timing, fuel flow, gear letters
            (9, [EngineSpeed, Fixed(0x04, 10, 150), Fixed(0x23, 50, 30), Fixed(0x11, b'D', b'4')]),
        ]);
        let cluster_blocks = BTreeMap::from([
            (1, [Fixed(0x07, 20, 50), EngineSpeed, Fixed(0x1A, 0, 85), Fixed(0x36, 1, 44)]),
        ]);

        Self {
            modules: vec![
                MockModule {
                    number: 0x19,
                    address: GATEWAY_ADDRESS,
                    part_number: "1K0907530F".to_string(),
                    component: "J533__Gateway H07".to_string(),
                    ecu_info: vec!["1K0907530F".to_string(), "0080".to_string()],
                    blocks: BTreeMap::new(),
                },
                MockModule {
                    number: 0x01,
                    address: 0x01,
                    part_number: "038906019FE".to_string(),
                    component: "R4 1,9L EDC G000SG".to_string(),
                    ecu_info: vec!["038906019FE".to_string(), "1.9l R4 EDC".to_string(), "5223".to_string()],
                    blocks: engine_blocks,
                },
                MockModule {
                    number: 0x17,
                    address: 0x17,
                    part_number: "1K0920852G".to_string(),
                    component: "KOMBI+WEGFAHRSP VDO".to_string(),
                    ecu_info: vec!["1K0920852G".to_string(), "V07".to_string()],
                    blocks: cluster_blocks,
                },
            ],
            unlisted: vec![(0x13, 0x13, 0x01), (0x02, 0x02, 0x00)],
        }
    }
}

#[derive(Debug)]
struct EcuChannel {
    address: u8,
    rx_seq: u8,
    tx_seq: u8,
    tester_block_size: u8,
    incoming: Vec<u8>,
    expected: Option<usize>,
    outgoing: VecDeque<Vec<u8>>,
}

/// TP 2.0 endpoint side of every simulated module.
#[derive(Debug)]
pub struct MockEcu {
    car: MockCar,
    pub settings: MockSettings,
    channel: Option<EcuChannel>,
    start_time: Instant,
    /// `A1` answers received for module-initiated channel tests.
    pub channel_tests_answered: usize,
}

impl MockEcu {
    pub fn new(car: MockCar) -> Self {
        Self {
            car,
            settings: MockSettings::default(),
            channel: None,
            start_time: Instant::now(),
            channel_tests_answered: 0,
        }
    }

    /// Address of the module holding the open channel.
    pub fn channel_address(&self) -> Option<u8> {
        self.channel.as_ref().map(|c| c.address)
    }

    /// React to one frame sent by the tester, returning the frames put on the bus.
    pub fn on_frame(&mut self, id: u16, data: &[u8]) -> Vec<CanFrame> {
        if id == SETUP_BASE_ID && data.len() == 7 && data[1] == 0xC0 {
            return self.setup(data[0]);
        }
        if id != ECU_RX_ID || self.channel.is_none() {
            return Vec::new();
        }
        let Some(&first) = data.first() else {
            return Vec::new();
        };

        match first {
            0xA0 => {
                if let Some(ch) = self.channel.as_mut() {
                    ch.tester_block_size = data.get(1).copied().unwrap_or(0x0F).clamp(1, 0x0F);
                }
                self.parameters()
            }
            0xA3 if self.settings.keep_alive_replies => self.parameters(),
            0xA3 => Vec::new(),
            0xA1 => {
                debug!("Tester answered our channel test");
                self.channel_tests_answered += 1;
                Vec::new()
            }
            0xA8 => {
                debug!("Tester closed the channel");
                self.channel = None;
                frames(ECU_TX_ID, &[vec![0xA8]])
            }
            b if b >> 4 == 0xB => self.flush_outgoing(),
            b if b >> 4 <= 3 => self.data_segment(data),
            other => {
                warn!("Mock ECU ignoring frame {other:02X}");
                Vec::new()
            }
        }
    }

    fn setup(&mut self, destination: u8) -> Vec<CanFrame> {
        if !self.car.modules.iter().any(|m| m.address == destination) {
            debug!("No module at {destination:02X}");
            return Vec::new();
        }
        self.channel = Some(EcuChannel {
            address: destination,
            rx_seq: 0,
            tx_seq: 0,
            tester_block_size: 0x0F,
            incoming: Vec::new(),
            expected: None,
            outgoing: VecDeque::new(),
        });
        let version = self.settings.channel_version << 4;
        let reply = [
            0x00,
            0xD0,
            (ECU_TX_ID & 0xFF) as u8,
            version | (ECU_TX_ID >> 8) as u8,
            (ECU_RX_ID & 0xFF) as u8,
            (ECU_RX_ID >> 8) as u8,
            0x01,
        ];
        frames(SETUP_BASE_ID + u16::from(destination), &[reply.to_vec()])
    }

    fn parameters(&self) -> Vec<CanFrame> {
        let bs = self.settings.block_size;
        frames(ECU_TX_ID, &[vec![0xA1, bs, 0x8A, 0xFF, 0x32, 0xFF]])
    }

    fn data_segment(&mut self, data: &[u8]) -> Vec<CanFrame> {
        let Some(ch) = self.channel.as_mut() else {
            return Vec::new();
        };
        let opcode = data[0] >> 4;
        let seq = data[0] & 0x0F;
        if seq != ch.rx_seq {
            warn!("Mock ECU expected sequence {:X}, got {seq:X}", ch.rx_seq);
            return Vec::new();
        }
        ch.rx_seq = (seq + 1) & 0x0F;

        let body = &data[1..];
        match ch.expected {
            None if body.len() < 2 => return Vec::new(),
            None => {
                ch.expected = Some(usize::from(u16::from_be_bytes([body[0], body[1]]) & 0x7FFF));
                ch.incoming = body[2..].to_vec();
            }
            Some(_) => ch.incoming.extend_from_slice(body),
        }

        let mut out = Vec::new();
        if opcode & 0x2 == 0 {
            out.extend(frames(ECU_TX_ID, &[vec![0xB0 | ch.rx_seq]]));
        }
        if opcode & 0x1 != 0 {
            let expected = ch.expected.take().unwrap_or(0);
            let mut request = std::mem::take(&mut ch.incoming);
            request.truncate(expected);
            let address = ch.address;

            let response = self.service(address, &request);
            self.queue_response(&response);
            if let Some(extra) = self.settings.follow_up_message.take() {
                self.queue_response(&extra);
            }
            out.extend(self.flush_outgoing());
            out.extend(self.peer_commands());
        }
        out
    }

    /// Module-initiated frames injected after a response.
    fn peer_commands(&mut self) -> Vec<CanFrame> {
        let mut out = Vec::new();
        if std::mem::take(&mut self.settings.inject_channel_test) {
            out.extend(frames(ECU_TX_ID, &[vec![0xA3]]));
        }
        if let Some(opcode) = self.settings.disconnect_after_reply.take() {
            debug!("Module dropping the channel with {opcode:02X}");
            self.channel = None;
            out.extend(frames(ECU_TX_ID, &[vec![opcode]]));
        }
        out
    }

    fn queue_response(&mut self, payload: &[u8]) {
        let burst = self.settings.response_burst;
        let Some(ch) = self.channel.as_mut() else {
            return;
        };
        let bs = burst.map_or(ch.tester_block_size, |b| b.min(ch.tester_block_size)).max(1);

        let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
        let mut message = len.to_be_bytes().to_vec();
        message.extend_from_slice(payload);

        let chunks: Vec<&[u8]> = message.chunks(7).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let kind = if i == last {
                0x10
            } else if i % usize::from(bs) == usize::from(bs) - 1 {
                0x00
            } else {
                0x20
            };
            let mut segment = vec![kind | ch.tx_seq];
            segment.extend_from_slice(chunk);
            ch.tx_seq = (ch.tx_seq + 1) & 0x0F;
            ch.outgoing.push_back(segment);
        }
    }

    /// Send queued segments up to and including the next one that wants an ACK.
    fn flush_outgoing(&mut self) -> Vec<CanFrame> {
        let Some(ch) = self.channel.as_mut() else {
            return Vec::new();
        };
        let mut burst = Vec::new();
        while let Some(segment) = ch.outgoing.pop_front() {
            let wants_ack = segment[0] >> 4 != 0x2;
            burst.push(segment);
            if wants_ack {
                break;
            }
        }
        frames(ECU_TX_ID, &burst)
    }

    fn service(&self, address: u8, request: &[u8]) -> Vec<u8> {
        let Some(module) = self.car.modules.iter().find(|m| m.address == address) else {
            return vec![0x7F, request.first().copied().unwrap_or(0), 0x10];
        };
        debug!("Module {address:02X} request {request:02X?}");

        match request {
            [0x10, param, ..] => vec![0x50, *param],
            [0x1A, 0x9B] => {
                let mut response = vec![0x5A, 0x9B];
                response.extend(format!("{:<16}", module.part_number).bytes());
                response.extend_from_slice(&[0x00, 0x00, 0x03, 0x18, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00]);
                response.extend(format!("{:<20}", module.component).bytes());
                response
            }
            [0x1A, 0x91] => {
                let mut response = vec![0x5A, 0x91];
                for info in &module.ecu_info {
                    response.push(u8::try_from(info.len() + 1).unwrap_or(u8::MAX));
                    response.extend(info.bytes());
                }
                response.push(0xFF);
                response
            }
            [0x1A, 0x9F] if address == GATEWAY_ADDRESS => self.module_list(),
            [0x21, block] => match module.blocks.get(block) {
                Some(cells) => {
                    let mut response = vec![0x61, *block];
                    for cell in cells {
                        let (id, a, b) = self.cell_value(*cell);
                        response.extend_from_slice(&[id, a, b]);
                    }
                    response
                }
                None => vec![0x7F, 0x21, 0x31],
            },
            [service, ..] => vec![0x7F, *service, 0x11],
            [] => vec![0x7F, 0x00, 0x13],
        }
    }

    fn module_list(&self) -> Vec<u8> {
        let mut tuples = Vec::new();
        for module in &self.car.modules {
            tuples.extend_from_slice(&[module.number, module.address, 0x00, 0x03]);
        }
        for &(number, address, status) in &self.car.unlisted {
            tuples.extend_from_slice(&[number, address, 0x00, status]);
        }

        let mut response = vec![0x5A, 0x9F];
        response.push(u8::try_from(tuples.len() + 1).unwrap_or(u8::MAX));
        response.extend(tuples);
        response.extend_from_slice(&[0x03, 0x00, 0x01]);
        response.push(0xFF);
        response
    }

    fn cell_value(&self, cell: Cell) -> (u8, u8, u8) {
        match cell {
            Cell::Fixed(id, a, b) => (id, a, b),
            // rpm = a * b / 5, so with a = 200 each step of b is 40 rpm
            Cell::EngineSpeed => (0x01, 200, (get_rpm_value(&self.start_time) / 40) as u8),
        }
    }
}

fn frames(id: u16, payloads: &[Vec<u8>]) -> Vec<CanFrame> {
    payloads.iter().filter_map(|p| CanFrame::new(id, p)).collect()
}

fn get_rpm_value(start_time: &Instant) -> u32 {
    const MIN_RPM: f32 = 800.0;
    const MAX_RPM: f32 = 3500.0;
    const RAMP_TIME: f32 = 4.0;
    const HOLD_TIME: f32 = 3.0;
    const CYCLE_TIME: f32 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let elapsed = start_time.elapsed().as_secs_f32();
    let phase = elapsed % CYCLE_TIME;

    let rpm = if phase < RAMP_TIME {
        MIN_RPM + (MAX_RPM - MIN_RPM) * (phase / RAMP_TIME)
    } else if phase < RAMP_TIME + HOLD_TIME {
        MAX_RPM
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        let ramp_phase = phase - RAMP_TIME - HOLD_TIME;
        MAX_RPM - (MAX_RPM - MIN_RPM) * (ramp_phase / RAMP_TIME)
    } else {
        MIN_RPM
    };

    rpm as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(ecu: &mut MockEcu, address: u8) -> Vec<CanFrame> {
        ecu.on_frame(SETUP_BASE_ID, &[address, 0xC0, 0x00, 0x10, 0x00, 0x03, 0x01])
    }

    #[test]
    fn test_setup_reply() {
        let mut ecu = MockEcu::new(MockCar::default());
        let reply = open(&mut ecu, 0x01);
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].id(), 0x201);
        assert_eq!(reply[0].data(), &[0x00, 0xD0, 0x00, 0x03, 0x40, 0x07, 0x01]);
        assert_eq!(ecu.channel_address(), Some(0x01));
    }

    #[test]
    fn test_setup_unknown_module_is_silent() {
        let mut ecu = MockEcu::new(MockCar::default());
        assert!(open(&mut ecu, 0x45).is_empty());
        assert_eq!(ecu.channel_address(), None);
    }

    #[test]
    fn test_single_segment_request() {
        let mut ecu = MockEcu::new(MockCar::default());
        open(&mut ecu, 0x01);
        ecu.on_frame(ECU_RX_ID, &[0xA0, 0x0F, 0x8A, 0xFF, 0x4A, 0xFF]);

        // 10 89 start session, one "last" segment
        let out = ecu.on_frame(ECU_RX_ID, &[0x10, 0x00, 0x02, 0x10, 0x89]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data(), &[0xB1]);
        assert_eq!(out[1].data(), &[0x10, 0x00, 0x02, 0x50, 0x89]);

        // Our ACK ends the exchange
        assert!(ecu.on_frame(ECU_RX_ID, &[0xB1]).is_empty());
    }

    #[test]
    fn test_response_bursts_wait_for_ack() {
        let mut ecu = MockEcu::new(MockCar::default());
        ecu.settings.response_burst = Some(2);
        open(&mut ecu, 0x01);

        let out = ecu.on_frame(ECU_RX_ID, &[0x10, 0x00, 0x02, 0x1A, 0x9B]);
        // ACK plus two segments, the second asking for an ACK
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].data()[0], 0x20);
        assert_eq!(out[2].data()[0], 0x01);

        let next = ecu.on_frame(ECU_RX_ID, &[0xB2]);
        assert_eq!(next[0].data()[0], 0x22);
    }

    #[test]
    fn test_keep_alive_toggle() {
        let mut ecu = MockEcu::new(MockCar::default());
        open(&mut ecu, 0x01);
        assert_eq!(ecu.on_frame(ECU_RX_ID, &[0xA3]).len(), 1);
        ecu.settings.keep_alive_replies = false;
        assert!(ecu.on_frame(ECU_RX_ID, &[0xA3]).is_empty());
    }

    #[test]
    fn test_follow_up_and_peer_commands() {
        let mut ecu = MockEcu::new(MockCar::default());
        open(&mut ecu, 0x01);
        ecu.settings.follow_up_message = Some(vec![0x7F, 0x21, 0x78]);
        ecu.settings.inject_channel_test = true;

        let out = ecu.on_frame(ECU_RX_ID, &[0x10, 0x00, 0x02, 0x10, 0x89]);
        // ACK, first message, then the channel test
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].data(), &[0x10, 0x00, 0x02, 0x50, 0x89]);
        assert_eq!(out[2].data(), &[0xA3]);

        // Acknowledging the first message releases the second
        let next = ecu.on_frame(ECU_RX_ID, &[0xB1]);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].data(), &[0x11, 0x00, 0x03, 0x7F, 0x21, 0x78]);

        assert!(ecu.on_frame(ECU_RX_ID, &[0xA1, 0x0F, 0x8A, 0xFF, 0x4A, 0xFF]).is_empty());
        assert_eq!(ecu.channel_tests_answered, 1);
    }

    #[test]
    fn test_disconnect_after_reply() {
        let mut ecu = MockEcu::new(MockCar::default());
        open(&mut ecu, 0x01);
        ecu.settings.disconnect_after_reply = Some(0xA8);

        let out = ecu.on_frame(ECU_RX_ID, &[0x10, 0x00, 0x02, 0x10, 0x89]);
        assert_eq!(out.last().map(CanFrame::data), Some(&[0xA8][..]));
        assert_eq!(ecu.channel_address(), None);
        assert_eq!(ecu.settings.disconnect_after_reply, None);
    }

    #[test]
    fn test_rpm_ramp_bounds() {
        let rpm = get_rpm_value(&Instant::now());
        assert!((800..=3500).contains(&rpm));
    }
}
