//! Full stack against the in-memory mock adapter.

use std::io::{self, Write};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blocktalk_diag_lib::{
    BlockLabels, Config, CsvLogSink, Diagnostics, Event, ModuleLabels, NoLabels, Port, PortOpener,
    SerialSettings, StaticLabels, Value,
};
use blocktalk_mock_elm327_server::{MockAdapter, MockCar};

const WAIT: Duration = Duration::from_secs(5);

struct MockOpener(MockAdapter);

impl PortOpener for MockOpener {
    fn open(&mut self, _settings: &SerialSettings) -> io::Result<Box<dyn Port>> {
        Ok(Box::new(self.0.clone()))
    }
}

struct NoPort;

impl PortOpener for NoPort {
    fn open(&mut self, settings: &SerialSettings) -> io::Result<Box<dyn Port>> {
        Err(io::Error::new(io::ErrorKind::NotFound, settings.port.clone()))
    }
}

/// `Write` into a buffer the test can still read.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine_labels() -> StaticLabels {
    let mut module = ModuleLabels::new();
    for block in [1, 3, 5, 9] {
        let mut labels = BlockLabels {
            name: format!("Group {block}"),
            ..BlockLabels::default()
        };
        labels.desc[0] = "Engine Speed".to_string();
        labels.desc[1] = format!("Value {block}.2");
        labels.desc[2] = format!("Value {block}.3");
        labels.desc[3] = format!("Value {block}.4");
        module.insert(block, labels);
    }
    let mut labels = StaticLabels::new();
    labels.insert("038-906-019-FE", module);
    labels
}

fn start(adapter: &MockAdapter, labels: StaticLabels) -> (Diagnostics, Receiver<Event>) {
    init_logging();
    let mut config = Config::default();
    config.serial.port = "mock".to_string();
    config.line_timeout_ms = 500;
    Diagnostics::start(config, Box::new(labels), Box::new(MockOpener(adapter.clone()))).unwrap()
}

/// Wait for an event matching `predicate`, returning every event seen.
fn wait_for(events: &Receiver<Event>, predicate: impl Fn(&Event) -> bool) -> Vec<Event> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Err(_) => break,
        }
    }
    panic!("event not received, saw {seen:?}");
}

/// Open the port and wait for the gateway module list.
fn bring_up(diag: &Diagnostics, events: &Receiver<Event>) {
    diag.open_port();
    wait_for(events, |e| *e == Event::ModuleListRefreshed);
    wait_for(events, |e| *e == Event::ChannelOpened(false));
}

fn open_engine(diag: &Diagnostics, events: &Receiver<Event>) -> Vec<Event> {
    diag.open_channel(0x01);
    wait_for(events, |e| matches!(e, Event::NewEcuInfo(_)))
}

#[test]
fn lists_modules_through_gateway() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, StaticLabels::new());

    diag.open_port();
    let seen = wait_for(&events, |e| *e == Event::ModuleListRefreshed);
    assert_eq!(
        seen[..4],
        [
            Event::PortOpened(true),
            Event::AdapterInitialised(true),
            Event::ChannelOpened(true),
            Event::ModuleListRefreshed,
        ]
    );
    wait_for(&events, |e| *e == Event::ChannelOpened(false));

    let modules = diag.modules();
    let numbers: Vec<u8> = modules.iter().map(|m| m.number).collect();
    assert_eq!(numbers, vec![0x19, 0x01, 0x17]);
    assert_eq!(modules[1].name, "Engine #1");
    assert!(modules.iter().all(|m| m.present));
    assert!(diag.port_open());
    assert!(diag.adapter_initialised());
    assert_eq!(diag.channel_dest(), None);

    diag.close_port_blocking().unwrap();
    assert!(!diag.port_open());
    diag.shutdown();
}

#[test]
fn identifies_module_and_loads_labels() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);

    let seen = open_engine(&diag, &events);
    assert!(seen.contains(&Event::ChannelOpened(true)));
    assert!(seen.contains(&Event::DiagStarted(0x89)));
    assert!(seen.contains(&Event::NewModuleInfo(vec![
        "038906019FE".to_string(),
        "R4 1,9L EDC G000SG".to_string()
    ])));
    assert!(seen.contains(&Event::LabelsLoaded(true)));

    assert_eq!(diag.channel_dest(), Some(0x01));
    assert_eq!(diag.part_number().as_deref(), Some("038-906-019-FE"));
    assert_eq!(adapter.channel_address(), Some(0x01));
    assert_eq!(diag.ecu_info(), vec!["038906019FE", "1.9l R4 EDC", "5223"]);
    assert_eq!(diag.block_labels(5).unwrap().name, "Group 5");
    assert!(diag.block_labels(2).is_none());

    diag.close_channel();
    wait_for(&events, |e| *e == Event::ChannelOpened(false));
    assert_eq!(adapter.channel_address(), None);
    assert!(diag.block_labels(5).is_none());
    assert_eq!(diag.part_number(), None);
}

#[test]
fn polls_blocks_and_shares_engine_speed() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.open_block(5);
    diag.open_block(9);
    wait_for(&events, |e| *e == Event::NewBlockData(5));
    wait_for(&events, |e| *e == Event::NewBlockData(9));

    assert_eq!(diag.open_blocks(), vec![5, 9]);
    let sample = diag.sample();
    assert_eq!(sample.len(), 7);
    assert_eq!(sample[0].refs, vec![(5, 0), (9, 0)]);
    let rpm = sample[0].value.as_ref().and_then(Value::as_f64).unwrap();
    assert!((800.0..=3500.0).contains(&rpm));

    let speed = diag.block_value(5, 1).unwrap();
    assert_eq!(speed.value, Some(Value::Float(10.0)));
    assert_eq!(speed.units, "km/h");
    assert_eq!(diag.block_value(9, 3).unwrap().value, Some(Value::Text("D4".to_string())));

    diag.close_block(5);
    wait_for(&events, |e| *e == Event::BlockClosed(5));
    let sample = diag.sample();
    assert_eq!(sample.len(), 4);
    assert_eq!(sample[0].refs, vec![(9, 0)]);

    diag.close_all_blocks();
    wait_for(&events, |e| *e == Event::BlockClosed(9));
    assert!(diag.sample().is_empty());
    assert!(diag.open_blocks().is_empty());
}

#[test]
fn logs_rows_for_open_blocks() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.open_block(1);
    wait_for(&events, |e| *e == Event::NewBlockData(1));

    let buffer = SharedBuffer::default();
    diag.start_logging(Box::new(CsvLogSink::new(buffer.clone())));
    wait_for(&events, |e| *e == Event::LoggingStarted);
    wait_for(&events, |e| *e == Event::NewBlockData(1));
    wait_for(&events, |e| *e == Event::NewBlockData(1));
    diag.stop_logging();

    let text = buffer.text();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("Time,Engine Speed [rpm],Value 1.2 [° C],Value 1.3 [V],Value 1.4 [Binary]")
    );
    let row = lines.next().unwrap();
    let fields: Vec<&str> = row.split(',').collect();
    assert_eq!(fields.len(), 5);
    assert_eq!(fields[2], "90");
    assert_eq!(fields[3], "14");
}

#[test]
fn bad_channel_version_keeps_channel_closed() {
    let adapter = MockAdapter::new(MockCar::default());
    adapter.update_settings(|s| s.channel_version = 1);
    let (diag, events) = start(&adapter, StaticLabels::new());

    diag.open_port();
    wait_for(&events, |e| *e == Event::AdapterInitialised(true));
    wait_for(&events, |e| *e == Event::ChannelOpened(false));
    assert!(diag.modules().is_empty());

    diag.open_channel(0x01);
    wait_for(&events, |e| *e == Event::ChannelOpened(false));
    assert_eq!(diag.channel_dest(), None);
}

#[test]
fn lost_keep_alive_closes_channel_and_stops_polling() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.open_block(3);
    wait_for(&events, |e| *e == Event::NewBlockData(3));

    adapter.update_settings(|s| s.keep_alive_replies = false);
    diag.set_keep_alive_interval(Duration::from_millis(100));
    let seen = wait_for(&events, |e| *e == Event::ChannelOpened(false));
    assert!(seen.contains(&Event::BlockClosed(3)));

    assert_eq!(diag.channel_dest(), None);
    assert!(diag.open_blocks().is_empty());
    assert!(diag.sample().is_empty());
    assert!(diag.port_open());
}

#[test]
fn reassembles_responses_sent_in_bursts() {
    let adapter = MockAdapter::new(MockCar::default());
    adapter.update_settings(|s| s.response_burst = Some(2));
    let (diag, events) = start(&adapter, StaticLabels::new());
    bring_up(&diag, &events);
    assert_eq!(diag.modules().len(), 3);

    let seen = open_engine(&diag, &events);
    assert!(seen.contains(&Event::LabelsLoaded(false)));
    assert_eq!(diag.module_info()[0], "038906019FE");
}

#[test]
fn stn_adapter_initialises() {
    let adapter = MockAdapter::new(MockCar::default());
    adapter.update_settings(|s| s.stn = true);
    let (diag, events) = start(&adapter, StaticLabels::new());

    diag.open_port();
    wait_for(&events, |e| *e == Event::AdapterInitialised(true));
    assert!(adapter.adapter_state().headers_enabled);
}

#[test]
fn misc_command_goes_through_dispatch() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, StaticLabels::new());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.misc_command(vec![0x1A, 0x91]);
    let seen = wait_for(&events, |e| matches!(e, Event::NewEcuInfo(_)));
    assert_eq!(
        seen.last(),
        Some(&Event::NewEcuInfo(vec![
            "038906019FE".to_string(),
            "1.9l R4 EDC".to_string(),
            "5223".to_string()
        ]))
    );
}

#[test]
fn open_block_without_channel_is_ignored() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, StaticLabels::new());
    bring_up(&diag, &events);

    diag.open_block(1);
    diag.open_channel(0);
    // Round trip through the worker before checking
    diag.close_port_blocking().unwrap();
    assert!(diag.open_blocks().is_empty());
    assert_eq!(diag.channel_dest(), None);
    assert!(events.try_iter().all(|e| !matches!(e, Event::BlockOpened(_))));
}

#[test]
fn port_open_failure_is_reported() {
    init_logging();
    let (diag, events) = Diagnostics::start(Config::default(), Box::new(NoLabels), Box::new(NoPort)).unwrap();
    diag.open_port();
    wait_for(&events, |e| *e == Event::PortOpened(false));
    assert!(!diag.port_open());
}

#[test]
fn rejected_request_is_reported_and_channel_stays_open() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, StaticLabels::new());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.misc_command(vec![0x31, 0x01]);
    let seen = wait_for(&events, |e| matches!(e, Event::RequestRejected { .. }));
    assert_eq!(
        seen.last(),
        Some(&Event::RequestRejected {
            service: 0x31,
            reason: Some(0x11)
        })
    );
    assert!(!seen.contains(&Event::ChannelOpened(false)));
    assert_eq!(diag.channel_dest(), Some(0x01));
}

#[test]
fn module_channel_test_is_answered_while_polling() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.open_block(1);
    wait_for(&events, |e| *e == Event::NewBlockData(1));

    adapter.update_settings(|s| s.inject_channel_test = true);
    let deadline = Instant::now() + WAIT;
    while adapter.channel_tests_answered() == 0 {
        assert!(Instant::now() < deadline, "channel test not answered");
        std::thread::sleep(Duration::from_millis(10));
    }

    let seen = wait_for(&events, |e| *e == Event::NewBlockData(1));
    assert!(!seen.contains(&Event::ChannelOpened(false)));
    assert_eq!(adapter.channel_tests_answered(), 1);
    assert_eq!(diag.channel_dest(), Some(0x01));
}

#[test]
fn module_disconnect_closes_channel_and_blocks() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.open_block(3);
    wait_for(&events, |e| *e == Event::NewBlockData(3));

    adapter.update_settings(|s| s.disconnect_after_reply = Some(0xA8));
    let seen = wait_for(&events, |e| *e == Event::ChannelOpened(false));
    assert!(seen.contains(&Event::BlockClosed(3)));
    assert_eq!(diag.channel_dest(), None);
    assert!(diag.open_blocks().is_empty());
    assert!(diag.port_open());
}

#[test]
fn unsolicited_message_after_reply_is_dispatched() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, StaticLabels::new());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    adapter.update_settings(|s| {
        s.follow_up_message = Some(vec![0x5A, 0x91, 0x06, b'E', b'X', b'T', b'R', b'A', 0xFF]);
    });
    diag.misc_command(vec![0x10, 0x89]);
    wait_for(&events, |e| *e == Event::NewEcuInfo(vec!["EXTRA".to_string()]));
    assert_eq!(diag.channel_dest(), Some(0x01));
}

#[test]
fn garbled_adapter_line_does_not_interrupt_polling() {
    let adapter = MockAdapter::new(MockCar::default());
    let (diag, events) = start(&adapter, engine_labels());
    bring_up(&diag, &events);
    open_engine(&diag, &events);

    diag.open_block(5);
    wait_for(&events, |e| *e == Event::NewBlockData(5));

    adapter.update_settings(|s| s.garble_next_reply = true);
    for _ in 0..3 {
        let seen = wait_for(&events, |e| *e == Event::NewBlockData(5));
        assert!(!seen.contains(&Event::ChannelOpened(false)));
    }
    assert_eq!(diag.channel_dest(), Some(0x01));
    assert_eq!(diag.open_blocks(), vec![5]);
}
