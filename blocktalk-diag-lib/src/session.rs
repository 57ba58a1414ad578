//! KWP2000 session worker.
//!
//! The worker owns the segment transport. It runs one request at a time;
//! each response handler may schedule at most one follow-up request, and
//! block polling fills the gaps.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, error, info, warn};

use crate::config::{Config, SerialSettings, Timeouts, MIN_KEEP_ALIVE_MS};
use crate::csv_log::LogSink;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::labels::{label_part_number, LabelRepository, ModuleLabels};
use crate::link::{Link, LinkStatus};
use crate::modules::{parse_long_id, parse_module_list, parse_short_id, ModuleInfo, GATEWAY_ADDRESS};
use crate::sample::{rebuild_slots, update_slots, MeasurementBlock, QuantityMatcher, SampleSlot};
use crate::tp20::Tp20;

const IDLE_WAIT: Duration = Duration::from_millis(100);

const START_DIAGNOSTIC_SESSION: [u8; 2] = [0x10, 0x89];
const READ_LONG_ID: [u8; 2] = [0x1A, 0x9B];
const READ_SHORT_ID: [u8; 2] = [0x1A, 0x91];
const READ_MODULE_LIST: [u8; 2] = [0x1A, 0x9F];
const READ_BLOCK: u8 = 0x21;

/// State readable from other threads through the `Diagnostics` handle.
#[derive(Default)]
pub(crate) struct View {
    pub port_open: bool,
    pub adapter_initialised: bool,
    pub channel_dest: Option<u8>,
    pub modules: Vec<ModuleInfo>,
    pub blocks: BTreeMap<u8, MeasurementBlock>,
    pub labels: ModuleLabels,
    pub slots: Vec<SampleSlot>,
    pub ecu_info: Vec<String>,
    pub module_info: Vec<String>,
    /// Label key of the open module.
    pub part_number: Option<String>,
}

pub(crate) enum Command {
    OpenPort,
    ClosePort {
        response_tx: Option<oneshot::Sender<()>>,
    },
    SetSerialSettings(SerialSettings),
    OpenChannel(u8),
    CloseChannel,
    OpenBlock(u8),
    CloseBlock(u8),
    CloseAllBlocks,
    StartLogging(Box<dyn LogSink>),
    StopLogging,
    SetTimeouts(Timeouts),
    SetKeepAlive(Duration),
    SetQuantityMatcher(QuantityMatcher),
    Misc(Vec<u8>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speed {
    Slow,
    Norm,
    Fast,
}

struct Request {
    payload: Vec<u8>,
    speed: Speed,
}

pub(crate) struct Session {
    tp: Tp20<Link>,
    config: Config,
    labels: Box<dyn LabelRepository>,
    matcher: QuantityMatcher,
    view: Arc<Mutex<View>>,
    events: Sender<Event>,
    pending: Option<Request>,
    refresh_modules: bool,
    last_polled: Option<u8>,
    block_deadline: Option<Instant>,
    sink: Option<Box<dyn LogSink>>,
}

impl Session {
    pub fn new(
        link: Link,
        config: Config,
        labels: Box<dyn LabelRepository>,
        matcher: QuantityMatcher,
        view: Arc<Mutex<View>>,
        events: Sender<Event>,
    ) -> Self {
        let tp = Tp20::new(
            link,
            Duration::from_millis(config.line_timeout_ms),
            Duration::from_millis(config.keep_alive_ms),
        );
        Self {
            tp,
            config,
            labels,
            matcher,
            view,
            events,
            pending: None,
            refresh_modules: false,
            last_polled: None,
            block_deadline: None,
            sink: None,
        }
    }

    /// Worker loop; returns after `Shutdown` or when every handle is gone.
    pub fn run(mut self, rx: &Receiver<Command>) {
        info!("Session worker started");

        'outer: loop {
            loop {
                match rx.try_recv() {
                    Ok(Command::Shutdown) => break 'outer,
                    Ok(command) => self.handle(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            self.check_link();
            self.service_timers();

            if let Some(request) = self.pending.take() {
                self.execute(&request);
                continue;
            }

            let wait = self
                .next_deadline()
                .map_or(IDLE_WAIT, |d| d.saturating_duration_since(Instant::now()))
                .min(IDLE_WAIT);
            match rx.recv_timeout(wait) {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        self.close_port();
        info!("Session worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::OpenPort => self.open_port(),
            Command::ClosePort { response_tx } => {
                self.close_port();
                if let Some(tx) = response_tx {
                    let _ = tx.send(());
                }
            }
            Command::SetSerialSettings(settings) => {
                self.config.serial = settings;
                self.config.validate();
                if self.view.lock().unwrap().port_open {
                    info!("Serial settings changed, reopening port");
                    self.close_port();
                    self.open_port();
                }
            }
            Command::OpenChannel(module) => self.open_module(module),
            Command::CloseChannel => self.close_channel(),
            Command::OpenBlock(block) => self.open_block(block),
            Command::CloseBlock(block) => self.close_block(block),
            Command::CloseAllBlocks => self.close_all_blocks(),
            Command::StartLogging(sink) => self.start_logging(sink),
            Command::StopLogging => {
                if self.sink.take().is_some() {
                    info!("Logging stopped");
                }
            }
            Command::SetTimeouts(mut timeouts) => {
                timeouts.validate();
                self.config.timeouts = timeouts;
            }
            Command::SetKeepAlive(interval) => {
                let interval = interval.max(Duration::from_millis(MIN_KEEP_ALIVE_MS));
                self.config.keep_alive_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
                self.tp.set_keep_alive_interval(interval);
            }
            Command::SetQuantityMatcher(matcher) => {
                self.matcher = matcher;
                self.rebuild_sample();
            }
            Command::Misc(payload) => {
                if self.tp.is_open() && !payload.is_empty() {
                    self.pending = Some(Request {
                        payload,
                        speed: Speed::Slow,
                    });
                } else {
                    warn!("Ignoring misc command {payload:02X?}: no channel open");
                }
            }
            // Handled by the loop
            Command::Shutdown => {}
        }
    }

    fn emit(&self, event: Event) {
        // The receiver may have been dropped; the session keeps working
        let _ = self.events.send(event);
    }

    fn timeout_ms(&self, speed: Speed) -> u16 {
        let t = &self.config.timeouts;
        match speed {
            Speed::Slow => t.slow_ms,
            Speed::Norm => t.norm_ms,
            Speed::Fast => t.fast_ms,
        }
    }

    // ------------------------------------------------------------------------
    // Port
    // ------------------------------------------------------------------------

    fn open_port(&mut self) {
        if self.view.lock().unwrap().port_open {
            self.close_port();
        }

        if let Err(e) = self.tp.wire().open(&self.config.serial) {
            error!("Failed to open {}: {e}", self.config.serial.port);
            self.emit(Event::PortOpened(false));
            return;
        }
        self.view.lock().unwrap().port_open = true;
        self.emit(Event::PortOpened(true));

        match self.tp.initialise_adapter() {
            Ok(()) => {
                self.view.lock().unwrap().adapter_initialised = true;
                self.emit(Event::AdapterInitialised(true));
                self.refresh_modules = true;
                self.open_channel_to(GATEWAY_ADDRESS);
            }
            Err(e) => {
                error!("Adapter initialisation failed: {e}");
                self.emit(Event::AdapterInitialised(false));
                self.close_port();
            }
        }
    }

    fn close_port(&mut self) {
        if !self.view.lock().unwrap().port_open {
            return;
        }
        self.close_channel();
        if let Err(e) = self.tp.wire().close() {
            warn!("Port close: {e}");
        }
        self.tp.reset();
        {
            let mut view = self.view.lock().unwrap();
            view.port_open = false;
            view.adapter_initialised = false;
        }
        self.emit(Event::PortClosed);
    }

    /// Notice a port that failed underneath us.
    fn check_link(&mut self) {
        if self.tp.wire().status() != LinkStatus::Lost || !self.view.lock().unwrap().port_open {
            return;
        }
        error!("Connection to the adapter lost");
        self.tp.reset();
        self.channel_closed();
        if let Err(e) = self.tp.wire().close() {
            warn!("Port close: {e}");
        }
        {
            let mut view = self.view.lock().unwrap();
            view.port_open = false;
            view.adapter_initialised = false;
        }
        self.emit(Event::PortClosed);
    }

    // ------------------------------------------------------------------------
    // Channel
    // ------------------------------------------------------------------------

    fn open_module(&mut self, module: u8) {
        if module == 0 {
            debug!("Ignoring open of module 0");
            return;
        }
        if !self.view.lock().unwrap().adapter_initialised {
            warn!("Cannot open module {module:02X}: adapter not ready");
            return;
        }
        let address = {
            let mut view = self.view.lock().unwrap();
            view.labels.clear();
            view.modules
                .iter()
                .find(|m| m.number == module)
                .map_or(module, |m| m.address)
        };
        self.open_channel_to(address);
    }

    fn open_channel_to(&mut self, address: u8) {
        self.close_channel();

        let timeout = self.timeout_ms(Speed::Norm);
        if let Err(e) = self.tp.open_channel(address, timeout) {
            warn!("Opening channel to {address:02X} failed: {e}");
            self.refresh_modules = false;
            self.emit(Event::ChannelOpened(false));
            return;
        }
        self.view.lock().unwrap().channel_dest = Some(address);
        self.emit(Event::ChannelOpened(true));

        let payload = if address == GATEWAY_ADDRESS && self.refresh_modules {
            READ_MODULE_LIST
        } else {
            START_DIAGNOSTIC_SESSION
        };
        self.pending = Some(Request {
            payload: payload.to_vec(),
            speed: Speed::Slow,
        });
    }

    fn close_channel(&mut self) {
        self.tp.close_channel();
        self.sync_channel_state();
    }

    /// Run the channel-closed handling if the transport dropped the channel.
    fn sync_channel_state(&mut self) {
        let was_open = self.view.lock().unwrap().channel_dest.is_some();
        if was_open && !self.tp.is_open() {
            self.channel_closed();
        }
    }

    fn channel_closed(&mut self) {
        let closed_blocks: Vec<u8> = {
            let mut view = self.view.lock().unwrap();
            if view.channel_dest.take().is_none() {
                return;
            }
            view.labels.clear();
            view.part_number = None;
            view.slots.clear();
            let blocks = view.blocks.keys().copied().collect();
            view.blocks.clear();
            blocks
        };
        info!("Channel closed");
        self.pending = None;
        self.block_deadline = None;
        self.last_polled = None;

        for block in &closed_blocks {
            self.emit(Event::BlockClosed(*block));
        }
        if !closed_blocks.is_empty() {
            self.emit(Event::SampleFormatChanged);
            self.write_header();
        }
        self.emit(Event::ChannelOpened(false));
    }

    // ------------------------------------------------------------------------
    // Requests and dispatch
    // ------------------------------------------------------------------------

    fn execute(&mut self, request: &Request) {
        let timeout = self.timeout_ms(request.speed);
        match self.tp.send_data(&request.payload, timeout) {
            Ok(messages) => {
                for message in messages {
                    if let Err(e) = self.dispatch(&message) {
                        self.report_failure(request, &e);
                    }
                }
            }
            Err(e) => self.report_failure(request, &e),
        }
        self.sync_channel_state();
    }

    fn report_failure(&self, request: &Request, error: &Error) {
        warn!("Request {:02X?} failed: {error}", request.payload);
        if let Error::NegativeResponse { service, reason } = error {
            self.emit(Event::RequestRejected {
                service: *service,
                reason: *reason,
            });
        }
    }

    fn dispatch(&mut self, message: &[u8]) -> Result<()> {
        let [code, param, data @ ..] = message else {
            self.close_channel();
            return Err(Error::violation(format!("malformed response {message:02X?}")));
        };

        match (*code, *param) {
            (0x7F, service) => {
                return Err(Error::NegativeResponse {
                    service,
                    reason: data.first().copied(),
                });
            }
            (0x50, session) => self.on_session_started(session),
            (0x5A, 0x91) => self.on_short_id(data),
            (0x5A, 0x9B) => self.on_long_id(data),
            (0x5A, 0x9F) => self.on_module_list(data),
            (0x5A, other) => debug!("Unhandled identification {other:02X}"),
            (0x61, block) => self.on_block_data(block, data),
            (other, _) => debug!("Unhandled response {other:02X}"),
        }
        Ok(())
    }

    fn on_session_started(&mut self, session: u8) {
        info!("Diagnostic session {session:02X} started");
        self.emit(Event::DiagStarted(session));
        self.pending = Some(Request {
            payload: READ_LONG_ID.to_vec(),
            speed: Speed::Slow,
        });
    }

    fn on_long_id(&mut self, data: &[u8]) {
        let info = parse_long_id(data);
        let part_number = label_part_number(&info[0]);
        info!("Module {} ({})", info[0], info[1]);

        let labels = self.labels.lookup(&part_number);
        let found = labels.is_some();
        if !found {
            info!("No labels for {part_number}");
        }
        {
            let mut view = self.view.lock().unwrap();
            view.module_info.clone_from(&info);
            view.labels = labels.unwrap_or_default();
            view.part_number = Some(part_number);
        }
        self.emit(Event::NewModuleInfo(info));
        self.emit(Event::LabelsLoaded(found));
        self.rebuild_sample();

        self.pending = Some(Request {
            payload: READ_SHORT_ID.to_vec(),
            speed: Speed::Slow,
        });
    }

    fn on_short_id(&mut self, data: &[u8]) {
        let info = parse_short_id(data);
        debug!("Identification {info:?}");
        self.view.lock().unwrap().ecu_info.clone_from(&info);
        self.emit(Event::NewEcuInfo(info));
    }

    fn on_module_list(&mut self, data: &[u8]) {
        match parse_module_list(data) {
            Ok(modules) => {
                info!("{} modules listed by the gateway", modules.len());
                for m in &modules {
                    debug!("  {:02X} @ {:02X} {} (status {})", m.number, m.address, m.name, m.status);
                }
                self.view.lock().unwrap().modules = modules;
                self.refresh_modules = false;
                self.emit(Event::ModuleListRefreshed);
            }
            Err(e) => error!("Bad module list: {e}"),
        }
        self.close_channel();
    }

    fn on_block_data(&mut self, block: u8, data: &[u8]) {
        let units_changed = {
            let mut view = self.view.lock().unwrap();
            let View { blocks, slots, .. } = &mut *view;
            blocks.get_mut(&block).map(|entry| {
                let units_changed = entry.store_record(block, data);
                update_slots(slots, entry);
                units_changed
            })
        };

        match units_changed {
            Some(changed) => {
                self.emit(Event::NewBlockData(block));
                if changed {
                    self.write_header();
                }
                self.write_row();
            }
            None => debug!("Data for block {block} which is not open"),
        }
        self.read_blocks();
    }

    // ------------------------------------------------------------------------
    // Blocks and sample
    // ------------------------------------------------------------------------

    fn open_block(&mut self, block: u8) {
        if !self.tp.is_open() {
            warn!("Cannot open block {block}: no channel open");
            return;
        }
        let inserted = self
            .view
            .lock()
            .unwrap()
            .blocks
            .insert(block, MeasurementBlock::default())
            .is_none();
        if !inserted {
            return;
        }
        info!("Block {block} opened");
        self.rebuild_sample();
        self.emit(Event::BlockOpened(block));
    }

    fn close_block(&mut self, block: u8) {
        let removed = self.view.lock().unwrap().blocks.remove(&block).is_some();
        if !removed {
            return;
        }
        info!("Block {block} closed");
        self.rebuild_sample();
        self.emit(Event::BlockClosed(block));
    }

    fn close_all_blocks(&mut self) {
        let blocks: Vec<u8> = {
            let mut view = self.view.lock().unwrap();
            let blocks = view.blocks.keys().copied().collect();
            view.blocks.clear();
            blocks
        };
        if blocks.is_empty() {
            return;
        }
        self.rebuild_sample();
        for block in blocks {
            self.emit(Event::BlockClosed(block));
        }
    }

    fn rebuild_sample(&mut self) {
        let no_blocks = {
            let mut view = self.view.lock().unwrap();
            let View { blocks, labels, slots, .. } = &mut *view;
            *slots = rebuild_slots(blocks, labels, &*self.matcher);
            for values in blocks.values() {
                update_slots(slots, values);
            }
            blocks.is_empty()
        };
        if no_blocks {
            self.block_deadline = None;
            self.last_polled = None;
        }
        self.emit(Event::SampleFormatChanged);
        self.write_header();
    }

    /// Request the open block after the last polled one, wrapping around.
    fn read_blocks(&mut self) {
        let next = {
            let view = self.view.lock().unwrap();
            let after = self.last_polled.map_or(0, |b| u16::from(b) + 1);
            view.blocks
                .keys()
                .copied()
                .find(|&b| u16::from(b) >= after)
                .or_else(|| view.blocks.keys().next().copied())
        };
        let Some(block) = next else {
            self.block_deadline = None;
            return;
        };
        self.last_polled = Some(block);
        self.block_deadline = Some(Instant::now() + Duration::from_millis(self.config.block_watchdog_ms));
        self.pending = Some(Request {
            payload: vec![READ_BLOCK, block],
            speed: Speed::Fast,
        });
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn service_timers(&mut self) {
        let now = Instant::now();

        if self.tp.keep_alive_deadline().is_some_and(|d| now >= d) {
            if let Err(e) = self.tp.keep_alive() {
                warn!("Keep-alive failed: {e}");
            }
            self.sync_channel_state();
        }

        // Start polling when idle, or restart it when the watchdog fires
        if self.pending.is_none()
            && self.tp.is_open()
            && self.block_deadline.is_none_or(|d| now >= d)
            && !self.view.lock().unwrap().blocks.is_empty()
        {
            if self.block_deadline.is_some() {
                debug!("Block watchdog expired");
            }
            self.read_blocks();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.tp.keep_alive_deadline(), self.block_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ------------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------------

    fn start_logging(&mut self, sink: Box<dyn LogSink>) {
        self.sink = Some(sink);
        self.write_header();
        info!("Logging started");
        self.emit(Event::LoggingStarted);
    }

    fn write_header(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let columns: Vec<String> = {
            let view = self.view.lock().unwrap();
            view.slots
                .iter()
                .map(|slot| {
                    let (block, position) = slot.refs[0];
                    let units = view.blocks.get(&block).map_or("", |b| b.values[position].units);
                    slot.heading(units)
                })
                .collect()
        };
        if let Err(e) = sink.write_header(&columns) {
            error!("Failed to write log header: {e}");
            self.sink = None;
        }
    }

    fn write_row(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let values: Vec<String> = self
            .view
            .lock()
            .unwrap()
            .slots
            .iter()
            .map(|s| s.value.as_ref().map(ToString::to_string).unwrap_or_default())
            .collect();
        if let Err(e) = sink.write_row(Local::now().time(), &values) {
            error!("Failed to write log row: {e}");
            self.sink = None;
        }
    }
}
