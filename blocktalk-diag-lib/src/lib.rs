//! VAG measuring blocks over an ELM327: TP 2.0 transport and KWP2000 session
//!
//! [`Diagnostics`] starts two workers. The port task owns the serial port and
//! turns adapter output into lines; the session worker owns the transport,
//! runs requests one at a time and reports progress as [`Event`]s.

mod config;
mod csv_log;
mod decode;
mod error;
mod event;
mod labels;
mod link;
mod modules;
mod sample;
mod session;
mod tp20;

use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info};

pub use config::{
    Config, FlowControl, LogLevel, Parity, SerialSettings, Timeouts, MAX_RECV_TIMEOUT_MS,
    MIN_KEEP_ALIVE_MS,
};
pub use csv_log::{CsvLogSink, LogSink};
pub use decode::{decode_block_data, Value};
pub use error::{Error, Result};
pub use event::Event;
pub use labels::{
    label_part_number, BlockLabels, LabelRepository, ModuleLabels, NoLabels, StaticLabels,
};
pub use link::{Link, LinkStatus, Port, PortOpener, SystemOpener};
pub use modules::{module_name, ModuleInfo, GATEWAY_ADDRESS};
pub use sample::{same_engine_speed, BlockValue, QuantityMatcher, SampleSlot, ValueRef};
pub use tp20::{
    encode_segments, Channel, ChannelParameters, Reassembler, Segment, SegmentKind, Tp20, Wire,
};

use session::{Command, Session, View};

/// How long `close_port_blocking` waits for the worker.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running diagnostic session.
///
/// Commands are queued to the session worker and return immediately; results
/// arrive as [`Event`]s. State queries read a snapshot shared with the worker.
pub struct Diagnostics {
    tx: Sender<Command>,
    view: Arc<Mutex<View>>,
    worker: Option<JoinHandle<()>>,
}

impl Diagnostics {
    /// Start the workers with the default engine speed matcher.
    ///
    /// # Errors
    ///
    /// Spawning either worker thread failed.
    pub fn start(
        config: Config,
        labels: Box<dyn LabelRepository>,
        opener: Box<dyn PortOpener>,
    ) -> io::Result<(Self, Receiver<Event>)> {
        Self::start_with_matcher(config, labels, opener, Box::new(same_engine_speed))
    }

    /// Start the workers, merging sample columns with `matcher`.
    ///
    /// # Errors
    ///
    /// Spawning either worker thread failed.
    pub fn start_with_matcher(
        mut config: Config,
        labels: Box<dyn LabelRepository>,
        opener: Box<dyn PortOpener>,
        matcher: QuantityMatcher,
    ) -> io::Result<(Self, Receiver<Event>)> {
        config.validate();
        let (tx, rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let view = Arc::new(Mutex::new(View::default()));

        let link = Link::start(opener)?;
        let session = Session::new(link, config, labels, matcher, Arc::clone(&view), event_tx);
        let worker = std::thread::Builder::new()
            .name("blocktalk-session".to_string())
            .spawn(move || session.run(&rx))?;

        Ok((
            Self {
                tx,
                view,
                worker: Some(worker),
            },
            event_rx,
        ))
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            error!("Session worker is gone");
        }
    }

    /// Open the configured port, initialise the adapter and list modules.
    pub fn open_port(&self) {
        self.send(Command::OpenPort);
    }

    pub fn close_port(&self) {
        self.send(Command::ClosePort { response_tx: None });
    }

    /// Close the port and wait until it is released.
    ///
    /// # Errors
    ///
    /// The worker did not confirm in time.
    pub fn close_port_blocking(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(Command::ClosePort {
            response_tx: Some(response_tx),
        });
        response_rx
            .recv_timeout(CLOSE_TIMEOUT)
            .map_err(|_| Error::TransportTimeout)
    }

    /// Replace the serial settings; an open port is reopened with them.
    pub fn set_serial_settings(&self, settings: SerialSettings) {
        self.send(Command::SetSerialSettings(settings));
    }

    /// Open a channel to a module by its number (0 is ignored).
    pub fn open_channel(&self, module: u8) {
        self.send(Command::OpenChannel(module));
    }

    pub fn close_channel(&self) {
        self.send(Command::CloseChannel);
    }

    /// Modules found by the last gateway refresh.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.view.lock().unwrap().modules.clone()
    }

    pub fn open_block(&self, block: u8) {
        self.send(Command::OpenBlock(block));
    }

    pub fn close_block(&self, block: u8) {
        self.send(Command::CloseBlock(block));
    }

    pub fn close_all_blocks(&self) {
        self.send(Command::CloseAllBlocks);
    }

    /// Open blocks in ascending order.
    pub fn open_blocks(&self) -> Vec<u8> {
        self.view.lock().unwrap().blocks.keys().copied().collect()
    }

    /// Latest value at `position` (0..4) of an open block.
    pub fn block_value(&self, block: u8, position: usize) -> Option<BlockValue> {
        self.view
            .lock()
            .unwrap()
            .blocks
            .get(&block)
            .and_then(|b| b.values.get(position).cloned())
    }

    pub fn block_labels(&self, block: u8) -> Option<BlockLabels> {
        self.view.lock().unwrap().labels.get(&block).cloned()
    }

    /// Current sample slots, one per logged column.
    pub fn sample(&self) -> Vec<SampleSlot> {
        self.view.lock().unwrap().slots.clone()
    }

    /// Write a header now and a row on every block update.
    pub fn start_logging(&self, sink: Box<dyn LogSink>) {
        self.send(Command::StartLogging(sink));
    }

    pub fn stop_logging(&self) {
        self.send(Command::StopLogging);
    }

    pub fn set_timeouts(&self, slow_ms: u16, norm_ms: u16, fast_ms: u16) {
        self.send(Command::SetTimeouts(Timeouts {
            slow_ms,
            norm_ms,
            fast_ms,
        }));
    }

    pub fn set_keep_alive_interval(&self, interval: Duration) {
        self.send(Command::SetKeepAlive(interval));
    }

    pub fn set_quantity_matcher(&self, matcher: QuantityMatcher) {
        self.send(Command::SetQuantityMatcher(matcher));
    }

    /// Send raw KWP2000 request bytes on the open channel.
    pub fn misc_command(&self, payload: Vec<u8>) {
        self.send(Command::Misc(payload));
    }

    /// Bus address of the open channel.
    pub fn channel_dest(&self) -> Option<u8> {
        self.view.lock().unwrap().channel_dest
    }

    pub fn port_open(&self) -> bool {
        self.view.lock().unwrap().port_open
    }

    pub fn adapter_initialised(&self) -> bool {
        self.view.lock().unwrap().adapter_initialised
    }

    /// Short identification of the open module.
    pub fn ecu_info(&self) -> Vec<String> {
        self.view.lock().unwrap().ecu_info.clone()
    }

    /// Dashed part number labels were looked up with.
    pub fn part_number(&self) -> Option<String> {
        self.view.lock().unwrap().part_number.clone()
    }

    /// Part number and component name of the open module.
    pub fn module_info(&self) -> Vec<String> {
        self.view.lock().unwrap().module_info.clone()
    }

    /// Close everything and stop the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("Shutting down diagnostics");
        // The worker may already have exited
        let _ = self.tx.send(Command::Shutdown);
        if worker.join().is_err() {
            error!("Session worker panicked");
        }
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        self.stop();
    }
}
