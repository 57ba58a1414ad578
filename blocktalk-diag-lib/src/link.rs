//! Adapter link with a dedicated port task.
//!
//! Architecture:
//! - Port task: owns the serial port (or TCP stream), performs writes it is
//!   handed and turns received bytes into lines
//! - Line queue: completed lines are pushed into a bounded queue shared with
//!   the session, which blocks on it with a timeout
//! - Open/close are blocking request/reply calls; writes are fire-and-forget

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use atomic_enum::atomic_enum;
use blocktalk_elm327_lib::{format_bytes, LineAssembler, LineSource, MAX_FRAME_LEN};
use log::{debug, error, info, warn};
use smallvec::SmallVec;

use crate::config::{FlowControl, Parity, SerialSettings};
use crate::error::{Error, Result};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Read timeout configured on the port, bounds request latency while open.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Oldest lines are dropped beyond this.
const LINE_QUEUE_CAPACITY: usize = 256;
/// How long blocking open/close calls wait for the port task.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything the port task can talk to.
pub trait Port: Read + Write + Send {}

impl<T: Read + Write + Send> Port for T {}

/// Opens ports for the port task.
pub trait PortOpener: Send {
    fn open(&mut self, settings: &SerialSettings) -> io::Result<Box<dyn Port>>;
}

/// Serial ports via `serialport`, or `tcp://host:port` for network adapters.
#[derive(Debug, Default)]
pub struct SystemOpener;

impl PortOpener for SystemOpener {
    fn open(&mut self, settings: &SerialSettings) -> io::Result<Box<dyn Port>> {
        if let Some(addr) = settings.port.strip_prefix("tcp://") {
            info!("Connecting to adapter at {addr}");
            let stream = TcpStream::connect(addr)?;
            stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {e}");
            }
            return Ok(Box::new(stream));
        }

        info!("Opening {} at {} baud", settings.port, settings.baud_rate);
        let mut port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(READ_POLL_INTERVAL)
            .open()?;

        // A parameter the driver rejects is logged; the port stays usable
        if let Err(e) = port.set_baud_rate(settings.baud_rate) {
            error!("Failed to set baud rate {}: {e}", settings.baud_rate);
        }
        let data_bits = match settings.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        if let Err(e) = port.set_data_bits(data_bits) {
            error!("Failed to set data bits {}: {e}", settings.data_bits);
        }
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        if let Err(e) = port.set_parity(parity) {
            error!("Failed to set parity {:?}: {e}", settings.parity);
        }
        let stop_bits = if settings.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };
        if let Err(e) = port.set_stop_bits(stop_bits) {
            error!("Failed to set stop bits {}: {e}", settings.stop_bits);
        }
        let flow = match settings.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        };
        if let Err(e) = port.set_flow_control(flow) {
            error!("Failed to set flow control {:?}: {e}", settings.flow_control);
        }

        Ok(Box::new(port))
    }
}

/// State of the port as seen by the port task.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum LinkStatus {
    Closed,
    Open,
    /// The port failed while open; it has been dropped.
    Lost,
}

/// Completed adapter lines, shared between the port task and its reader.
#[derive(Default)]
pub struct LineQueue {
    lines: Mutex<VecDeque<String>>,
    ready: Condvar,
}

impl LineQueue {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= LINE_QUEUE_CAPACITY {
            warn!("Line queue full, dropping {:?}", lines.front());
            lines.pop_front();
        }
        lines.push_back(line);
        drop(lines);
        self.ready.notify_all();
    }

    /// Next line, waiting up to `timeout` if `wait` is set and none is queued.
    pub fn pop(&self, timeout: Duration, wait: bool) -> Option<String> {
        let mut lines = self.lines.lock().unwrap();
        if wait {
            lines = self
                .ready
                .wait_timeout_while(lines, timeout, |l| l.is_empty())
                .unwrap()
                .0;
        }
        lines.pop_front()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }
}

/// Bytes handed to the port task for one command (text plus `\r`).
pub type CommandBuffer = SmallVec<u8, 32>;

enum LinkRequest {
    Open {
        settings: SerialSettings,
        response_tx: oneshot::Sender<io::Result<()>>,
    },
    Close {
        response_tx: oneshot::Sender<()>,
    },
    Write(CommandBuffer),
}

/// Session-side handle to the port task.
pub struct Link {
    tx: Option<Sender<LinkRequest>>,
    lines: Arc<LineQueue>,
    status: Arc<AtomicLinkStatus>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    /// Start the port task.
    pub fn start(opener: Box<dyn PortOpener>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let lines = Arc::new(LineQueue::default());
        let status = Arc::new(AtomicLinkStatus::new(LinkStatus::Closed));

        let task = {
            let lines = Arc::clone(&lines);
            let status = Arc::clone(&status);
            std::thread::Builder::new()
                .name("blocktalk-port".to_string())
                .spawn(move || port_task(&rx, opener, &lines, &status))?
        };

        Ok(Self {
            tx: Some(tx),
            lines,
            status,
            task: Some(task),
        })
    }

    pub fn status(&self) -> LinkStatus {
        self.status.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.status() == LinkStatus::Open
    }

    /// Open the port, waiting for the port task's verdict.
    pub fn open(&self, settings: &SerialSettings) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LinkRequest::Open {
            settings: settings.clone(),
            response_tx,
        })?;
        response_rx
            .recv_timeout(REQUEST_TIMEOUT)
            .map_err(|_| Error::TransportTimeout)?
            .map_err(Error::from)
    }

    /// Close the port and wait until it is released.
    pub fn close(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LinkRequest::Close { response_tx })?;
        response_rx
            .recv_timeout(REQUEST_TIMEOUT)
            .map_err(|_| Error::TransportTimeout)
    }

    /// Queue one text command; `\r` is appended.
    pub fn write_line(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::PortClosed);
        }
        debug!("TX: {text}");
        let mut buffer: CommandBuffer = text.as_bytes().iter().copied().collect();
        buffer.push(b'\r');
        self.send(LinkRequest::Write(buffer))
    }

    /// Queue one CAN payload of at most 8 bytes as hex.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_FRAME_LEN {
            error!("Refusing to send {} bytes in one frame", bytes.len());
            return Err(Error::TooLong { len: bytes.len() });
        }
        self.write_line(&format_bytes(bytes))
    }

    pub fn set_send_can_id(&self, id: u16) -> Result<()> {
        self.write_line(&format!("AT SH {id:03X}"))
    }

    pub fn set_recv_can_id(&self, id: u16) -> Result<()> {
        self.write_line(&format!("AT CRA {id:03X}"))
    }

    /// Drop any lines that arrived unrequested.
    pub fn clear_lines(&self) {
        self.lines.clear();
    }

    fn send(&self, request: LinkRequest) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(Error::PortClosed)?
            .send(request)
            .map_err(|_| Error::PortClosed)
    }
}

impl LineSource for Link {
    fn next_line(&mut self, timeout: Duration, wait: bool) -> Option<String> {
        let line = self.lines.pop(timeout, wait);
        if let Some(ref l) = line {
            debug!("RX: {l}");
        }
        line
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // Disconnecting the channel stops the port task
        self.tx = None;
        if let Some(task) = self.task.take() {
            if task.join().is_err() {
                error!("Port task panicked");
            }
        }
    }
}

/// The port task - owns the port and processes requests
fn port_task(
    rx: &Receiver<LinkRequest>,
    mut opener: Box<dyn PortOpener>,
    lines: &LineQueue,
    status: &AtomicLinkStatus,
) {
    info!("Port task started");
    let mut port: Option<Box<dyn Port>> = None;
    let mut assembler = LineAssembler::new();
    let mut buffer = [0u8; 256];

    loop {
        // Block on requests only while there is nothing to read
        let request = if port.is_some() {
            match rx.try_recv() {
                Ok(r) => Some(r),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match rx.recv_timeout(IDLE_POLL_INTERVAL) {
                Ok(r) => Some(r),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        };

        if let Some(request) = request {
            match request {
                LinkRequest::Open {
                    settings,
                    response_tx,
                } => {
                    port = None;
                    assembler.clear();
                    lines.clear();
                    let result = opener.open(&settings).map(|p| {
                        port = Some(p);
                    });
                    match &result {
                        Ok(()) => {
                            info!("Port {} open", settings.port);
                            status.store(LinkStatus::Open, Ordering::Release);
                        }
                        Err(e) => {
                            warn!("Failed to open {}: {e}", settings.port);
                            status.store(LinkStatus::Closed, Ordering::Release);
                        }
                    }
                    // Send response (ignore if receiver dropped)
                    let _ = response_tx.send(result);
                }
                LinkRequest::Close { response_tx } => {
                    if port.take().is_some() {
                        info!("Port closed");
                    }
                    status.store(LinkStatus::Closed, Ordering::Release);
                    let _ = response_tx.send(());
                }
                LinkRequest::Write(bytes) => {
                    if let Some(p) = port.as_mut() {
                        if let Err(e) = p.write_all(&bytes).and_then(|()| p.flush()) {
                            warn!("Port write failed: {e}");
                            port = None;
                            status.store(LinkStatus::Lost, Ordering::Release);
                        }
                    }
                }
            }
            continue;
        }

        let Some(p) = port.as_mut() else {
            continue;
        };
        match p.read(&mut buffer) {
            Ok(0) => {
                warn!("Port reached end of stream");
                port = None;
                status.store(LinkStatus::Lost, Ordering::Release);
            }
            Ok(n) => {
                for line in assembler.push(&buffer[..n]) {
                    lines.push(line);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                // Nothing to read yet; back off if the port does not block
                if e.kind() == io::ErrorKind::WouldBlock {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Err(e) => {
                warn!("Port read failed: {e}");
                port = None;
                status.store(LinkStatus::Lost, Ordering::Release);
            }
        }
    }

    info!("Port task channel closed, shutting down");
    status.store(LinkStatus::Closed, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use blocktalk_mock_elm327_server::{MockAdapter, MockCar};

    /// Wait until `deadline` for the line queue to reach `count` lines.
    fn wait_for_lines(queue: &LineQueue, count: usize, deadline: Instant) -> bool {
        while queue.len() < count {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    struct MockOpener(MockAdapter);

    impl PortOpener for MockOpener {
        fn open(&mut self, _settings: &SerialSettings) -> io::Result<Box<dyn Port>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    struct FailingOpener;

    impl PortOpener for FailingOpener {
        fn open(&mut self, settings: &SerialSettings) -> io::Result<Box<dyn Port>> {
            Err(io::Error::new(io::ErrorKind::NotFound, settings.port.clone()))
        }
    }

    #[test]
    fn test_line_queue_drops_oldest() {
        let queue = LineQueue::default();
        for i in 0..=LINE_QUEUE_CAPACITY {
            queue.push(i.to_string());
        }
        assert_eq!(queue.len(), LINE_QUEUE_CAPACITY);
        assert_eq!(queue.pop(Duration::ZERO, false).as_deref(), Some("1"));
    }

    #[test]
    fn test_line_queue_wait_times_out() {
        let queue = LineQueue::default();
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(20), true), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(queue.pop(Duration::from_secs(1), false), None);
    }

    #[test]
    fn test_write_and_read_lines() {
        let mut link = Link::start(Box::new(MockOpener(MockAdapter::new(MockCar::default())))).unwrap();
        assert_eq!(link.write_line("AT I").unwrap_err().to_string(), "port not open");

        link.open(&SerialSettings::default()).unwrap();
        assert!(link.is_open());

        link.write_line("AT E0").unwrap();
        assert!(wait_for_lines(&link.lines, 3, Instant::now() + Duration::from_secs(2)));
        let timeout = Duration::from_millis(500);
        assert_eq!(link.next_line(timeout, true).as_deref(), Some("AT E0"));
        assert_eq!(link.next_line(timeout, true).as_deref(), Some("OK"));
        assert_eq!(link.next_line(timeout, true).as_deref(), Some(">"));

        link.close().unwrap();
        assert_eq!(link.status(), LinkStatus::Closed);
    }

    #[test]
    fn test_write_bytes_limit() {
        let link = Link::start(Box::new(FailingOpener)).unwrap();
        assert!(matches!(link.write_bytes(&[0; 9]), Err(Error::TooLong { len: 9 })));
        assert!(link.open(&SerialSettings::default()).is_err());
        assert_eq!(link.status(), LinkStatus::Closed);
    }
}
