//! Measuring block reader
//!
//! Opens an ELM327 adapter, lists the modules behind the gateway and polls
//! measuring blocks of one module, printing values and optionally logging
//! them to CSV.
//!
//! Usage: cargo run -p blocktalk-cli -- [OPTIONS]

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use blocktalk_diag_lib::{
    module_name, Config, CsvLogSink, Diagnostics, Event, LabelRepository, NoLabels, Port,
    PortOpener, SerialSettings, StaticLabels, SystemOpener,
};
use blocktalk_mock_elm327_server::{MockAdapter, MockCar};
use clap::Parser;
use log::{info, warn, LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "blocktalk")]
#[command(about = "Read VAG measuring blocks through an ELM327 adapter")]
struct Args {
    /// Config file (created with --save-config)
    #[arg(short, long, default_value = "blocktalk.json")]
    config: PathBuf,

    /// Serial port, or tcp://host:port for network adapters
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Module number to open, in hex (e.g. 01 for the engine)
    #[arg(short, long, value_parser = parse_hex_u8)]
    module: Option<u8>,

    /// Measuring blocks to poll, comma separated
    #[arg(short, long, value_delimiter = ',')]
    blocks: Vec<u8>,

    /// Block labels as JSON, keyed by dashed part number
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Directory to write a CSV log into
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Seconds to poll blocks for (0 = run forever)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Interval between value printouts in seconds
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// Only list the modules reported by the gateway
    #[arg(short, long)]
    list_modules: bool,

    /// Talk to a simulated car instead of a real adapter
    #[arg(long)]
    mock: bool,

    /// Write the effective config back to --config
    #[arg(long)]
    save_config: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("'{s}' is not a hex byte: {e}"))
}

/// Serves the simulated car for `--mock`.
struct MockOpener(MockAdapter);

impl PortOpener for MockOpener {
    fn open(&mut self, _settings: &SerialSettings) -> io::Result<Box<dyn Port>> {
        Ok(Box::new(self.0.clone()))
    }
}

struct Stats {
    updates: u64,
    interval_updates: u64,
    interval_start: Instant,
}

impl Stats {
    fn new() -> Self {
        Self {
            updates: 0,
            interval_updates: 0,
            interval_start: Instant::now(),
        }
    }

    fn record_update(&mut self) {
        self.updates += 1;
        self.interval_updates += 1;
    }

    fn print_interval(&mut self, diag: &Diagnostics) {
        let elapsed = self.interval_start.elapsed();
        #[allow(clippy::cast_precision_loss)] // interval_updates won't approach 2^53
        let rate = self.interval_updates as f64 / elapsed.as_secs_f64();

        println!("--- {rate:.1} blocks/s ---");
        for slot in diag.sample() {
            let (block, position) = slot.refs[0];
            let units = diag.block_value(block, position).map_or("", |v| v.units);
            let value = slot.value.as_ref().map(ToString::to_string).unwrap_or_default();
            println!("  {:<40} {value}", slot.heading(units));
        }
        io::stdout().flush().ok();

        self.interval_updates = 0;
        self.interval_start = Instant::now();
    }

    fn print_summary(&self, total_elapsed: Duration) {
        println!("\n=== Summary ===");
        println!("Total time:     {:.2}s", total_elapsed.as_secs_f64());
        println!("Block updates:  {}", self.updates);
        if self.updates > 0 {
            #[allow(clippy::cast_precision_loss)] // updates won't approach 2^53
            let rate = self.updates as f64 / total_elapsed.as_secs_f64();
            println!("Update rate:    {rate:.1} blocks/s");
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("Failed to load config from {}", args.config.display()))?
    } else {
        Config::default()
    };
    if let Some(port) = &args.port {
        config.serial.port.clone_from(port);
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if args.mock {
        config.serial.port = "mock".to_string();
    }
    Ok(config)
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        config.log_level.as_level_filter()
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

/// Wait for the next event, giving up after `timeout`.
fn next_event(events: &Receiver<Event>, timeout: Duration) -> Result<Option<Event>> {
    match events.recv_timeout(timeout) {
        Ok(event) => Ok(Some(event)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => bail!("Diagnostics stopped unexpectedly"),
    }
}

fn print_modules(diag: &Diagnostics) {
    let modules = diag.modules();
    println!("{} modules:", modules.len());
    for m in modules {
        println!(
            "  {:02X}  @{:02X}  {:<24} {}",
            m.number,
            m.address,
            m.name,
            if m.present { "ok" } else { "not responding" }
        );
    }
}

/// Bring the port up and wait for the gateway module list (or its failure).
fn wait_for_modules(diag: &Diagnostics, events: &Receiver<Event>) -> Result<()> {
    diag.open_port();
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut listed = false;

    while Instant::now() < deadline {
        let Some(event) = next_event(events, Duration::from_millis(200))? else {
            continue;
        };
        match event {
            Event::PortOpened(false) => bail!("Could not open the adapter port"),
            Event::AdapterInitialised(false) => bail!("Adapter did not accept the CAN setup"),
            Event::AdapterInitialised(true) => info!("Adapter ready"),
            Event::ModuleListRefreshed => listed = true,
            Event::ChannelOpened(false) => {
                if !listed {
                    warn!("Gateway did not provide a module list");
                }
                return Ok(());
            }
            _ => {}
        }
    }
    bail!("Timed out waiting for the gateway")
}

fn open_module(diag: &Diagnostics, events: &Receiver<Event>, module: u8) -> Result<()> {
    println!("Opening {module:02X} ({})...", module_name(module));
    diag.open_channel(module);
    let deadline = Instant::now() + Duration::from_secs(30);

    while Instant::now() < deadline {
        let Some(event) = next_event(events, Duration::from_millis(200))? else {
            continue;
        };
        match event {
            Event::ChannelOpened(false) => bail!("Could not open a channel to module {module:02X}"),
            Event::NewModuleInfo(info) => println!("Part number: {}\nComponent:   {}", info[0], info[1]),
            Event::LabelsLoaded(false) => println!("No labels for this module"),
            Event::NewEcuInfo(info) => {
                println!("Identification: {}", info.join(" / "));
                return Ok(());
            }
            _ => {}
        }
    }
    bail!("Timed out identifying module {module:02X}")
}

fn poll_blocks(diag: &Diagnostics, events: &Receiver<Event>, args: &Args) -> Result<()> {
    for &block in &args.blocks {
        diag.open_block(block);
    }
    if let Some(dir) = &args.csv {
        let (sink, path) = CsvLogSink::create_in(dir)
            .with_context(|| format!("Failed to create a log in {}", dir.display()))?;
        diag.start_logging(Box::new(sink));
        println!("Logging to {}", path.display());
    }

    let mut stats = Stats::new();
    let start = Instant::now();
    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let interval = Duration::from_secs_f64(args.interval);

    loop {
        if duration.is_some_and(|d| start.elapsed() >= d) {
            break;
        }

        match next_event(events, Duration::from_millis(100))? {
            Some(Event::NewBlockData(_)) => stats.record_update(),
            Some(Event::RequestRejected { service, reason }) => {
                warn!("Module rejected service {service:02X} (reason {reason:02X?})");
            }
            Some(Event::ChannelOpened(false)) => {
                stats.print_summary(start.elapsed());
                bail!("Channel to the module was lost");
            }
            _ => {}
        }

        if stats.interval_start.elapsed() >= interval {
            stats.print_interval(diag);
        }
    }

    diag.stop_logging();
    stats.print_summary(start.elapsed());
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    init_logging(&config, args.verbose);

    if args.save_config {
        config
            .save(&args.config)
            .with_context(|| format!("Failed to save config to {}", args.config.display()))?;
    }

    let labels: Box<dyn LabelRepository> = match &args.labels {
        Some(path) => Box::new(
            StaticLabels::from_json_file(path)
                .with_context(|| format!("Failed to load labels from {}", path.display()))?,
        ),
        None => Box::new(NoLabels),
    };
    let opener: Box<dyn PortOpener> = if args.mock {
        Box::new(MockOpener(MockAdapter::new(MockCar::default())))
    } else {
        Box::new(SystemOpener)
    };

    println!("Connecting to {}...", config.serial.port);
    let (diag, events) = Diagnostics::start(config, labels, opener).context("Failed to start diagnostics")?;

    wait_for_modules(&diag, &events)?;
    print_modules(&diag);
    if args.list_modules {
        diag.shutdown();
        return Ok(());
    }

    let Some(module) = args.module else {
        println!("No --module given, done");
        diag.shutdown();
        return Ok(());
    };
    open_module(&diag, &events, module)?;

    if args.blocks.is_empty() {
        println!("No --blocks given, done");
    } else {
        poll_blocks(&diag, &events, args)?;
    }
    diag.shutdown();
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
