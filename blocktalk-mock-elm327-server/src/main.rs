//! Mock ELM327 + TP 2.0 vehicle for testing blocktalk without a car
//!
//! Usage: cargo run -p blocktalk-mock-elm327-server
//! Then point blocktalk at tcp://127.0.0.1:35000

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blocktalk_mock_elm327_server::{MockAdapter, MockCar};
use clap::Parser;
use log::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "blocktalk-mock-elm327")]
#[command(about = "Simulated ELM327 adapter with a VAG TP 2.0 car behind it")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    bind: String,

    /// Answer the STN (OBDLink) ST command set
    #[arg(long)]
    stn: bool,

    /// Report this protocol version in channel setup replies (non-zero is rejected by testers)
    #[arg(long, default_value = "0")]
    channel_version: u8,

    /// Log every command and response
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp_millis()
        .init();

    info!("Mock ELM327 starting on {}...", args.bind);
    let listener = match TcpListener::bind(&args.bind) {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", args.bind);
            std::process::exit(1);
        }
    };
    info!("Mock ELM327 ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let adapter = MockAdapter::new(MockCar::default());
                let (stn, version) = (args.stn, args.channel_version);
                adapter.update_settings(|s| {
                    s.stn = stn;
                    s.channel_version = version;
                });
                std::thread::spawn(move || handle_client(stream, adapter));
            }
            Err(e) => warn!("Connection error: {e}"),
        }
    }
}

fn handle_client(mut stream: TcpStream, mut adapter: MockAdapter) {
    let Ok(mut writer) = stream.try_clone() else {
        error!("Could not clone client stream");
        return;
    };
    let running = Arc::new(AtomicBool::new(true));

    // Adapter output -> client
    let pump = {
        let running = Arc::clone(&running);
        let mut adapter = adapter.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            while running.load(Ordering::Relaxed) {
                match adapter.read(&mut buf) {
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]) {
                            warn!("Write error: {e}");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!("Adapter read error: {e}");
                        break;
                    }
                }
            }
        })
    };

    // Client -> adapter
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(n) => {
                if let Err(e) = adapter.write_all(&buf[..n]) {
                    warn!("Adapter write error: {e}");
                    break;
                }
            }
            Err(e) => {
                warn!("Read error: {e}");
                break;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = pump.join();
}
