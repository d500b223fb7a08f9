use std::io::{self, BufRead, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use fdlink::{Config, Link, LinkHandler};

/// Reliable line-oriented chat over an unreliable byte stream.
///
/// Both ends run the full-duplex link protocol on top of a plain TCP
/// connection; either side may start typing once the handshake completes.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum payload bytes per frame
    #[arg(long, default_value_t = 128)]
    mtu: usize,

    /// Send window size (1-7)
    #[arg(long, default_value_t = 7)]
    window: u8,

    /// Keep-alive interval in milliseconds (0 disables)
    #[arg(long, default_value_t = 5000)]
    keep_alive: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wait for a peer to connect
    Listen {
        /// Address to bind, e.g. 127.0.0.1:7878
        addr: String,
    },

    /// Connect to a listening peer
    Connect {
        /// Address to connect to
        addr: String,
    },
}

struct Console;

impl LinkHandler for Console {
    fn on_frame(&mut self, _addr: u8, payload: &[u8]) {
        println!("peer: {}", String::from_utf8_lossy(payload));
    }

    fn on_sent(&mut self, _addr: u8, payload: &[u8], acked: bool) {
        if !acked {
            eprintln!("not delivered: {}", String::from_utf8_lossy(payload));
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let stream = match &args.command {
        Command::Listen { addr } => {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
            log::info!("listening on {addr}");

            let (stream, peer) = listener.accept().context("failed to accept connection")?;
            log::info!("peer connected from {peer}");
            stream
        }
        Command::Connect { addr } => {
            let stream = TcpStream::connect(addr)
                .with_context(|| format!("failed to connect to {addr}"))?;
            log::info!("connected to {addr}");
            stream
        }
    };

    stream.set_nodelay(true).ok();

    let config = Config {
        mtu: args.mtu,
        window: args.window,
        ka_timeout: args.keep_alive,
        ..Config::default()
    };

    let link = Arc::new(Link::new(config, Console).map_err(|e| anyhow!("init failed: {e}"))?);

    // Rx pump. The read timeout keeps the loop responsive without burning a
    // core while the line is idle.
    let rx_link = link.clone();
    let mut rx_stream = stream.try_clone().context("failed to clone stream")?;
    rx_stream
        .set_read_timeout(Some(Duration::from_millis(20)))
        .ok();

    let _rx = thread::spawn(move || {
        let mut buf = [0u8; 512];
        loop {
            match rx_stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("peer closed the connection");
                    break;
                }
                Ok(n) => rx_link.on_rx_data(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    log::error!("read failed: {e}");
                    break;
                }
            }
        }
    });

    // Tx pump; also advances the protocol timers while idle.
    let tx_link = link.clone();
    let mut tx_stream = stream;

    let _tx = thread::spawn(move || loop {
        match tx_link.run_tx(&mut tx_stream) {
            Ok(_) => thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                log::error!("write failed: {e}");
                break;
            }
        }
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;

        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let sent = link.send(line.as_bytes());
        if sent < line.len() {
            eprintln!("queued only {sent} of {} bytes", line.len());
        }
    }

    link.disconnect().ok();
    thread::sleep(Duration::from_millis(200));
    link.close();

    Ok(())
}
