//! Echo every byte received back to its sender.
//!
//! Every received block is queued back to the peer as is, so the echo path never copies payload
//! bytes out of the pool.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin ember-echo -- --listen 127.0.0.1:7000 --cpu 0
//! ```
//!
//! In another terminal:
//!
//! ```sh
//! nc 127.0.0.1 7000
//! ```
//!
//! Close standard input (or press `Ctrl-D`) to stop the server. Pool and transport metrics are
//! printed on exit.

use clap::{value_parser, Arg, Command};
use ember_pool::{Config as PoolConfig, Pool};
use ember_transport::{Config, Connection, Echo, Handler, Transport};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{io::Read, net::SocketAddr, process::ExitCode, time::Duration};
use tracing::{error, info, Level};

fn command() -> Command {
    Command::new("ember-echo")
        .about("echo every byte received back to its sender")
        .arg(
            Arg::new("listen")
                .long("listen")
                .default_value("127.0.0.1:7000")
                .value_parser(value_parser!(SocketAddr))
                .help("IPv4 address to listen on"),
        )
        .arg(
            Arg::new("poll-timeout")
                .long("poll-timeout")
                .default_value("3000")
                .value_parser(value_parser!(u64).range(1..))
                .help("Maximum time a single wait blocks (in milliseconds)"),
        )
        .arg(
            Arg::new("receive-timeout")
                .long("receive-timeout")
                .value_parser(value_parser!(u64).range(1..))
                .help("Close connections silent for this long (in milliseconds)"),
        )
        .arg(
            Arg::new("cpu")
                .long("cpu")
                .value_parser(value_parser!(usize))
                .help("CPU to pin the polling thread to"),
        )
        .arg(
            Arg::new("packet-size")
                .long("packet-size")
                .default_value("8192")
                .value_parser(clap::builder::RangedU64ValueParser::<usize>::new().range(1..))
                .help("Size of the blocks reads land in"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level)),
        )
}

fn main() -> ExitCode {
    // Parse arguments
    let matches = command().get_matches();

    // Create logger
    let level = *matches.get_one::<Level>("log-level").unwrap();
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure pool
    let mut registry = Registry::default();
    let packet_size = *matches.get_one::<usize>("packet-size").unwrap();
    let pool = match Pool::new(PoolConfig::default().with_packet_size(packet_size), &mut registry) {
        Ok(pool) => pool,
        Err(err) => {
            error!(?err, "failed to create pool");
            return ExitCode::FAILURE;
        }
    };

    // Configure transport
    let poll_timeout = *matches.get_one::<u64>("poll-timeout").unwrap();
    let mut cfg = Config::default()
        .with_label("echo")
        .with_poll_timeout(Duration::from_millis(poll_timeout));
    if let Some(cpu) = matches.get_one::<usize>("cpu") {
        cfg = cfg.with_cpu(*cpu);
    }
    if let Some(timeout) = matches.get_one::<u64>("receive-timeout") {
        cfg = cfg.with_receive_timeout(Duration::from_millis(*timeout));
    }
    let mut transport = match Transport::new(cfg, pool, &mut registry) {
        Ok(transport) => transport,
        Err(err) => {
            error!(?err, "failed to create transport");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = transport.init() {
        error!(?err, "failed to start transport");
        return ExitCode::FAILURE;
    }

    // Serve
    let addr = *matches.get_one::<SocketAddr>("listen").unwrap();
    let acceptor = |conn: &mut Connection| -> Option<Box<dyn Handler>> {
        info!(peer = conn.peer(), "serving");
        Some(Box::new(Echo))
    };
    match transport.listen(addr, acceptor) {
        Ok(local) => info!(%local, "echoing"),
        Err(err) => {
            error!(?err, %addr, "failed to listen");
            return ExitCode::FAILURE;
        }
    }

    // Run until standard input closes
    let mut sink = Vec::new();
    if let Err(err) = std::io::stdin().read_to_end(&mut sink) {
        error!(?err, "failed to read stdin");
    }

    let mut code = ExitCode::SUCCESS;
    if let Err(err) = transport.fini() {
        error!(?err, "failed to stop transport");
        code = ExitCode::FAILURE;
    }
    if let Err(err) = transport.destroy() {
        error!(?err, "failed to destroy transport");
        code = ExitCode::FAILURE;
    }

    let mut metrics = String::new();
    if encode(&mut metrics, &registry).is_ok() {
        print!("{metrics}");
    }
    code
}
