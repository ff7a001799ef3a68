// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use log::*;

use nprpc::{DebugLevel, RpcBuilder};

#[derive(Parser)]
#[command(about = "NPRPC nameserver")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 15000)]
    tcp_port: u16,

    /// WebSocket port to listen on (disabled when omitted).
    #[arg(long)]
    ws_port: Option<u16>,

    /// Hostname advertised in object references.
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Log every call the dispatch loop handles.
    #[arg(long)]
    trace_calls: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut builder = RpcBuilder::new()
        .set_hostname(&args.hostname)
        .set_debug_level(if args.trace_calls {
            DebugLevel::EveryCall
        } else {
            DebugLevel::Critical
        })
        .with_tcp(args.tcp_port);
    if let Some(port) = args.ws_port {
        builder = builder.with_websocket(port);
    }

    let rt = builder.build()?;
    let oid = nprpc_nameserver::server::activate(&rt)?;

    info!(
        "nameserver up at {:?} (tcp port {})",
        oid.urls,
        rt.tcp_port().unwrap_or(0)
    );

    loop {
        std::thread::park();
    }
}
