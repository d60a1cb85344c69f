// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rfgwd - radio gateway daemon
//!
//! Wires the serial frame bus, the CCU link and (optionally) the fleet
//! replication proxy together and runs until Ctrl-C.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use rfgw::{FrameBus, GatewayConfig, LoopbackSerial, ProxyMode, RemoteLink, ReplicationProxy};

/// Radio gateway daemon
#[derive(Parser, Debug)]
#[command(name = "rfgwd")]
#[command(version)]
#[command(about = "Bridge a radio transceiver serial link to a CCU over UDP")]
struct Args {
    /// UDP port for the CCU link
    #[arg(long, default_value_t = rfgw::config::CCU_LINK_PORT)]
    ccu_port: u16,

    /// UDP port for sibling gateway traffic
    #[arg(long, default_value_t = rfgw::config::PROXY_PORT)]
    proxy_port: u16,

    /// Replication role: standalone, slave, master
    #[arg(long, default_value = "standalone")]
    mode: ModeArg,

    /// Master gateway address (required in slave mode)
    #[arg(long)]
    master: Option<SocketAddr>,

    /// IP siblings reach this gateway at (default: primary interface)
    #[arg(long)]
    advertised_ip: Option<Ipv4Addr>,

    /// Log level when RUST_LOG is unset: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Period of the status log line in seconds (0 = disabled)
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

#[derive(Clone, Copy, Debug)]
struct ModeArg(ProxyMode);

impl std::str::FromStr for ModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standalone" => Ok(Self(ProxyMode::Standalone)),
            "slave" => Ok(Self(ProxyMode::Slave)),
            "master" => Ok(Self(ProxyMode::Master)),
            _ => Err(format!("unknown mode: {} (standalone|slave|master)", s)),
        }
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.clone()),
    )
    .init();

    if let Err(e) = run(&args) {
        log::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = GatewayConfig {
        ccu_port: args.ccu_port,
        proxy_port: args.proxy_port,
        mode: args.mode.0,
        master_addr: args.master,
        advertised_ip: args.advertised_ip,
        ..GatewayConfig::default()
    };
    log::info!(
        "rfgwd starting: mode={} ccu=udp/{} proxy=udp/{}",
        cfg.mode,
        cfg.ccu_port,
        cfg.proxy_port
    );

    // TODO: replace with the hardware UART driver once it is ported;
    // the loopback link makes the daemon runnable without a radio.
    let serial = Arc::new(LoopbackSerial::new());
    let bus = Arc::new(FrameBus::new(serial));
    let link = RemoteLink::new(&cfg, bus.clone())?;
    let proxy = ReplicationProxy::new(&cfg, bus.clone(), link.clone())?;
    link.set_proxy(proxy.clone());

    // local frames reach the CCU directly only when no fleet dedup
    // sits in between
    match cfg.mode {
        ProxyMode::Standalone => bus.add_handler(link.clone()),
        ProxyMode::Slave | ProxyMode::Master => bus.add_handler(proxy.clone()),
    }

    bus.start()?;
    link.start()?;
    if proxy.is_active() {
        proxy.start()?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut elapsed = 0u64;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        elapsed += 1;
        if args.status_interval != 0 && elapsed % args.status_interval == 0 {
            log_status(&bus, &link, &proxy);
        }
    }

    log::info!("shutting down");
    if proxy.is_active() {
        proxy.stop();
    }
    link.stop();
    bus.stop();
    Ok(())
}

fn log_status(bus: &FrameBus, link: &RemoteLink, proxy: &ReplicationProxy) {
    let b = bus.stats();
    let l = link.stats();
    log::info!(
        "status: ccu={} dispatched={} sent={} dropped={} relayed={} rejected={}",
        link.remote_addr()
            .map_or_else(|| "-".into(), |a| a.to_string()),
        b.frames_dispatched,
        b.frames_sent,
        b.frames_dropped,
        l.frames_relayed,
        l.rejected
    );
    if proxy.is_active() {
        let p = proxy.stats();
        log::info!(
            "status: fleet {} sightings={} relays={} forwarded={} unicast={} broadcast={} routes={}",
            proxy.mode(),
            p.sightings,
            p.relays,
            p.frames_forwarded,
            p.commands_unicast,
            p.commands_broadcast,
            proxy.routing().len()
        );
    }
}
