// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! RQD: the per-host render-farm execution daemon.
//!
//! Probes the host, builds the frame supervisor, and runs until a lifecycle
//! operation (shutdown, restart, reboot) tears it down. The inbound RPC
//! transport and the input-device watcher attach through the supervisor's
//! public surface and the idle-event channel respectively.

use clap::Parser;
use rqd_config::Settings;
use rqd_core::{ExitIntent, Supervisor};
use rqd_machine::Machine;
use rqd_machine::platform::default_platform;
use rqd_nimby::audit::LogAuditSink;
use rqd_nimby::{ChannelIdleSource, Nimby, idle_event_channel};
use rqd_report::client::LogOnlyDispatcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Per-host render-farm execution daemon.
#[derive(Debug, Parser)]
#[command(name = "rqd", version, about)]
struct Options {
    /// Path to the YAML settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable the user-presence idle lock regardless of host policy.
    #[arg(long)]
    nimby_off: bool,

    /// Log filter, e.g. `info` or `rqd_core=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let options = Options::parse();

    let filter =
        EnvFilter::try_new(&options.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match Settings::load(options.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid settings");
            std::process::exit(1);
        }
    };
    let respawn_exit_code = settings.machine.respawn_exit_code;

    let machine = match Machine::new(&settings, default_platform()) {
        Ok(machine) => Arc::new(machine),
        Err(e) => {
            error!(error = %e, "host probe failed");
            std::process::exit(1);
        }
    };

    info!(
        endpoint = %settings.dispatcher.endpoint,
        "no dispatcher transport attached; reports are logged"
    );
    let supervisor = Supervisor::new(
        settings,
        machine,
        Arc::new(LogOnlyDispatcher),
        Nimby::new(),
    );

    // The device watcher feeds this channel; it stays open for the daemon's
    // lifetime even when no watcher is attached.
    let (_idle_events, idle_source) = idle_event_channel();
    if options.nimby_off {
        info!("idle lock disabled via --nimby-off");
        supervisor.start(None::<ChannelIdleSource>, Arc::new(LogAuditSink));
    } else {
        supervisor.start(Some(idle_source), Arc::new(LogAuditSink));
    }
    supervisor.connected();
    info!("rqd started");

    match supervisor.wait_for_exit() {
        ExitIntent::Shutdown | ExitIntent::Reboot => std::process::exit(0),
        ExitIntent::Respawn => std::process::exit(respawn_exit_code),
    }
}
