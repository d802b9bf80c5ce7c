// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// ZENEDGE bridge CLI.
//
// Maps the shared memory file the kernel talks through, registers the
// command handlers and polls until interrupted.
//
// Exit codes: 0 on clean shutdown, 1 when the backing file is missing and
// --create was not given, 2 on any other fatal startup error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zenedge_bridge::bridge::{Bridge, BridgeConfig};
use zenedge_bridge::error::BridgeError;
use zenedge_bridge::handlers;

#[derive(Parser, Debug)]
#[command(name = "zenedge_bridge", about = "ZENEDGE host-side IPC bridge")]
struct Args {
    /// Path to the shared memory backing file.
    #[arg(long, short = 's', default_value = "/dev/shm/zenedge.shm")]
    shm: PathBuf,

    /// Directory containing model files.
    #[arg(long, short = 'm', default_value = "./models")]
    models: PathBuf,

    /// Create the backing file if it does not exist.
    #[arg(long, short = 'c')]
    create: bool,

    /// Poll interval in seconds.
    #[arg(long, short = 'p', default_value_t = 0.001)]
    poll_interval: f64,

    /// Environment name for ENV_RESET / ENV_STEP.
    #[arg(long, default_value = "CartPole-v1")]
    env: String,

    /// Directory IFR records are persisted to.
    #[arg(long, default_value = "/tmp/zenedge_ifr")]
    ifr_dir: PathBuf,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig {
        shm_path: args.shm,
        model_dir: args.models,
        create: args.create,
        poll_interval: Duration::from_secs_f64(args.poll_interval.max(0.0)),
        env_name: args.env,
        ifr_dir: args.ifr_dir,
        ..BridgeConfig::default()
    };

    let mut bridge = match Bridge::new(config) {
        Ok(b) => b,
        Err(e @ BridgeError::ShmMissing(_)) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(2);
        }
    };

    handlers::register_all(&mut bridge);
    install_signal_handlers();

    bridge.run(&STOP);
    info!("bridge stopped");
}
