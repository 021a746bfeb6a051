//! Serpent bridge binary - run either node role, or generate a key.
//!
//! ```text
//! serpent-bridge robot      # robot node (control server, telemetry/video senders)
//! serpent-bridge base       # base station (command forwarder, receivers)
//! serpent-bridge gen-psk    # print a fresh SERPENT_PSK_HEX value
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use rand::RngCore;

use serpent_bridge::base::frontend::NullFrontEnd;
use serpent_bridge::{BaseBridge, BaseConfig, RobotBridge, RobotConfig};

/// mimalloc performs better than the system allocator under the
/// many-small-allocations pattern of per-frame JSON work.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "serpent-bridge", version, about = "Serpent teleoperation bridge")]
struct Cli {
    #[command(subcommand)]
    command: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the robot node.
    Robot,
    /// Run the base station node.
    Base,
    /// Generate a 32-byte pre-shared key as 64 hex characters.
    GenPsk,
}

fn init_logging() {
    // LOG_LEVEL is the deployment knob; RUST_LOG still wins for
    // per-module filtering during development.
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// Install TERM/INT handlers and return the `running` flag every worker
/// loop observes. The first signal requests a graceful stop; a second
/// one exits immediately (a wedged shutdown must still be killable).
fn install_signal_handlers() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&shutdown))
            .context("register signal handler")?;
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("register signal handler")?;
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let shutdown = Arc::clone(&shutdown);
        let running = Arc::clone(&running);
        std::thread::Builder::new()
            .name("signal-watcher".into())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                log::info!("Shutdown signal received");
                running.store(false, Ordering::SeqCst);
            })
            .context("spawn signal watcher")?;
    }
    Ok(running)
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Role::Robot => run_robot(),
        Role::Base => run_base(),
        Role::GenPsk => gen_psk(),
    };

    if let Err(e) = result {
        log::error!("Fatal: {e:#}");
        std::process::exit(1);
    }
}

fn run_robot() -> Result<()> {
    let running = install_signal_handlers()?;
    let config = RobotConfig::from_env();
    let bridge = RobotBridge::new(config)?;
    bridge.run(&running)
}

fn run_base() -> Result<()> {
    let running = install_signal_handlers()?;
    let config = BaseConfig::from_env();
    let bridge = BaseBridge::new(config, Arc::new(NullFrontEnd));
    bridge.run(&running)
}

fn gen_psk() -> Result<()> {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    println!("{}", data_encoding::HEXLOWER.encode(&key));
    eprintln!("Deploy as SERPENT_PSK_HEX on BOTH nodes (out-of-band).");
    Ok(())
}
