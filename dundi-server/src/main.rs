//! DUNDi node daemon
//!
//! Loads a JSON configuration, runs a node and reads operator commands
//! from stdin:
//! - SIGHUP (or `reload`) re-reads the configuration
//! - SIGINT/SIGTERM (or `quit`) shut the node down

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use dundi_core::{Config, Dundi, JsonFileStore, KvStore, MemoryStore, StaticDialplan};

mod cli;

use cli::CliCommand;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_CONFIG: &str = "dundi.json";

/// How often the main loop checks for signals
const SIGNAL_POLL: Duration = Duration::from_millis(200);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // dundi-server [config.json] [store.json]
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(|s| s.as_str()).unwrap_or(DEFAULT_CONFIG).to_string();
    let store: Arc<dyn KvStore> = match args.get(2) {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    log::info!("DUNDi server starting...");
    log::info!("  Config: {}", config_path);
    log::info!("  Store:  {}", args.get(2).map(|s| s.as_str()).unwrap_or("(memory)"));

    let config = Config::from_file(&config_path)?;
    let dialplan = Arc::new(StaticDialplan::from_config(&config));
    let mut node = Dundi::start(&config, store, dialplan)?;

    let reload = Arc::new(AtomicBool::new(false));
    let terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminate))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&terminate))?;

    let (tx, rx) = mpsc::channel::<String>();
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    let mut console_open = true;
    while !terminate.load(Ordering::SeqCst) {
        if reload.swap(false, Ordering::SeqCst) {
            reload_config(&node, &config_path);
        }
        if !console_open {
            std::thread::sleep(SIGNAL_POLL);
            continue;
        }
        let line = match rx.recv_timeout(SIGNAL_POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("Console closed, running until signalled");
                console_open = false;
                continue;
            }
        };
        match cli::parse(&line) {
            Ok(None) => {}
            Ok(Some(CliCommand::Quit)) => break,
            Ok(Some(CliCommand::Reload)) => reload_config(&node, &config_path),
            Ok(Some(cmd)) => print!("{}", cli::execute(&node, &cmd)),
            Err(e) => println!("{}", e),
        }
    }

    node.shutdown();
    log::info!("DUNDi server stopped");
    Ok(())
}

fn reload_config(node: &Dundi, path: &str) {
    match Config::from_file(path) {
        Ok(config) => {
            if let Err(e) = node.reload(&config) {
                log::error!("Reload failed: {}", e);
            }
        }
        Err(e) => log::error!("Unable to read {}: {}", path, e),
    }
}
