mod command;
mod config;
mod engine;
mod event;
mod hotkey;
mod paths;
mod sessions;
mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::command::ShellCommandRunner;
use crate::engine::DuckingEngine;
use crate::sessions::WasapiSessionProvider;

#[tokio::main]
async fn main() {
    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        eprintln!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Configuration (fatal on error — no defaults beyond the template) ──────
    let config_path = paths::config_file_path();
    let initial_config = match config::load_or_init(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[config] Fatal: {e:#}");
            std::process::exit(1);
        }
    };
    let initial_hotkey = initial_config.general.bypass_hotkey.clone();

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path();
    status::write_status(&status_path, &status::DaemonStatus::new());

    // ── Audio session provider ────────────────────────────────────────────────
    let provider = match WasapiSessionProvider::new() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[sessions] Fatal: {e:#}");
            std::process::exit(1);
        }
    };

    // ── Shared signals and channels ───────────────────────────────────────────
    let bypassed = Arc::new(AtomicBool::new(false));
    let (config_tx, config_rx) = watch::channel(initial_config.clone());
    let (stop_tx, stop_rx) = watch::channel(false);
    let (event_tx, mut event_rx) = mpsc::channel::<event::DaemonEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));
    let hotkey_handle = hotkey::start(initial_hotkey.as_deref(), event_tx.clone());

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(event::DaemonEvent::Shutdown).await;
            }
        });
    }

    println!("autoduck-daemon v{} started", env!("CARGO_PKG_VERSION"));
    println!(
        "[engine] Controlling {}",
        initial_config.general.controlled_executable
    );

    let engine = DuckingEngine::new(
        provider,
        ShellCommandRunner,
        initial_config,
        Arc::clone(&bypassed),
    );
    let mut engine_task = tokio::spawn(engine.run(config_rx, stop_rx, status_path.clone()));

    // ── Event loop ────────────────────────────────────────────────────────────
    // Runs until the engine task finishes, which it does after a quit request
    // or a fatal tick error (in both cases after its best-effort restore).
    let engine_result = loop {
        tokio::select! {
            result = &mut engine_task => break result,
            maybe_event = event_rx.recv() => {
                let Some(evt) = maybe_event else { continue };
                match evt {
                    event::DaemonEvent::ConfigReloaded(new_config) => {
                        println!("[config] Reloaded");
                        hotkey_handle
                            .update_key(new_config.general.bypass_hotkey.as_deref().unwrap_or(""));
                        let _ = config_tx.send(new_config);
                    }
                    event::DaemonEvent::BypassToggleRequested => {
                        let now = !bypassed.load(Ordering::Relaxed);
                        bypassed.store(now, Ordering::Relaxed);
                        println!(
                            "[engine] Bypass {}",
                            if now { "enabled" } else { "disabled" }
                        );
                    }
                    event::DaemonEvent::Shutdown => {
                        println!("Shutting down");
                        let _ = stop_tx.send(true);
                    }
                }
            }
        }
    };

    hotkey_handle.stop();

    match engine_result {
        Ok(Ok(())) => println!("[engine] Stopped"),
        Ok(Err(e)) => {
            eprintln!("[engine] Fatal: {e:#}");
            status::write_status(&status_path, &status::DaemonStatus::failed(format!("{e:#}")));
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("[engine] Task panicked: {e}");
            std::process::exit(1);
        }
    }
}
