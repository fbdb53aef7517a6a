//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--config engine.json] [--host 0.0.0.0] [--port 22001]
//!                                 [--workers 4] [--tick-hz 50]
//!
//! Console commands:
//!   status  - Show clients and objects
//!   pause   - Stop the demo spin
//!   resume  - Restart the demo spin
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use engine_server::ServerGameState;
use engine_shared::{
    config::EngineConfig,
    event::{Event, EventSubType},
    runtime::Runtime,
};
use tokio::sync::mpsc;
use tracing::{error, info};

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => EngineConfig::load(&PathBuf::from(&args[i + 1]))?,
        _ => EngineConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" if i + 1 < args.len() => {
                cfg.host = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().context("parse --port")?;
                i += 2;
            }
            "--workers" if i + 1 < args.len() => {
                cfg.worker_threads = args[i + 1].parse().context("parse --workers")?;
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(50);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(host = %cfg.host, port = cfg.port, tick_hz = cfg.tick_hz, "Starting server");

    let rt = Runtime::new(cfg).context("create runtime")?;
    rt.start()?;

    let server = ServerGameState::new();
    if let Err(e) = rt.enter_state(server.clone()) {
        error!(error = %format!("{e:#}"), "Server failed to start");
        rt.shutdown();
        return Err(e);
    }

    // Spawn stdin reader thread.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    if let Some(addr) = server.local_addr() {
        println!("Server ready on {addr}. Type 'status' for info, 'quit' to exit.");
    }
    println!();

    while let Some(line) = console_rx.blocking_recv() {
        match line.as_str() {
            "status" => status(&rt, &server),
            "pause" => rt.publish(Event::signal(EventSubType::StateRunPause)),
            "resume" => rt.publish(Event::signal(EventSubType::StateRunStart)),
            "quit" | "exit" => break,
            other => println!("Unknown command: {other}"),
        }
    }

    info!("Shutting down");
    rt.shutdown();
    Ok(())
}

fn status(rt: &Runtime, server: &Arc<ServerGameState>) {
    println!(
        "clients: {}  objects: {}  paused: {}  queued events: {}  queued tasks: {}",
        server.client_count(),
        server.objects().len(),
        server.is_paused(),
        rt.events().event_count(),
        rt.tasks().task_count(),
    );
}
