//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--config engine.json] [--host 127.0.0.1] [--port 22001]
//!                                 [--workers 2] [--tick-hz 50]
//!
//! The client connects to the server, mirrors its scene and draws it through
//! the headless renderer.
//!
//! Console commands:
//!   status              - Show client status
//!   ping                - Send PING to the server
//!   spawn <x> <y> <z>   - Ask the server to create an entity
//!   resize <w> <h>      - Inject a window resize
//!   pause / resume      - Pause or resume the server's run state
//!   quit                - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use engine_client::{client::ClientGameState, input::InputEvent};
use engine_shared::{
    config::EngineConfig,
    event::{Event, EventSubType, ObjectEvent},
    math::Vec3,
    runtime::Runtime,
    scene::{Entity, SceneObject},
};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::info;

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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(host = %cfg.host, port = cfg.port, "Starting client");

    let rt = Runtime::new(cfg).context("create runtime")?;
    rt.start()?;

    let client = ClientGameState::new();
    if let Err(e) = rt.enter_state(client.clone()) {
        rt.shutdown();
        return Err(e);
    }

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
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

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    loop {
        match console_rx.try_recv() {
            Ok(line) => {
                if line == "quit" || line == "exit" {
                    break;
                }
                if let Err(e) = exec_console(&client, &line) {
                    println!("Error: {e:#}");
                }
            }
            Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(20)),
            Err(TryRecvError::Disconnected) => break,
        }

        if client.is_closed() {
            println!("Disconnected from server.");
            break;
        }
    }

    rt.shutdown();
    Ok(())
}

fn exec_console(client: &ClientGameState, line: &str) -> anyhow::Result<()> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(());
    };
    let args: Vec<&str> = parts.collect();

    match (cmd, args.as_slice()) {
        ("status", _) => println!(
            "state: {}  objects: {}  frames: {}  pongs: {}",
            client.state(),
            client.objects().len(),
            client.frames(),
            client.pongs(),
        ),
        ("ping", _) => client.ping()?,
        ("spawn", [x, y, z]) => {
            let mut entity = Entity {
                mesh: "cube".into(),
                ..Entity::default()
            };
            entity.node.position = Vec3::new(x.parse()?, y.parse()?, z.parse()?);
            let obj = SceneObject::Entity(entity);
            client.send(&Event::object(ObjectEvent::Create {
                object_type: obj.object_type().as_u8(),
                fields: obj.serialize(&[]),
            }))?;
        }
        ("resize", [w, h]) => {
            client.input().inject(&InputEvent::Resize {
                width: w.parse()?,
                height: h.parse()?,
            })?;
        }
        ("pause", _) => client.send(&Event::signal(EventSubType::StateRunPause))?,
        ("resume", _) => client.send(&Event::signal(EventSubType::StateRunStart))?,
        _ => println!("Unknown command: {line}"),
    }
    Ok(())
}
