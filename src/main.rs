//! Headless Endpunkt
//!
//! Aufruf: `relaycall <identity> <password> [target] [--video]`
//! Identität und Passwort können auch über `RELAYCALL_IDENTITY` und
//! `RELAYCALL_PASSWORD` kommen.

use anyhow::{bail, Context, Result};
use relaycall::audio_route::{HostAudioHardware, NoBluetooth};
use relaycall::call_engine::{MediaEngine, WebRtcMediaEngine};
use relaycall::signaling::{login, MediaKind, SignalingTransport, WebSocketRelay};
use relaycall::{init_logging, CallEvent, Config, Endpoint};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

struct Args {
    identity: String,
    password: String,
    target: Option<String>,
    kind: MediaKind,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut kind = MediaKind::Audio;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--video" => kind = MediaKind::Video,
            flag if flag.starts_with("--") => bail!("Unknown flag: {}", flag),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let identity = positional
        .next()
        .or_else(|| std::env::var("RELAYCALL_IDENTITY").ok())
        .context("Missing identity")?;
    let password = positional
        .next()
        .or_else(|| std::env::var("RELAYCALL_PASSWORD").ok())
        .context("Missing password")?;

    Ok(Args {
        identity,
        password,
        target: positional.next(),
        kind,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load config")?;
    init_logging(config.log_filter());
    let args = parse_args()?;

    let relay = WebSocketRelay::connect(&config.relay_url)
        .await
        .context("Failed to connect to relay")?;
    let transport: Arc<dyn SignalingTransport> = relay;

    login(transport.as_ref(), &args.identity, &args.password)
        .await
        .context("Login failed")?;

    let ice_servers = config.ice_servers.clone();
    let (endpoint, handle) = Endpoint::new(
        &args.identity,
        &config,
        Arc::clone(&transport),
        move |control_tx| {
            Box::new(WebRtcMediaEngine::new(&ice_servers, control_tx)) as Box<dyn MediaEngine>
        },
        Box::new(HostAudioHardware::new()),
        Box::new(NoBluetooth),
    );

    let mut events = handle.subscribe();
    let task = endpoint.spawn()?;

    if let Some(target) = &args.target {
        handle.place_call(target, args.kind).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(CallEvent::CallReceived { sender, kind }) => {
                    tracing::info!("Incoming {:?} call from {}", kind, sender);
                    if let Err(e) = handle.accept().await {
                        tracing::warn!("Failed to accept call: {}", e);
                    }
                }
                Ok(event) => tracing::info!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    task.await.context("Endpoint task failed")?;
    Ok(())
}
