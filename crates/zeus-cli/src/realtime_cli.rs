use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio::sync::mpsc;
use tracing::{info, warn};
use zeus_session::Session;
use zeus_session::ws::{ConnectionState, EventKey, SessionEvent};

const LIFECYCLE_EVENTS: [EventKey; 6] = [
    EventKey::Connect,
    EventKey::Disconnect,
    EventKey::Reconnecting,
    EventKey::Reconnect,
    EventKey::Error,
    EventKey::AuthError,
];

#[derive(Args)]
pub struct ListenArgs {
    /// Event names to print, comma separated
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = vec!["message".to_string(), "system_status".to_string(), "status_update".to_string()]
    )]
    pub events: Vec<String>,
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

pub async fn listen(session: &Session, args: ListenArgs) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
    for name in &args.events {
        let tx = tx.clone();
        session
            .events()
            .add_listener(EventKey::parse(name.trim()), move |event| {
                let _ = tx.send(event.clone());
            });
    }
    for key in LIFECYCLE_EVENTS {
        session.events().add_listener(key, |event| {
            info!(?event, "connection event");
        });
    }

    let mut unauthorized = session.unauthorized();
    let mut state = session.ws().subscribe_state();
    session
        .connect_realtime()
        .await
        .context("could not open the realtime connection")?;
    info!(client_id = ?session.ws().client_id(), "listening");

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state.borrow_and_update() == ConnectionState::Error {
                    let reason = session
                        .ws()
                        .last_error()
                        .unwrap_or_else(|| "unknown error".to_string());
                    bail!("realtime connection failed: {reason}");
                }
            }
            reason = unauthorized.recv() => {
                if let Ok(reason) = reason {
                    warn!(?reason, "session ended");
                }
                bail!("session is no longer authorized; run `zeus login`");
            }
            _ = tokio::signal::ctrl_c() => break,
            () = &mut deadline => break,
        }
    }
    Ok(())
}
