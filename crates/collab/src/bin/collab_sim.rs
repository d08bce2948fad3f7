//! Run several sessions over an in-memory hub and check they converge.
//!
//! Usage: `collab-sim [sites] [chars-per-site]`. Set `RUST_LOG=collab=debug`
//! to watch the protocol.

use collab::session::{SessionConfig, SessionEvent, SyncSession};
use collab::site::SiteId;
use collab::transport::{MemoryHub, MemoryTransport};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

fn parse_arg(args: &[String], index: usize, default: usize) -> usize {
    args.get(index)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let site_count = parse_arg(&args, 1, 3).max(1);
    let chars_per_site = parse_arg(&args, 2, 20);

    tracing::info!(
        "Starting simulation with {} sites, {} characters each",
        site_count,
        chars_per_site
    );

    // The simulator never reads the frame log
    let hub = MemoryHub::with_log_capacity(0);
    let config = SessionConfig::default()
        .with_heartbeat_interval_ms(200)
        .with_heartbeat_timeout_ms(100)
        .with_resync_interval_ms(500)
        .with_backoff_ms(50, 400);

    let mut sessions: Vec<SyncSession<MemoryTransport>> = Vec::new();
    for i in 0..site_count {
        let site = format!("site-{i}");
        let (session, mut events) =
            SyncSession::new(site.as_str(), format!("user-{i}"), hub.transport(site.as_str()), config.clone());

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::StatusChanged(status) => {
                        tracing::info!("{}: status {}", site, status)
                    }
                    SessionEvent::UserJoined(user) => {
                        tracing::info!("{}: {} joined", site, user.site_id)
                    }
                    SessionEvent::Error(e) => tracing::warn!("{}: {}", site, e),
                    _ => {}
                }
            }
        });

        session.connect();
        sessions.push(session);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    for round in 0..chars_per_site {
        for (i, session) in sessions.iter().enumerate() {
            let ch = char::from(ALPHABET[(i + round) % ALPHABET.len()]);
            // Mix prepends, appends and middle inserts
            let index = match round % 3 {
                0 => 0,
                1 => session.len(),
                _ => session.len() / 2,
            };
            session.insert(index, ch);
            if round % 5 == 4 {
                session.delete(session.len() / 3);
            }
        }

        // Knock one site offline for a while so it has to resync
        if round == chars_per_site / 2 {
            let victim = SiteId::new("site-0");
            tracing::info!("Dropping connection of {}", victim);
            hub.drop_connection(&victim);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Give the periodic resync time to heal everything
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let texts: Vec<String> = sessions.iter().map(|s| s.text()).collect();
    for (session, text) in sessions.iter().zip(&texts) {
        tracing::info!("{} ({}): {:?}", session.site_id(), session.status(), text);
    }

    for session in &sessions {
        session.disconnect().await;
    }

    if texts.windows(2).all(|pair| pair[0] == pair[1]) {
        tracing::info!("All {} sites converged on {} characters", site_count, texts[0].chars().count());
        ExitCode::SUCCESS
    } else {
        tracing::error!("Sites diverged");
        ExitCode::FAILURE
    }
}
