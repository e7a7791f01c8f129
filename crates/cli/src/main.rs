mod cli;
mod config;
mod host;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use host::CliHost;
use rtpbridge_core::SessionManager;
use rtpbridge_protocol::{Jsep, Request, SessionHandle};
use serde::Deserialize;
use tracing::{error, info, warn};

/// One line of stdin input: a lifecycle or request downcall the embedding
/// host would normally make directly through function calls.
#[derive(Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Line {
    CreateSession {
        handle: SessionHandle,
    },
    DestroySession {
        handle: SessionHandle,
    },
    QuerySession {
        handle: SessionHandle,
    },
    Request {
        handle: SessionHandle,
        transaction: String,
        request: Request,
        #[serde(default)]
        jsep: Option<Jsep>,
    },
    /// Host downcall: relay one base64-encoded RTP packet toward the peer.
    IncomingRtp {
        handle: SessionHandle,
        is_video: bool,
        payload: String,
    },
    /// Host downcall: relay one base64-encoded RTCP compound packet toward
    /// the peer.
    IncomingRtcp {
        handle: SessionHandle,
        is_video: bool,
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = config::load_config(&args.config)?;

    std::fs::create_dir_all(&args.record_dir)
        .with_context(|| format!("failed to create record directory: {}", args.record_dir.display()))?;

    let host = Arc::new(CliHost {
        record_dir: args.record_dir,
        events_enabled: config.events,
    });
    let manager = SessionManager::new(&config, host);

    info!("rtpbridge-cli ready, reading newline-delimited JSON from stdin");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read line from stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: Line = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("ignoring malformed input line: {e}");
                continue;
            }
        };

        match parsed {
            Line::CreateSession { handle } => manager.create_session(handle),
            Line::DestroySession { handle } => manager.destroy_session(handle),
            Line::QuerySession { handle } => {
                let query = manager.query_session(handle);
                println!("{}", serde_json::to_string(&query).unwrap());
            }
            Line::Request {
                handle,
                transaction,
                request,
                jsep,
            } => {
                let result = manager.handle_message(handle, transaction.clone(), request, jsep).await;
                if let Err(e) = result {
                    error!(%handle, %transaction, "request rejected: {e}");
                    println!("{}", serde_json::to_string(&e.to_envelope()).unwrap());
                }
            }
            Line::IncomingRtp { handle, is_video, payload } => match base64::engine::general_purpose::STANDARD.decode(&payload) {
                Ok(bytes) => manager.incoming_rtp(handle, is_video, &bytes).await,
                Err(e) => warn!(%handle, "ignoring incoming_rtp with malformed base64 payload: {e}"),
            },
            Line::IncomingRtcp { handle, is_video, payload } => match base64::engine::general_purpose::STANDARD.decode(&payload) {
                Ok(bytes) => manager.incoming_rtcp(handle, is_video, &bytes).await,
                Err(e) => warn!(%handle, "ignoring incoming_rtcp with malformed base64 payload: {e}"),
            },
        }
    }

    Ok(())
}
