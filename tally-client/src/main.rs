// Tally client: reads one JSON request per stdin line, runs each through the
// handshake, and prints outcomes and confirmed pushes to stdout.

mod client;
mod config;
mod listener;
mod logging;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tally_core::{Coordinator, Delivery, Message, Outcome, Registry, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use client::{Client, ClientError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("tally-client {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    logging::init_logging(&cfg.log_level, cfg.log_format);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new());
    let session = Arc::new(Session::new(cfg.session_action.clone()));
    let mut coordinator = Coordinator::new(registry.clone(), session);
    coordinator.set_inbound_ttl(cfg.inbound_ttl());

    let client = Client::connect(&cfg, Arc::new(coordinator))
        .await
        .with_context(|| format!("connecting to {}", cfg.server()))?;
    let client = Arc::new(client);
    info!(
        server = %client.server(),
        local = ?client.socket().local_addr().ok(),
        version = VERSION,
        "client ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel();
    let mut listener_task = tokio::spawn(listener::run_listener(
        client.socket().clone(),
        client.coordinator().clone(),
        deliver_tx,
        shutdown_rx.clone(),
    ));
    let sweeper = tokio::spawn(listener::run_sweeper(
        registry.clone(),
        cfg.sweep_interval(),
        shutdown_rx,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submissions: JoinSet<(String, Result<Outcome, ClientError>)> = JoinSet::new();
    let mut stdin_open = true;
    let mut listener_result = None;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!(error = %e, "signal handler failed");
                }
                info!("shutdown requested");
                break;
            }
            res = &mut listener_task => {
                listener_result = Some(res);
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => submit_line(&mut submissions, &client, &line),
                Ok(None) => {
                    stdin_open = false;
                    if submissions.is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    stdin_open = false;
                    if submissions.is_empty() {
                        break;
                    }
                }
            },
            Some(delivery) = deliver_rx.recv() => print_delivery(&delivery),
            Some(joined) = submissions.join_next() => {
                match joined {
                    Ok((action, result)) => print_outcome(&action, &result),
                    Err(e) => error!(error = %e, "submission task failed"),
                }
                if !stdin_open && submissions.is_empty() {
                    break;
                }
            }
        }
    }

    // Wake every waiter and refuse new registrations, then let the submissions
    // report before the loops stop.
    registry.clear();
    while let Some(joined) = submissions.join_next().await {
        if let Ok((action, result)) = joined {
            print_outcome(&action, &result);
        }
    }
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    let listener_result = match listener_result {
        Some(res) => res,
        None => listener_task.await,
    };
    while let Ok(delivery) = deliver_rx.try_recv() {
        print_delivery(&delivery);
    }
    listener_result
        .context("listener task panicked")?
        .context("listener failed")?;
    info!("client stopped");
    Ok(())
}

fn submit_line(
    submissions: &mut JoinSet<(String, Result<Outcome, ClientError>)>,
    client: &Arc<Client>,
    line: &str,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let msg: Message = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "input line is not a message object");
            return;
        }
    };
    let client = client.clone();
    submissions.spawn(async move {
        let result = client.submit(&msg).await;
        (msg.action, result)
    });
}

fn outcome_json(action: &str, result: &Result<Outcome, ClientError>) -> Value {
    match result {
        Ok(Outcome::Acknowledged { data }) => {
            json!({ "action": action, "outcome": "acknowledged", "data": data })
        }
        Ok(Outcome::Rejected { status, reason }) => {
            json!({ "action": action, "outcome": "rejected", "status": status, "reason": reason })
        }
        Ok(Outcome::TimedOut) => json!({ "action": action, "outcome": "timed_out" }),
        Err(e) => json!({ "action": action, "outcome": "local_error", "reason": e.to_string() }),
    }
}

fn print_outcome(action: &str, result: &Result<Outcome, ClientError>) {
    println!("{}", outcome_json(action, result));
}

fn print_delivery(d: &Delivery) {
    let content = serde_json::from_str::<Value>(&d.text)
        .unwrap_or_else(|_| Value::String(d.text.to_string()));
    println!(
        "{}",
        json!({ "delivered": d.action, "transaction_id": d.transaction_id, "message": content })
    );
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Status;

    #[test]
    fn outcome_lines() {
        let v = outcome_json("get_rooms", &Ok(Outcome::TimedOut));
        assert_eq!(v["outcome"], "timed_out");

        let v = outcome_json(
            "login",
            &Ok(Outcome::Rejected {
                status: Status::Cancelled,
                reason: "mismatch".into(),
            }),
        );
        assert_eq!(v["status"], "cancelled");
        assert_eq!(v["reason"], "mismatch");

        let v = outcome_json("x", &Err(ClientError::Closed));
        assert_eq!(v["outcome"], "local_error");
    }
}
