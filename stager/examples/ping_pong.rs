//! Two stages passing a ball back and forth until a 5 second deadline.
//!
//! Run with `cargo run -p stager --example ping_pong`. Pong lives in the later
//! stage, so it shuts down (taking a second to do so) before ping is cancelled.

use async_trait::async_trait;
use stager::prelude::*;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Ping {
    serve: mpsc::Sender<()>,
    receive: mpsc::Receiver<()>,
}

#[async_trait]
impl Task for Ping {
    async fn run(mut self: Box<Self>, token: CancellationToken) -> TaskResult {
        info!("Starting ping");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                ball = self.receive.recv() => if ball.is_none() { break },
            }
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            info!("ping");
            tokio::select! {
                () = token.cancelled() => break,
                sent = self.serve.send(()) => if sent.is_err() { break },
            }
        }
        info!("Shutting down ping");
        Ok(())
    }
}

struct Pong {
    serve: mpsc::Sender<()>,
    receive: mpsc::Receiver<()>,
}

#[async_trait]
impl Task for Pong {
    async fn run(mut self: Box<Self>, token: CancellationToken) -> TaskResult {
        info!("Starting pong");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                sent = self.serve.send(()) => if sent.is_err() { break },
            }
            tokio::select! {
                () = token.cancelled() => break,
                ball = self.receive.recv() => if ball.is_none() { break },
            }
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            info!("pong");
        }
        info!("Shutting down pong - sleeping 1 second");
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (to_pong, from_ping) = mpsc::channel(1);
    let (to_ping, from_pong) = mpsc::channel(1);

    let mut stager = Stager::with_config(StagerConfig::new().with_name("ping-pong"));
    let ping = stager.next_named_stage("ping");
    let pong = stager.next_named_stage("pong");

    let launched = ping
        .go_task(Ping {
            serve: to_pong,
            receive: from_pong,
        })
        .and_then(|()| {
            pong.go_task(Pong {
                serve: to_ping,
                receive: from_ping,
            })
        });
    if let Err(err) = launched {
        tracing::error!(error = %err, "Failed to launch tasks");
        std::process::exit(1);
    }

    let deadline = CancellationToken::with_timeout(Duration::from_secs(5));
    if let Err(err) = stager.run(&deadline).await {
        tracing::error!(error = %err, "Stager failed");
        std::process::exit(1);
    }
    info!("Exiting main");
}
