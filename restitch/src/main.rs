// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use restitch::config::Config;
use restitch::engine::{Engine, HttpSender, ReqwestHttpSender};
use restitch::proxy::{build_router, AppState};

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "restitch", about = "Truncation-hiding reverse proxy for LLM streaming APIs")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_max_level(if config.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        upstream = %config.upstream_base,
        max_retries = config.max_retries,
        "restitch starting"
    );

    let http: Arc<dyn HttpSender> = Arc::new(ReqwestHttpSender::new(reqwest::Client::new()));
    let engine = Arc::new(Engine::new(config.clone(), http.clone()));
    let app = build_router(AppState {
        config,
        engine,
        http,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "restitch listening");

    axum::serve(listener, app).await.expect("server error");
}
