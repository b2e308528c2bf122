//! Streamable HTTP MCP server with resumable notification streams.
//!
//! Run with: cargo run -p notification-server -- --port 3000
//!
//! Clients POST JSON-RPC to `/mcp`, open a standalone stream with GET, and
//! resume a dropped stream by sending `Last-Event-ID`.

mod engine;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use mcp_stream_transport::{
    BearerTokenAuthorizer, MCP_PATH, ServerConfig, ServerContext, TransportConfig, router,
    router_with_authorizer,
};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::engine::NotificationEngine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Answer POSTs with a JSON body instead of an SSE stream
    #[arg(long)]
    json_response: bool,

    /// Events retained per stream for resumption
    #[arg(long, default_value_t = mcp_stream_core::DEFAULT_MAX_EVENTS_PER_STREAM)]
    max_events_per_stream: usize,

    /// Do not record events; `Last-Event-ID` is then ignored
    #[arg(long)]
    no_resumability: bool,

    /// Reject requests without an `Authorization: Bearer` header
    #[arg(long)]
    require_bearer: bool,

    /// Only accept this bearer token (implies --require-bearer)
    #[arg(long, env = "BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Seconds to wait for sessions to stop on shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .init();

    let config = ServerConfig {
        transport: TransportConfig {
            json_response: args.json_response,
            ..TransportConfig::default()
        },
        max_events_per_stream: args.max_events_per_stream,
        enable_resumability: !args.no_resumability,
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
    };
    let ctx = Arc::new(ServerContext::new(Arc::new(NotificationEngine), config));
    ctx.start().context("failed to start task supervisor")?;

    let mcp = match (args.bearer_token, args.require_bearer) {
        (Some(token), _) => {
            router_with_authorizer(Arc::clone(&ctx), Arc::new(BearerTokenAuthorizer::new(token)))
        }
        (None, true) => {
            router_with_authorizer(Arc::clone(&ctx), Arc::new(BearerTokenAuthorizer::any()))
        }
        (None, false) => router(Arc::clone(&ctx)),
    };
    let app = mcp
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        json_response = args.json_response,
        resumable = !args.no_resumability,
        "Listening on http://{addr}{MCP_PATH}"
    );

    let shutdown_ctx = Arc::clone(&ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open SSE streams only end once their sessions are closed.
            shutdown_ctx.shutdown().await;
        })
        .await
        .context("server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
