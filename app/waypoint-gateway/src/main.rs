//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Main binary for Waypoint Gateway
//!
//! Exit codes: 0 after a normal shutdown, 1 on configuration errors,
//! 2 when the coordination store is unreachable at startup.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waypoint_gateway::{
    config::GatewayConfig, shutdown_gateway, ErrorCategory, GatewayError, WaypointGateway,
    GATEWAY_NAME, GATEWAY_VERSION,
};

/// Selects the log output format; `json` or anything else for text
const LOG_FORMAT_ENV: &str = "WAYPOINT_LOG_FORMAT";

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE_UNREACHABLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!("Starting {} v{}", GATEWAY_NAME, GATEWAY_VERSION);

    // Load configuration
    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!("Configuration loaded successfully");

    // Initialize gateway
    let gateway = match WaypointGateway::create(config.clone()) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("Failed to initialize gateway: {}", e);
            return exit_code_for(&e);
        }
    };

    // Start gateway
    if let Err(e) = gateway.start().await {
        error!("Failed to start gateway: {}", e);
        return exit_code_for(&e);
    }
    info!("Gateway started successfully");

    let addr = config.gateway.bind_address();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            if let Err(e) = shutdown_gateway(&gateway).await {
                error!("Shutdown failed: {}", e);
            }
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!("Starting HTTP server on {}", addr);

    let app = gateway.router();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(gateway.clone()));

    let mut exit = ExitCode::SUCCESS;
    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
        exit = ExitCode::FAILURE;
    }

    if let Err(e) = shutdown_gateway(&gateway).await {
        error!("Shutdown failed: {}", e);
        exit = ExitCode::FAILURE;
    }

    info!("Gateway shutdown completed");
    exit
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn exit_code_for(err: &GatewayError) -> ExitCode {
    match err.category() {
        ErrorCategory::StoreUnavailable => ExitCode::from(EXIT_STORE_UNREACHABLE),
        _ => ExitCode::from(EXIT_CONFIG),
    }
}

/// Graceful shutdown signal handler. Cancels upstream calls and probes as
/// soon as the signal arrives, so the server drain is not held up by them.
async fn shutdown_signal(gateway: Arc<WaypointGateway>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }

    gateway.begin_shutdown();
}
