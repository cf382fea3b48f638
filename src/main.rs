mod config;

use clap::Parser as _;
use config::{Config, TunnelKind};
use hordegate::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    params::builtin_defaults,
    settings::HordeDefaults,
    tunnel::{CloudflaredOptions, CloudflaredTunnel, TunnelSupervisor},
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting Horde gateway with config: {:?}", config);

    let defaults = match &config.defaults_file {
        Some(path) => HordeDefaults::from_file(path).await?,
        None => HordeDefaults {
            params: builtin_defaults(),
            ..Default::default()
        },
    };

    let app_state = AppState::new(config.horde_settings(defaults), config.client_settings());
    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("{}:{}", config.host, config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Horde gateway listening on {}", bind_addr);

    let mut tunnel = match config.tunnel {
        TunnelKind::None => None,
        TunnelKind::Cloudflared => {
            let options = CloudflaredOptions::builder()
                .local_url(format!("http://{bind_addr}"))
                .maybe_token(config.cloudflared_token.clone())
                .log_file(config.tunnel_log_file.clone())
                .build();
            let mut tunnel = CloudflaredTunnel::new(options);
            match tunnel.start().await {
                Ok(()) => Some(tunnel),
                Err(e) => {
                    warn!("Tunnel could not be started, serving locally only: {}", e);
                    None
                }
            }
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tunnel) = tunnel.as_mut()
        && let Err(e) = tunnel.terminate().await
    {
        error!("Failed to terminate tunnel: {}", e);
    }
    info!("Horde gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
