mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use ws_relay::{Relay, RelayConfig};

use crate::cli::Cli;
use crate::config::{Config, ConfigSource, LogFormat};

fn init_tracing(cfg: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    match cfg.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init(),
    }
}

/// Resolve once ctrl-c or (on Unix) SIGTERM arrives.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler; only ctrl-c will stop the relay");
                let _ = ctrl_c.await;
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT (ctrl-c)");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args, load config, merge overrides.
    let cli = Cli::parse();
    let (mut cfg, source) = config::load(&cli.config)?;
    cfg.apply_cli(&cli);
    cfg.validate().context("invalid configuration")?;

    // 2. Logging.
    init_tracing(&cfg);

    if source == ConfigSource::Defaults {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.listen_addr(),
        ping_interval_secs = cfg.liveness.interval_secs,
        "rendezvous starting"
    );

    // 3. Optional audit trail.
    let audit = match &cfg.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .context("failed to start audit logger")?;
            info!(path = %path.display(), "audit log enabled");
            Some((sink, handle))
        }
        None => None,
    };
    let audit_sink = audit.as_ref().map(|(sink, _)| sink.clone());

    if let Some(sink) = &audit_sink {
        sink.log(AuditEntry::new(
            AuditEventType::ProcessStarted,
            AuditSource::new("rendezvous"),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "listen": cfg.listen_addr().to_string(),
            }),
        ))
        .await;
    }

    // 4. Shutdown signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    // 5. Bind and run the relay.
    let relay = Relay::bind(RelayConfig {
        listen_addr: cfg.listen_addr(),
        ping_interval: cfg.ping_interval(),
        send_queue: cfg.connection.send_queue,
        audit: audit_sink.clone(),
    })
    .await
    .context("failed to start relay")?;

    let result = relay.run(shutdown_rx).await;

    // 6. Shut down: record the outcome and flush the audit trail.
    info!("rendezvous shutting down");

    if let Some((sink, handle)) = audit {
        sink.log(AuditEntry::new(
            AuditEventType::ProcessStopped,
            AuditSource::new("rendezvous"),
            serde_json::json!({ "result": format!("{:?}", result) }),
        ))
        .await;
        drop(sink);
        drop(audit_sink);
        // Connection tasks still hold sink clones until the runtime stops,
        // so the final flush is bounded.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
    }

    result
}
