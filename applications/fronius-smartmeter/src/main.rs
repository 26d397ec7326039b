use anyhow::Context;
use clap::Parser;
use fronius_smartmeter::acquire::{Acquirer, MeterTarget};
use fronius_smartmeter::bus::{mqtt, BusDirectory, BusSnapshot, ObjectTree};
use fronius_smartmeter::cli::Args;
use fronius_smartmeter::discovery::{self, CONNECTION_PATH, FIRMWARE_PATH};
use fronius_smartmeter::model::ModelCatalog;
use fronius_smartmeter::role::DeviceIdentity;
use fronius_smartmeter::service::{self, ServiceInfo};
use fronius_smartmeter::{AppError, Config, Poller};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(config = %args.config.display(), service = %cfg.service.name, "loaded config");

    let (target, firmware) = resolve_target(&args, &cfg).await?;
    info!(%target, "using meter");

    let acquirer = Acquirer::for_target(
        target,
        cfg.meter.request_timeout(),
        cfg.meter.fixture_path.as_deref(),
    )?;
    let mut poller = Poller::new(
        acquirer,
        ModelCatalog::from_config(&cfg.meter),
        cfg.meter.max_consecutive_failures,
    );
    let first = poller.prime().await.context("initial meter reading failed")?;

    let tree = Arc::new(ObjectTree::new(cfg.service.name.clone()));
    let identity = Arc::new(DeviceIdentity::new(
        cfg.service.role,
        cfg.service.device_instance,
    ));
    let info = ServiceInfo {
        connection: target.to_string(),
        product_id: cfg.service.product_id,
        product_name: first
            .product_name()
            .unwrap_or_else(|| "Fronius Smart Meter".into()),
        firmware,
        serial: first.details.serial.clone(),
    };
    service::register(&tree, &info, identity.clone(), poller.sample());
    poller.attach(tree.clone());
    info!(
        identity = %identity.identity(),
        product = %info.product_name,
        "service registered"
    );

    if let Some(mqtt_cfg) = cfg.mqtt.clone() {
        let tree = tree.clone();
        tokio::spawn(async move {
            if let Err(e) = mqtt::run_binding(tree, mqtt_cfg).await {
                error!(error = %e, "MQTT binding stopped");
            }
        });
    }

    match poller.run(cfg.meter.poll_interval(), shutdown_signal()).await {
        Ok(()) => Ok(()),
        Err(AppError::RetriesExceeded { consecutive }) => {
            error!(consecutive, "exiting after repeated poll failures");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// CLI flag, then config, then discovery. Returns the firmware version when
/// discovery found one.
async fn resolve_target(
    args: &Args,
    cfg: &Config,
) -> Result<(MeterTarget, Option<String>), anyhow::Error> {
    if let Some(target) = args.ip {
        return Ok((target, None));
    }
    if let Some(ip) = &cfg.meter.ip {
        let target = ip
            .parse::<MeterTarget>()
            .map_err(|e| anyhow::anyhow!("meter.ip: {e}"))?;
        return Ok((target, None));
    }

    let snapshot = match &cfg.mqtt {
        Some(mqtt_cfg) => {
            match mqtt::introspect(
                mqtt_cfg,
                &[CONNECTION_PATH, FIRMWARE_PATH],
                cfg.discovery.bus_settle(),
            )
            .await
            {
                Ok(snap) => Some(snap),
                Err(e) => {
                    warn!(error = %e, "bus introspection failed; falling back to broadcast");
                    None
                }
            }
        }
        None => None,
    };

    let found = discovery::resolve(
        &cfg.discovery,
        snapshot.as_ref().map(|s: &BusSnapshot| s as &dyn BusDirectory),
    )
    .await
    .context("meter discovery failed")?;
    Ok((MeterTarget::Address(found.address), found.firmware))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
