use crate::acquire::Acquirer;
use crate::bus::ProcessBus;
use crate::error::AppError;
use crate::model::{ModelCatalog, NormalizedSample};
use crate::normalize::normalize;
use crate::payload::MeterData;
use crate::service::sample_values;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub consecutive: u32,
    /// Never reset
    pub lifetime: u64,
}

impl RetryState {
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive += 1;
        self.lifetime += 1;
        self.consecutive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    Failed { consecutive: u32 },
    Fatal { consecutive: u32 },
}

/// Owns all state that changes from one poll to the next.
pub struct Poller {
    acquirer: Acquirer,
    catalog: ModelCatalog,
    previous: NormalizedSample,
    retries: RetryState,
    max_failures: u32,
    bus: Option<Arc<dyn ProcessBus>>,
}

impl Poller {
    pub fn new(acquirer: Acquirer, catalog: ModelCatalog, max_failures: u32) -> Self {
        Self {
            acquirer,
            catalog,
            previous: NormalizedSample::default(),
            retries: RetryState::default(),
            max_failures,
            bus: None,
        }
    }

    /// Publish every later sample on `bus`.
    pub fn attach(&mut self, bus: Arc<dyn ProcessBus>) {
        self.bus = Some(bus);
    }

    pub fn sample(&self) -> &NormalizedSample {
        &self.previous
    }

    pub fn retries(&self) -> RetryState {
        self.retries
    }

    /// The first cycle, run before the service exists. Its payload supplies
    /// the product name and serial; a failure here is not retried.
    pub async fn prime(&mut self) -> Result<MeterData, AppError> {
        let data = self.poll_once().await?;
        info!(
            model = data.model().unwrap_or_default(),
            power = self.previous.power,
            "initial meter reading complete"
        );
        Ok(data)
    }

    /// acquire, normalize, publish. On error the previous sample is untouched.
    pub async fn poll_once(&mut self) -> Result<MeterData, AppError> {
        let data = self.acquirer.acquire().await?;
        let latency_ms = self.acquirer.latency().millis().unwrap_or_default();
        let sample = normalize(&data, &self.previous, latency_ms, &self.catalog)?;
        self.previous = sample;
        self.publish();
        Ok(data)
    }

    fn publish(&self) {
        let Some(bus) = &self.bus else {
            return;
        };
        for (path, value) in sample_values(&self.previous) {
            if let Err(e) = bus.set(path, value) {
                warn!(path, error = %e, "publish failed");
            }
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        match self.poll_once().await {
            Ok(_) => {
                self.retries.record_success();
                debug!(
                    power = self.previous.power,
                    latency_ms = self.previous.latency_ms,
                    update_index = self.previous.update_index,
                    "poll published"
                );
                TickOutcome::Published
            }
            Err(e) => {
                let consecutive = self.retries.record_failure();
                warn!(
                    error = %e,
                    consecutive,
                    lifetime = self.retries.lifetime,
                    "poll failed"
                );
                if consecutive >= self.max_failures {
                    TickOutcome::Fatal { consecutive }
                } else {
                    TickOutcome::Failed { consecutive }
                }
            }
        }
    }

    /// Poll every `period` until `shutdown` resolves or too many polls fail
    /// in a row. Ticks missed during a slow fetch are skipped, not queued.
    /// Shutdown is only noticed between polls, so a hanging fetch delays it
    /// by up to the request timeout.
    pub async fn run<F>(&mut self, period: Duration, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the initial cycle already ran.
        ticker.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let TickOutcome::Fatal { consecutive } = self.tick().await {
                        error!(consecutive, "meter unreachable, giving up");
                        return Err(AppError::RetriesExceeded { consecutive });
                    }
                }
            }
        }
    }
}
