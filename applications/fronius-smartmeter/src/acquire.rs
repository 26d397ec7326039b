use crate::error::{AcquisitionError, AppError, NormalizationError};
use crate::payload::MeterData;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

const BUILTIN_FIXTURE: &str = include_str!("../testdata/GetMeterRealtimeData.json");

pub fn realtime_data_url(address: Ipv4Addr) -> String {
    format!(
        "http://{address}/solar_api/v1/GetMeterRealtimeData.cgi?Scope=Device&DeviceId=0&DataCollection=MeterRealtimeData"
    )
}

/// Where telemetry comes from: a meter on the network or the canned fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterTarget {
    Address(Ipv4Addr),
    Fixture,
}

impl FromStr for MeterTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "test" {
            return Ok(MeterTarget::Fixture);
        }
        s.parse::<Ipv4Addr>()
            .map(MeterTarget::Address)
            .map_err(|_| format!("{s:?} is neither an IPv4 address nor \"test\""))
    }
}

impl fmt::Display for MeterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterTarget::Address(a) => write!(f, "{a}"),
            MeterTarget::Fixture => f.write_str("test"),
        }
    }
}

/// A response body plus the wall-clock time it took to get it.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub body: Value,
    pub elapsed: Duration,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MeterSource: Send + Sync {
    async fn fetch(&self) -> Result<RawResponse, AcquisitionError>;
}

pub struct HttpMeterSource {
    client: reqwest::Client,
    url: String,
}

impl HttpMeterSource {
    pub fn new(address: Ipv4Addr, timeout: Duration) -> Result<Self, AcquisitionError> {
        Self::with_url(realtime_data_url(address), timeout)
    }

    pub fn with_url(url: impl Into<String>, timeout: Duration) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MeterSource for HttpMeterSource {
    async fn fetch(&self) -> Result<RawResponse, AcquisitionError> {
        let started = Instant::now();
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AcquisitionError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        let elapsed = started.elapsed();
        let body = serde_json::from_slice(&bytes)?;
        Ok(RawResponse { body, elapsed })
    }
}

/// Canned payload served without any I/O and with zero latency.
pub struct FixtureMeterSource {
    body: Value,
}

impl FixtureMeterSource {
    pub fn builtin() -> Result<Self, AcquisitionError> {
        Ok(Self {
            body: serde_json::from_str(BUILTIN_FIXTURE)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AcquisitionError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self {
            body: serde_json::from_str(&raw)?,
        })
    }

    pub fn from_value(body: Value) -> Self {
        Self { body }
    }
}

#[async_trait]
impl MeterSource for FixtureMeterSource {
    async fn fetch(&self) -> Result<RawResponse, AcquisitionError> {
        Ok(RawResponse {
            body: self.body.clone(),
            elapsed: Duration::ZERO,
        })
    }
}

/// EWMA of acquisition latency: 0.9 on history, 0.1 on the new sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyEstimate {
    millis: Option<f64>,
}

impl LatencyEstimate {
    pub fn observe(&mut self, sample: Duration) -> f64 {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let next = match self.millis {
            Some(old) => 0.9 * old + 0.1 * sample_ms,
            None => sample_ms,
        };
        self.millis = Some(next);
        next
    }

    pub fn millis(&self) -> Option<f64> {
        self.millis
    }
}

/// Fetches one payload per call and keeps the latency estimate.
pub struct Acquirer {
    source: Box<dyn MeterSource>,
    latency: LatencyEstimate,
}

impl Acquirer {
    pub fn new(source: Box<dyn MeterSource>) -> Self {
        Self {
            source,
            latency: LatencyEstimate::default(),
        }
    }

    /// Build the source for `target`: HTTP against a meter, or the fixture.
    pub fn for_target(
        target: MeterTarget,
        timeout: Duration,
        fixture_path: Option<&str>,
    ) -> Result<Self, AcquisitionError> {
        let source: Box<dyn MeterSource> = match (target, fixture_path) {
            (MeterTarget::Address(a), _) => Box::new(HttpMeterSource::new(a, timeout)?),
            (MeterTarget::Fixture, Some(path)) => Box::new(FixtureMeterSource::from_file(path)?),
            (MeterTarget::Fixture, None) => Box::new(FixtureMeterSource::builtin()?),
        };
        Ok(Self::new(source))
    }

    pub fn latency(&self) -> &LatencyEstimate {
        &self.latency
    }

    /// Fetch and unwrap `Body.Data`. Latency is recorded even when the body
    /// turns out to be unusable.
    pub async fn acquire(&mut self) -> Result<MeterData, AppError> {
        let response = self.source.fetch().await?;
        let latency_ms = self.latency.observe(response.elapsed);
        debug!(latency_ms, "meter responded");

        let data = extract_data(response.body)?;
        let parsed = serde_json::from_value(data).map_err(NormalizationError::Payload)?;
        Ok(parsed)
    }
}

fn extract_data(mut body: Value) -> Result<Value, AcquisitionError> {
    let envelope = body
        .get_mut("Body")
        .ok_or(AcquisitionError::Envelope("Body"))?;
    let data = envelope
        .get_mut("Data")
        .ok_or(AcquisitionError::Envelope("Body.Data"))?;
    if !data.is_object() {
        return Err(AcquisitionError::Envelope("Body.Data object"));
    }
    Ok(data.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_parsing() {
        assert_eq!("test".parse::<MeterTarget>().unwrap(), MeterTarget::Fixture);
        assert_eq!(
            "192.168.1.20".parse::<MeterTarget>().unwrap(),
            MeterTarget::Address(Ipv4Addr::new(192, 168, 1, 20))
        );
        assert!("meter.local".parse::<MeterTarget>().is_err());
    }

    #[test]
    fn test_url() {
        assert_eq!(
            realtime_data_url(Ipv4Addr::new(10, 0, 0, 5)),
            "http://10.0.0.5/solar_api/v1/GetMeterRealtimeData.cgi?Scope=Device&DeviceId=0&DataCollection=MeterRealtimeData"
        );
    }

    #[test]
    fn test_latency_ewma() {
        let mut est = LatencyEstimate::default();
        assert_eq!(est.millis(), None);
        assert_eq!(est.observe(Duration::from_millis(100)), 100.0);
        let second = est.observe(Duration::from_millis(200));
        assert!((second - (0.9 * 100.0 + 0.1 * 200.0)).abs() < 1e-9);
        let third = est.observe(Duration::from_millis(200));
        assert!((third - (0.9 * second + 0.1 * 200.0)).abs() < 1e-9);
    }

    #[test]
    fn test_extract_data_envelope() {
        let ok = extract_data(json!({ "Body": { "Data": { "PowerReal_P_Sum": 1 } } })).unwrap();
        assert_eq!(ok, json!({ "PowerReal_P_Sum": 1 }));
        assert!(matches!(
            extract_data(json!({ "Head": {} })),
            Err(AcquisitionError::Envelope("Body"))
        ));
        assert!(matches!(
            extract_data(json!({ "Body": {} })),
            Err(AcquisitionError::Envelope("Body.Data"))
        ));
        assert!(matches!(
            extract_data(json!({ "Body": { "Data": [] } })),
            Err(AcquisitionError::Envelope(_))
        ));
    }

    #[tokio::test]
    async fn test_fixture_has_zero_latency() {
        let mut acq = Acquirer::new(Box::new(FixtureMeterSource::builtin().unwrap()));
        let data = acq.acquire().await.unwrap();
        assert_eq!(data.model(), Some("Smart Meter 63A"));
        assert_eq!(data.power_sum, Some(687.1));
        assert_eq!(acq.latency().millis(), Some(0.0));
    }

    #[tokio::test]
    async fn test_latency_recorded_even_on_bad_envelope() {
        let mut source = MockMeterSource::new();
        source.expect_fetch().times(1).returning(|| {
            Ok(RawResponse {
                body: json!({ "Head": {} }),
                elapsed: Duration::from_millis(40),
            })
        });
        let mut acq = Acquirer::new(Box::new(source));
        let err = acq.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::Acquisition(AcquisitionError::Envelope(_))));
        assert_eq!(acq.latency().millis(), Some(40.0));
    }

    #[tokio::test]
    async fn test_source_errors_propagate() {
        let mut source = MockMeterSource::new();
        source
            .expect_fetch()
            .returning(|| Err(AcquisitionError::Status(503)));
        let mut acq = Acquirer::new(Box::new(source));
        let err = acq.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::Acquisition(AcquisitionError::Status(503))));
        assert_eq!(acq.latency().millis(), None);
    }
}
