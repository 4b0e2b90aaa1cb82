//! One-shot link throughput probe
//!
//! Used once when the configuration file is first created, to pick
//! fragment concurrency and chunk size. A failed or slow probe never
//! surfaces as an error; it degrades to the conservative figure.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::models::{AppError, AppResult};
use crate::utils::network::build_http_client;

/// Reference payload (1 MB)
pub const TEST_URL: &str = "https://ipv4.download.thinkbroadband.com/1MB.zip";

/// Upper bound for the whole measurement
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes read before the clock stops
pub const PROBE_SAMPLE_BYTES: usize = 1024 * 1024;

/// Reported when the probe fails, lands in the slowest tuning tier
pub const FALLBACK_SPEED_MBPS: f64 = 1.0;

/// Source of an approximate throughput figure in MB/s
#[async_trait]
pub trait ThroughputProbe: Send + Sync {
    async fn measure(&self) -> f64;
}

/// Timed HTTP transfer against a fixed reference file
pub struct NetworkProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl NetworkProbe {
    pub fn new() -> AppResult<Self> {
        Self::with_url(TEST_URL)
    }

    pub fn with_url(url: impl Into<String>) -> AppResult<Self> {
        Ok(Self {
            client: build_http_client(PROBE_TIMEOUT)?,
            url: url.into(),
            timeout: PROBE_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Measure MB/s, surfacing every failure as `AppError::Probe`
    pub async fn try_measure(&self) -> AppResult<f64> {
        let started = Instant::now();

        let transfer = async {
            let response = self.client.get(&self.url).send().await?.error_for_status()?;
            let mut stream = response.bytes_stream();
            let mut total = 0usize;

            while let Some(chunk) = stream.next().await {
                total += chunk?.len();
                if total >= PROBE_SAMPLE_BYTES {
                    break;
                }
            }
            Ok::<usize, AppError>(total)
        };

        let total = tokio::time::timeout(self.timeout, transfer)
            .await
            .map_err(|_| AppError::Probe(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| AppError::Probe(e.to_string()))?;

        if total == 0 {
            return Err(AppError::Probe("reference payload was empty".to_string()));
        }

        let mut seconds = started.elapsed().as_secs_f64();
        if seconds <= f64::EPSILON {
            seconds = 0.1;
        }

        let speed = (total as f64 / 1024.0 / 1024.0) / seconds;
        debug!("Probe read {} bytes in {:.3}s", total, seconds);
        Ok(speed)
    }
}

#[async_trait]
impl ThroughputProbe for NetworkProbe {
    async fn measure(&self) -> f64 {
        match self.try_measure().await {
            Ok(speed) => {
                info!("📶 Measured link speed: {:.2} MB/s", speed);
                speed
            }
            Err(err) => {
                warn!(
                    "Network probe failed ({}), assuming {:.1} MB/s",
                    err, FALLBACK_SPEED_MBPS
                );
                FALLBACK_SPEED_MBPS
            }
        }
    }
}

/// Probe returning a constant, for offline setups and tests
pub struct FixedProbe(pub f64);

#[async_trait]
impl ThroughputProbe for FixedProbe {
    async fn measure(&self) -> f64 {
        self.0
    }
}
