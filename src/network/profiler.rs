use std::time::{Duration, Instant};

use futures::stream::StreamExt;
use thiserror::Error;

use super::NetworkProfile;

#[derive(Debug, Error)]
enum ProbeError {
    #[error("Probe request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Probe endpoint returned status {0}")]
    HttpStatus(u16),
    #[error("No probe endpoints configured")]
    NoEndpoints,
    #[error("Measurement timed out")]
    Timeout,
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Endpoints serving a payload of at least `probe_bytes`; used round-robin
    pub endpoints: Vec<String>,
    pub probe_count: usize,
    /// Bytes read per probe; the rest of the body is ignored
    pub probe_bytes: usize,
    /// Overall budget for the whole measurement
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://speed.cloudflare.com/__down?bytes=262144".to_string()],
            probe_count: 3,
            probe_bytes: 256 * 1024,
            timeout: Duration::from_secs(15),
        }
    }
}

/// One probe's raw numbers.
#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    bytes: usize,
    elapsed: Duration,
}

/// Measures bandwidth and latency with a few small downloads.
#[derive(Clone)]
pub struct Profiler {
    client: reqwest::Client,
    options: ProbeOptions,
}

impl Profiler {
    pub fn new(client: reqwest::Client, options: ProbeOptions) -> Self {
        Self { client, options }
    }

    /// Run the probes and classify the result.
    ///
    /// Never returns an error: if any probe fails, or the overall timeout
    /// elapses, the slowest-tier fallback profile is returned instead.
    pub async fn measure(&self) -> NetworkProfile {
        let outcome = tokio::time::timeout(self.options.timeout, self.probe_all())
            .await
            .unwrap_or(Err(ProbeError::Timeout));

        match outcome {
            Ok((bandwidth_mbps, latency_ms)) => {
                let profile = NetworkProfile::from_measurement(bandwidth_mbps, latency_ms);
                tracing::info!(
                    tier = %profile.tier,
                    bandwidth_mbps = bandwidth_mbps,
                    latency_ms = latency_ms,
                    max_concurrency = profile.max_concurrency,
                    "Network measured"
                );
                profile
            }
            Err(e) => {
                tracing::warn!(error = %e, "Network measurement failed, using slowest tier");
                NetworkProfile::fallback()
            }
        }
    }

    /// Sequential probes, so they do not compete with each other for bandwidth.
    /// Returns (bandwidth in Mbps, median latency in ms).
    async fn probe_all(&self) -> Result<(f64, u64), ProbeError> {
        if self.options.endpoints.is_empty() {
            return Err(ProbeError::NoEndpoints);
        }

        let count = self.options.probe_count.max(1);
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let endpoint = &self.options.endpoints[i % self.options.endpoints.len()];
            samples.push(self.probe(endpoint).await?);
        }

        let total_bytes: usize = samples.iter().map(|s| s.bytes).sum();
        let total_secs: f64 = samples.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        let bandwidth_mbps = if total_secs > 0.0 {
            (total_bytes as f64 * 8.0) / total_secs / 1_000_000.0
        } else {
            f64::INFINITY
        };
        // Non-finite bandwidth classifies as slow; cap instead so a
        // too-fast-to-time local link is fast.
        let bandwidth_mbps = if bandwidth_mbps.is_finite() {
            bandwidth_mbps
        } else {
            f64::from(u32::MAX)
        };

        let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
        latencies.sort();
        let latency_ms = latencies[latencies.len() / 2].as_millis() as u64;

        Ok((bandwidth_mbps, latency_ms))
    }

    async fn probe(&self, endpoint: &str) -> Result<Sample, ProbeError> {
        let start = Instant::now();
        let response = self.client.get(endpoint).send().await?;
        let latency = start.elapsed();

        if !response.status().is_success() {
            return Err(ProbeError::HttpStatus(response.status().as_u16()));
        }

        let mut bytes = 0usize;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            bytes += chunk?.len();
            if bytes >= self.options.probe_bytes {
                break;
            }
        }

        Ok(Sample {
            latency,
            bytes,
            elapsed: start.elapsed(),
        })
    }
}
