//! Fixed-cadence ICMP echo driver

use crate::addr;
use crate::driver::{drain, SessionGuard};
use crate::error::ProbeError;
use crate::manager::{ProbeManager, ProbeSink};
use crate::probe::{ProbeKind, ProbeRequest, ProbeResult};
use crate::INFINITE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

/// Configuration for a ping session
///
/// Use [`PingConfig::builder`] for a fluent API with validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingConfig {
    /// Pre-resolved textual target address (IPv4 or IPv6)
    pub host: String,
    /// Time-to-live; -1 keeps the OS default
    pub ttl: i32,
    /// Per-probe timeout in milliseconds (default: 5000)
    pub timeout_ms: i64,
    /// Number of echoes to send, or [`INFINITE`] (default: 4)
    pub max_count: i64,
    /// Pause between probes in milliseconds (default: 1000)
    pub interval_ms: u64,
    /// Payload size in bytes (default: 32)
    pub probe_size: usize,
    /// Payload fill pattern; `None` zero-fills
    pub pattern: Option<Vec<u8>>,
    /// Source address to bind, empty for the OS default
    pub source_ip: String,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            ttl: -1,
            timeout_ms: 5000,
            max_count: 4,
            interval_ms: 1000,
            probe_size: 32,
            pattern: None,
            source_ip: String::new(),
        }
    }
}

impl PingConfig {
    /// Create a new PingConfig builder
    pub fn builder() -> PingConfigBuilder {
        PingConfigBuilder::new()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not a textual IP address or the count
    /// is neither positive nor [`INFINITE`].
    pub fn validate(&self) -> Result<(), String> {
        if addr::parse_ip(&self.host).is_none() {
            return Err(format!("host must be an IPv4 or IPv6 literal: {:?}", self.host));
        }
        if self.max_count != INFINITE && self.max_count < 1 {
            return Err("max_count must be positive or INFINITE".to_string());
        }
        Ok(())
    }
}

/// Builder for [`PingConfig`]
pub struct PingConfigBuilder {
    config: PingConfig,
}

impl PingConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: PingConfig::default(),
        }
    }

    /// Set the pre-resolved target address
    ///
    /// This is the only required field. Name resolution is the caller's job.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the probe TTL; -1 keeps the OS default
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Set the per-probe timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as i64;
        self
    }

    /// Set how many echoes to send; [`INFINITE`] pings until cancelled
    pub fn count(mut self, count: i64) -> Self {
        self.config.max_count = count;
        self
    }

    /// Set the pause between probes
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the payload size in bytes
    pub fn probe_size(mut self, size: usize) -> Self {
        self.config.probe_size = size;
        self
    }

    /// Set the payload fill pattern
    pub fn pattern(mut self, pattern: impl Into<Vec<u8>>) -> Self {
        self.config.pattern = Some(pattern.into());
        self
    }

    /// Set the source address to bind
    pub fn source_ip(mut self, source: impl Into<String>) -> Self {
        self.config.source_ip = source.into();
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (see [`PingConfig::validate`]).
    pub fn build(self) -> Result<PingConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends a bounded or unbounded sequence of ICMP echoes at a fixed cadence,
/// delivering one [`ProbeResult`] per echo to the callback.
///
/// One session at a time per instance; a second call while a session runs
/// returns [`ProbeError::SessionActive`].
pub struct Pinger {
    config: PingConfig,
    active: AtomicBool,
}

impl Pinger {
    pub fn new(config: PingConfig) -> Self {
        Self {
            config,
            active: AtomicBool::new(false),
        }
    }

    /// Run the ping session.
    ///
    /// Each iteration submits one echo with a monotonically increasing
    /// sequence, waits for its single callback, then sleeps the configured
    /// interval. The manager is drained before release, so the callback has
    /// fired for every submitted probe by the time this returns.
    pub async fn ping<F>(&self, mut on_result: F) -> Result<(), ProbeError>
    where
        F: FnMut(ProbeResult),
    {
        self.config.validate().map_err(ProbeError::Config)?;
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ProbeError::SessionActive);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: ProbeSink = Arc::new(move |id, result| {
            let _ = tx.send((id, result));
        });
        let manager = Arc::new(ProbeManager::new(
            &self.config.host,
            &self.config.source_ip,
            sink,
        ));
        let guard = SessionGuard::new(&self.active, Arc::clone(&manager));
        manager.start()?;
        debug!(host = %self.config.host, count = self.config.max_count, "ping session started");

        let pattern = self.config.pattern.clone().unwrap_or_default();
        let mut count: i64 = 0;
        loop {
            if self.config.max_count != INFINITE && count >= self.config.max_count {
                break;
            }
            count += 1;
            let request = ProbeRequest {
                id: count as u64,
                kind: ProbeKind::Icmp,
                port: 0,
                sequence: count as u64,
                ttl: self.config.ttl,
                timeout_ms: self.config.timeout_ms,
                size: self.config.probe_size,
                detect_mtu: false,
                pattern: pattern.clone(),
            };
            // a failed submission still produces its callback, so the recv
            // below pairs with it either way
            let _ = manager.send_probe(request);
            match rx.recv().await {
                Some((_, result)) => on_result(result),
                None => break,
            }
            sleep(Duration::from_millis(self.config.interval_ms)).await;
        }

        drain(&manager).await;
        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PingConfig::default();
        assert_eq!(config.ttl, -1);
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.max_count, 4);
        assert_eq!(config.interval_ms, 1000);
        assert_eq!(config.probe_size, 32);
        assert!(config.pattern.is_none());
        assert!(config.source_ip.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = PingConfig::builder()
            .host("127.0.0.1")
            .count(3)
            .interval(Duration::from_millis(10))
            .timeout(Duration::from_millis(500))
            .probe_size(64)
            .pattern(*b"ping")
            .build()
            .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_count, 3);
        assert_eq!(config.interval_ms, 10);
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.probe_size, 64);
        assert_eq!(config.pattern.as_deref(), Some(&b"ping"[..]));
    }

    #[test]
    fn test_validation_rejects_hostname() {
        // resolution is the caller's job
        let result = PingConfig::builder().host("example.com").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_count() {
        let result = PingConfig::builder().host("127.0.0.1").count(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_infinite_count_is_valid() {
        let config = PingConfig::builder()
            .host("::1")
            .count(INFINITE)
            .build()
            .unwrap();
        assert_eq!(config.max_count, INFINITE);
    }

    #[tokio::test]
    async fn test_overlapping_sessions_rejected() {
        let pinger = Arc::new(Pinger::new(
            PingConfig::builder()
                .host("127.0.0.1")
                .count(INFINITE)
                .interval(Duration::from_millis(10))
                .timeout(Duration::from_millis(100))
                .build()
                .unwrap(),
        ));
        pinger.active.store(true, Ordering::SeqCst);
        let err = pinger.ping(|_| {}).await.unwrap_err();
        assert!(matches!(err, ProbeError::SessionActive));
        pinger.active.store(false, Ordering::SeqCst);
    }
}
