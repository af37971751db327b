//! TTL-limited path tracing on top of the probe manager
//!
//! Two scheduling strategies: *stepped* walks the path with a bounded number
//! of probes in flight, *concurrent* fires one probe per hop each cycle.
//! Both share a monotonically shrinking `cutoff` (the first hop confirmed
//! terminal) so nothing past the end of the path is reported, and an active
//! probe `size` that path-MTU discovery narrows as the kernel reports
//! `EMSGSIZE`.

pub mod simple;

use crate::addr;
use crate::driver::{drain, SessionGuard, QUEUE_POLL_INTERVAL};
use crate::error::ProbeError;
use crate::manager::{ProbeManager, ProbeSink};
use crate::port::PortStrategy;
use crate::probe::{wire_overhead, ProbeKind, ProbeRequest, ProbeResult};
use crate::INFINITE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

/// Hop scheduling strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TraceStrategy {
    /// Walk hops in order, `probes_per_hop` probes each, with at most
    /// `concurrency` probes in flight
    Stepped {
        probes_per_hop: u32,
        concurrency: u32,
        max_hops: u32,
    },
    /// Fire one probe at every hop simultaneously, `cycles` times
    /// ([`INFINITE`] repeats until cancelled), pausing `interval_ms`
    /// between cycles
    Concurrent {
        cycles: i64,
        interval_ms: u64,
        max_hops: u32,
    },
}

impl Default for TraceStrategy {
    fn default() -> Self {
        TraceStrategy::Stepped {
            probes_per_hop: 3,
            concurrency: 5,
            max_hops: 30,
        }
    }
}

/// Probe payload sizing
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ProbeSize {
    /// Every probe carries `size` payload bytes
    Static { size: usize },
    /// Start near the ceiling and shrink on `EMSGSIZE`, discovering the
    /// path MTU along the way
    MtuDiscovery,
}

impl Default for ProbeSize {
    fn default() -> Self {
        ProbeSize::Static { size: 32 }
    }
}

/// Configuration for a trace session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Pre-resolved textual target address (IPv4 or IPv6)
    pub host: String,
    /// Probe transport (default: ICMP)
    pub kind: ProbeKind,
    /// Hop scheduling strategy
    pub strategy: TraceStrategy,
    /// Destination-port selection, UDP probes only
    pub port_strategy: PortStrategy,
    /// Payload sizing
    pub probe_size: ProbeSize,
    /// Per-probe timeout in milliseconds, 1..=10000 (default: 5000)
    pub timeout_ms: i64,
    /// Source address to bind, empty for the OS default
    pub source_ip: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            kind: ProbeKind::Icmp,
            strategy: TraceStrategy::default(),
            port_strategy: PortStrategy::default(),
            probe_size: ProbeSize::default(),
            timeout_ms: 5000,
            source_ip: String::new(),
        }
    }
}

impl TraceConfig {
    /// Create a new TraceConfig builder
    pub fn builder() -> TraceConfigBuilder {
        TraceConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if addr::parse_ip(&self.host).is_none() {
            return Err(format!("host must be an IPv4 or IPv6 literal: {:?}", self.host));
        }
        if !(1..=10000).contains(&self.timeout_ms) {
            return Err("timeout_ms must be within 1..=10000".to_string());
        }
        match self.strategy {
            TraceStrategy::Stepped {
                probes_per_hop,
                max_hops,
                ..
            } => {
                if probes_per_hop < 1 {
                    return Err("probes_per_hop must be at least 1".to_string());
                }
                if max_hops < 1 {
                    return Err("max_hops must be at least 1".to_string());
                }
            }
            TraceStrategy::Concurrent {
                cycles, max_hops, ..
            } => {
                if cycles != INFINITE && cycles < 1 {
                    return Err("cycles must be positive or INFINITE".to_string());
                }
                if max_hops < 1 {
                    return Err("max_hops must be at least 1".to_string());
                }
            }
        }
        if let PortStrategy::Random { min, max, exclude } = &self.port_strategy {
            let lo = (*min).max(1);
            let hi = (*max).min(65535);
            if lo > hi {
                return Err("random port range is empty".to_string());
            }
            if exclude_covers(lo, hi, exclude) {
                return Err("random port range is fully excluded".to_string());
            }
        }
        Ok(())
    }
}

fn exclude_covers(lo: u16, hi: u16, exclude: &BTreeSet<u16>) -> bool {
    (lo..=hi).all(|port| exclude.contains(&port))
}

/// Builder for [`TraceConfig`]
pub struct TraceConfigBuilder {
    config: TraceConfig,
}

impl TraceConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: TraceConfig::default(),
        }
    }

    /// Set the pre-resolved target address
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Choose between ICMP and UDP probes
    pub fn kind(mut self, kind: ProbeKind) -> Self {
        self.config.kind = kind;
        self
    }

    /// Set the hop scheduling strategy
    pub fn strategy(mut self, strategy: TraceStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the destination-port strategy for UDP probes
    pub fn port_strategy(mut self, strategy: PortStrategy) -> Self {
        self.config.port_strategy = strategy;
        self
    }

    /// Set the payload sizing mode
    pub fn probe_size(mut self, size: ProbeSize) -> Self {
        self.config.probe_size = size;
        self
    }

    /// Set the per-probe timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as i64;
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
    /// Returns an error if validation fails (see [`TraceConfig::validate`]).
    pub fn build(self) -> Result<TraceConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TraceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the submission task and the result consumer.
struct TraceShared {
    /// Smallest hop confirmed terminal; `usize::MAX` until discovered
    cutoff: AtomicUsize,
    /// Current probe payload size, narrowed by MTU discovery
    size: AtomicUsize,
    /// Probes issued so far (stepped strategy)
    probe_counter: AtomicUsize,
}

/// 1-based hop for the nth probe under the stepped strategy.
fn hop_for_counter(counter: usize, probes_per_hop: u32) -> usize {
    counter / probes_per_hop.max(1) as usize + 1
}

enum TraceEvent {
    Result(u64, ProbeResult),
    Finished,
}

/// Enumerates path hops with TTL-limited probes, delivering each outcome to
/// the callback together with its hop number.
///
/// One session at a time per instance.
pub struct Tracer {
    config: TraceConfig,
    active: AtomicBool,
}

impl Tracer {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            active: AtomicBool::new(false),
        }
    }

    /// Run the trace session.
    ///
    /// Results arrive as `(hop, outcome)` pairs. A hop is reported only
    /// while it is at or before the discovered terminal hop; once a
    /// `Success` or `ConnectionRefused` pins the cutoff, later hops are
    /// suppressed. Under [`ProbeSize::MtuDiscovery`], `EMSGSIZE` reports
    /// shrink the probe size and the affected probe is reissued until a
    /// non-`EMSGSIZE` outcome lands.
    pub async fn trace<F>(&self, mut on_result: F) -> Result<(), ProbeError>
    where
        F: FnMut(u32, ProbeResult),
    {
        self.config.validate().map_err(ProbeError::Config)?;
        let remote = addr::parse_ip(&self.config.host)
            .ok_or_else(|| ProbeError::InvalidTarget(self.config.host.clone()))?;
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ProbeError::SessionActive);
        }

        let overhead = wire_overhead(self.config.kind, remote);
        let initial_size = match self.config.probe_size {
            ProbeSize::Static { size } => size,
            ProbeSize::MtuDiscovery => u16::MAX as usize - overhead,
        };
        let detect_mtu = matches!(self.config.probe_size, ProbeSize::MtuDiscovery);
        let shared = Arc::new(TraceShared {
            cutoff: AtomicUsize::new(usize::MAX),
            size: AtomicUsize::new(initial_size),
            probe_counter: AtomicUsize::new(0),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink_tx = tx.clone();
        let sink: ProbeSink = Arc::new(move |id, result| {
            let _ = sink_tx.send(TraceEvent::Result(id, result));
        });
        let manager = Arc::new(ProbeManager::new(
            &self.config.host,
            &self.config.source_ip,
            sink,
        ));
        let guard = SessionGuard::new(&self.active, Arc::clone(&manager));
        manager.start()?;
        debug!(host = %self.config.host, kind = ?self.config.kind, "trace session started");

        let submissions = tokio::spawn(run_submissions(
            self.config.clone(),
            Arc::clone(&manager),
            Arc::clone(&shared),
            detect_mtu,
            tx,
        ));

        while let Some(event) = rx.recv().await {
            let (id, result) = match event {
                TraceEvent::Finished => break,
                TraceEvent::Result(id, result) => (id, result),
            };
            let hop = id as u32;
            if result.probe_size() > 0 {
                shared.size.fetch_min(result.probe_size(), Ordering::SeqCst);
            }
            if let ProbeResult::Success { .. } | ProbeResult::ConnectionRefused { .. } = &result
            {
                shared.cutoff.fetch_min(hop as usize, Ordering::SeqCst);
            }
            if let Some(next_size) = mtu_reissue_size(&result) {
                shared.size.fetch_min(next_size, Ordering::SeqCst);
                debug!(hop, next_size, "path MTU narrowed, reissuing probe");
                let request = probe_request(
                    &self.config,
                    hop,
                    u64::from(result.sequence()),
                    next_size,
                    detect_mtu,
                );
                let _ = manager.send_probe(request);
            }
            if hop as usize <= shared.cutoff.load(Ordering::SeqCst) {
                on_result(hop, result);
            }
        }

        let _ = submissions.await;
        drop(guard);
        Ok(())
    }
}

/// Payload size for the retry after a fragmentation-needed report, or
/// `None` when the outcome does not call for one.
///
/// On `EMSGSIZE` the error-queue `err_info` field is the next-hop MTU, so
/// the probe that fits is `err_info` minus the IP/transport headers. A
/// report too small to leave any payload is not actionable.
fn mtu_reissue_size(result: &ProbeResult) -> Option<usize> {
    match result {
        ProbeResult::NetError {
            err_no, err_info, ..
        } if *err_no == libc::EMSGSIZE as u32 => {
            let next_size = (*err_info as usize).saturating_sub(result.overhead());
            (next_size > 0).then_some(next_size)
        }
        _ => None,
    }
}

/// Assemble the request for one TTL-limited probe. The hop doubles as the
/// correlation id and as the TTL.
fn probe_request(
    config: &TraceConfig,
    hop: u32,
    sequence: u64,
    size: usize,
    detect_mtu: bool,
) -> ProbeRequest {
    let port = match config.kind {
        ProbeKind::Udp => config.port_strategy.resolve(hop),
        ProbeKind::Icmp => 0,
    };
    ProbeRequest {
        id: u64::from(hop),
        kind: config.kind,
        port,
        sequence,
        ttl: hop as i32,
        timeout_ms: config.timeout_ms,
        size,
        detect_mtu,
        pattern: Vec::new(),
    }
}

/// Drive the configured strategy, then wait for the manager to drain and
/// post the completion sentinel so the consumer terminates after the last
/// outcome.
async fn run_submissions(
    config: TraceConfig,
    manager: Arc<ProbeManager>,
    shared: Arc<TraceShared>,
    detect_mtu: bool,
    tx: mpsc::UnboundedSender<TraceEvent>,
) {
    match config.strategy {
        TraceStrategy::Stepped {
            probes_per_hop,
            concurrency,
            max_hops,
        } => {
            let cap = concurrency.max(1) as usize;
            loop {
                let counter = shared.probe_counter.fetch_add(1, Ordering::SeqCst);
                let hop = hop_for_counter(counter, probes_per_hop);
                let limit = (max_hops as usize).min(shared.cutoff.load(Ordering::SeqCst));
                if hop > limit {
                    break;
                }
                while manager.queue_size() > cap {
                    sleep(QUEUE_POLL_INTERVAL).await;
                }
                submit(&config, &manager, &shared, detect_mtu, hop as u32, counter as u64);
            }
        }
        TraceStrategy::Concurrent {
            cycles,
            interval_ms,
            max_hops,
        } => {
            let mut cycle: i64 = 0;
            loop {
                if cycles != INFINITE && cycle >= cycles {
                    break;
                }
                for hop in 1..=max_hops {
                    submit(&config, &manager, &shared, detect_mtu, hop, cycle as u64);
                }
                sleep(Duration::from_millis(interval_ms)).await;
                cycle += 1;
            }
        }
    }
    drain(&manager).await;
    manager.stop();
    let _ = tx.send(TraceEvent::Finished);
}

fn submit(
    config: &TraceConfig,
    manager: &ProbeManager,
    shared: &TraceShared,
    detect_mtu: bool,
    hop: u32,
    sequence: u64,
) {
    let size = shared.size.load(Ordering::SeqCst);
    let _ = manager.send_probe(probe_request(config, hop, sequence, size, detect_mtu));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emsgsize(err_info: u32, overhead: usize, sequence: u16) -> ProbeResult {
        ProbeResult::NetError {
            sequence,
            remote: "192.0.2.1".to_string(),
            probe_size: 65507,
            overhead,
            offender: "192.0.2.1".to_string(),
            err_no: libc::EMSGSIZE as u32,
            err_code: 0,
            err_type: 2,
            err_info,
        }
    }

    #[test]
    fn test_mtu_reissue_size_subtracts_overhead() {
        // path MTU 1000 over UDP/IPv4: 28 header bytes in front of the payload
        assert_eq!(mtu_reissue_size(&emsgsize(1000, 28, 1)), Some(972));
        assert_eq!(mtu_reissue_size(&emsgsize(1500, 20, 1)), Some(1480));
    }

    #[test]
    fn test_mtu_reissue_ignores_useless_reports() {
        // no payload would fit
        assert_eq!(mtu_reissue_size(&emsgsize(28, 28, 1)), None);
        assert_eq!(mtu_reissue_size(&emsgsize(0, 28, 1)), None);
    }

    #[test]
    fn test_mtu_reissue_only_on_emsgsize() {
        let other_error = ProbeResult::NetError {
            sequence: 1,
            remote: "192.0.2.1".to_string(),
            probe_size: 32,
            overhead: 28,
            offender: "198.51.100.1".to_string(),
            err_no: libc::EHOSTUNREACH as u32,
            err_code: 0,
            err_type: 2,
            err_info: 1000,
        };
        assert_eq!(mtu_reissue_size(&other_error), None);
        let timeout = ProbeResult::Timeout {
            sequence: 1,
            remote: "192.0.2.1".to_string(),
            probe_size: 32,
            overhead: 28,
        };
        assert_eq!(mtu_reissue_size(&timeout), None);
    }

    #[test]
    fn test_reissued_request_keeps_hop_and_sequence() {
        let config = TraceConfig::builder()
            .host("192.0.2.1")
            .kind(ProbeKind::Udp)
            .port_strategy(PortStrategy::Fixed { port: 33434 })
            .probe_size(ProbeSize::MtuDiscovery)
            .build()
            .unwrap();
        let report = emsgsize(1000, 28, 5);
        let next_size = mtu_reissue_size(&report).unwrap();
        let request = probe_request(&config, 7, u64::from(report.sequence()), next_size, true);
        // same probe, shrunk to what the path fits
        assert_eq!(request.id, 7);
        assert_eq!(request.ttl, 7);
        assert_eq!(request.sequence, 5);
        assert_eq!(request.size, 972);
        assert_eq!(request.port, 33434);
        assert!(request.detect_mtu);
    }

    #[test]
    fn test_hop_for_counter() {
        // three probes per hop: 0,1,2 -> hop 1; 3,4,5 -> hop 2
        assert_eq!(hop_for_counter(0, 3), 1);
        assert_eq!(hop_for_counter(2, 3), 1);
        assert_eq!(hop_for_counter(3, 3), 2);
        assert_eq!(hop_for_counter(29, 3), 10);
    }

    #[test]
    fn test_hop_for_counter_guards_zero() {
        assert_eq!(hop_for_counter(5, 0), 6);
    }

    #[test]
    fn test_default_config() {
        let config = TraceConfig::default();
        assert_eq!(config.kind, ProbeKind::Icmp);
        assert_eq!(config.timeout_ms, 5000);
        assert!(matches!(
            config.strategy,
            TraceStrategy::Stepped {
                probes_per_hop: 3,
                concurrency: 5,
                max_hops: 30
            }
        ));
        assert!(matches!(config.port_strategy, PortStrategy::Fixed { port: 33434 }));
        assert!(matches!(config.probe_size, ProbeSize::Static { size: 32 }));
    }

    #[test]
    fn test_builder_validation() {
        // hostnames are rejected, resolution is external
        assert!(TraceConfig::builder().host("example.com").build().is_err());

        // timeout bounds
        assert!(TraceConfig::builder()
            .host("127.0.0.1")
            .timeout(Duration::from_millis(0))
            .build()
            .is_err());
        assert!(TraceConfig::builder()
            .host("127.0.0.1")
            .timeout(Duration::from_millis(10001))
            .build()
            .is_err());

        // strategy bounds
        assert!(TraceConfig::builder()
            .host("127.0.0.1")
            .strategy(TraceStrategy::Stepped {
                probes_per_hop: 0,
                concurrency: 5,
                max_hops: 30
            })
            .build()
            .is_err());
        assert!(TraceConfig::builder()
            .host("127.0.0.1")
            .strategy(TraceStrategy::Concurrent {
                cycles: 0,
                interval_ms: 1000,
                max_hops: 30
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_random_port_range_validation() {
        let exclude: BTreeSet<u16> = (2000..=2003).collect();
        assert!(TraceConfig::builder()
            .host("127.0.0.1")
            .kind(ProbeKind::Udp)
            .port_strategy(PortStrategy::Random {
                min: 2000,
                max: 2003,
                exclude,
            })
            .build()
            .is_err());
        assert!(TraceConfig::builder()
            .host("127.0.0.1")
            .kind(ProbeKind::Udp)
            .port_strategy(PortStrategy::Random {
                min: 3000,
                max: 2000,
                exclude: BTreeSet::new(),
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_infinite_cycles_are_valid() {
        let config = TraceConfig::builder()
            .host("::1")
            .strategy(TraceStrategy::Concurrent {
                cycles: INFINITE,
                interval_ms: 50,
                max_hops: 5,
            })
            .build()
            .unwrap();
        assert!(config.validate().is_ok());
    }
}
