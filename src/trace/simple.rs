//! Per-hop aggregation over a stepped trace
//!
//! Folds raw probe outcomes into one [`HopStatus`] record per hop and
//! re-emits the updated record after every in-window probe. Aggregation and
//! the user callback run under a single-permit mutex, so the application
//! observes a strict total order.

use crate::addr;
use crate::driver::ActiveGuard;
use crate::error::ProbeError;
use crate::port::PortStrategy;
use crate::probe::{ProbeKind, ProbeResult};
use crate::trace::{ProbeSize, TraceConfig, TraceStrategy, Tracer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

/// One probe's contribution to a hop record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopResponse {
    /// The hop answered: round-trip time, and the discovered packet size
    /// on the wire (0 when MTU discovery is off)
    Success { elapsed_usec: i64, mtu: usize },
    /// The probe went unanswered or failed
    Error,
}

/// Aggregated view of one hop, re-emitted after every update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopStatus {
    /// 1-based hop number
    pub num: u32,
    /// Distinct addresses observed answering for this hop
    pub addrs: BTreeSet<String>,
    /// Per-probe outcomes in arrival order
    pub responses: Vec<HopResponse>,
    /// Whether this hop is the terminal one
    pub is_last: bool,
}

impl HopStatus {
    fn new(num: u32) -> Self {
        Self {
            num,
            addrs: BTreeSet::new(),
            responses: Vec::new(),
            is_last: false,
        }
    }
}

/// Configuration for a [`SimpleTracer`] session
///
/// Always traces stepped with MTU discovery; the remaining knobs mirror the
/// underlying [`TraceConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleTraceConfig {
    /// Pre-resolved textual target address (IPv4 or IPv6)
    pub host: String,
    /// Probe transport (default: ICMP)
    pub kind: ProbeKind,
    /// Per-probe timeout in milliseconds (default: 5000)
    pub timeout_ms: i64,
    /// Deepest hop to probe (default: 30)
    pub max_hops: u32,
    /// Probes per hop (default: 3)
    pub probes_per_hop: u32,
    /// In-flight probe cap (default: 5)
    pub concurrency: u32,
    /// Destination-port selection for UDP probes (default: sequential from
    /// 33434)
    pub port_strategy: PortStrategy,
    /// Source address to bind, empty for the OS default
    pub source_ip: String,
}

impl Default for SimpleTraceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            kind: ProbeKind::Icmp,
            timeout_ms: 5000,
            max_hops: 30,
            probes_per_hop: 3,
            concurrency: 5,
            port_strategy: PortStrategy::traceroute_default(),
            source_ip: String::new(),
        }
    }
}

impl SimpleTraceConfig {
    /// Create a new SimpleTraceConfig builder
    pub fn builder() -> SimpleTraceConfigBuilder {
        SimpleTraceConfigBuilder::new()
    }

    fn to_trace_config(&self) -> TraceConfig {
        TraceConfig {
            host: self.host.clone(),
            kind: self.kind,
            strategy: TraceStrategy::Stepped {
                probes_per_hop: self.probes_per_hop,
                concurrency: self.concurrency,
                max_hops: self.max_hops,
            },
            port_strategy: self.port_strategy.clone(),
            probe_size: ProbeSize::MtuDiscovery,
            timeout_ms: self.timeout_ms,
            source_ip: self.source_ip.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.to_trace_config().validate()
    }
}

/// Builder for [`SimpleTraceConfig`]
pub struct SimpleTraceConfigBuilder {
    config: SimpleTraceConfig,
}

impl SimpleTraceConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: SimpleTraceConfig::default(),
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

    /// Set the per-probe timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as i64;
        self
    }

    /// Set the deepest hop to probe
    pub fn max_hops(mut self, max_hops: u32) -> Self {
        self.config.max_hops = max_hops;
        self
    }

    /// Set how many probes each hop receives
    pub fn probes_per_hop(mut self, probes: u32) -> Self {
        self.config.probes_per_hop = probes;
        self
    }

    /// Set the in-flight probe cap
    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Set the destination-port strategy for UDP probes
    pub fn port_strategy(mut self, strategy: PortStrategy) -> Self {
        self.config.port_strategy = strategy;
        self
    }

    /// Set the source address to bind
    pub fn source_ip(mut self, source: impl Into<String>) -> Self {
        self.config.source_ip = source.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SimpleTraceConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SimpleTraceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hop map and cutoff bookkeeping, separated from the I/O so the folding
/// rules are testable on their own.
struct HopAggregator {
    hops: BTreeMap<u32, HopStatus>,
    cutoff: u32,
}

impl HopAggregator {
    fn new() -> Self {
        Self {
            hops: BTreeMap::new(),
            cutoff: u32::MAX,
        }
    }

    /// Fold one probe outcome into the hop map.
    ///
    /// A `Success`, or a refused/host-unreachable report whose offender is
    /// the traced destination itself, pins that hop as terminal: later hops
    /// are dropped and suppressed from here on. Returns the updated record
    /// to emit, or `None` for outcomes past the terminal hop.
    fn fold(
        &mut self,
        hop: u32,
        result: ProbeResult,
        remote: &str,
        detect_mtu: bool,
    ) -> Option<HopStatus> {
        let terminal = match &result {
            ProbeResult::Success { .. } => true,
            ProbeResult::ConnectionRefused { offender, .. }
            | ProbeResult::HostUnreachable { offender, .. } => offender == remote,
            _ => false,
        };
        if terminal && hop < self.cutoff {
            self.cutoff = hop;
            self.hops.retain(|num, _| *num <= hop);
        }
        if hop > self.cutoff {
            return None;
        }
        let status = self.hops.entry(hop).or_insert_with(|| HopStatus::new(hop));
        match &result {
            ProbeResult::Success {
                remote: from,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            } => {
                status.addrs.insert(from.clone());
                status.responses.push(HopResponse::Success {
                    elapsed_usec: *elapsed_usec,
                    mtu: if detect_mtu { probe_size + overhead } else { 0 },
                });
            }
            ProbeResult::ConnectionRefused {
                offender,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            }
            | ProbeResult::HostUnreachable {
                offender,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            }
            | ProbeResult::NetUnreachable {
                offender,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            } => {
                status.addrs.insert(offender.clone());
                status.responses.push(HopResponse::Success {
                    elapsed_usec: *elapsed_usec,
                    mtu: if detect_mtu { probe_size + overhead } else { 0 },
                });
            }
            ProbeResult::NetError { offender, .. } => {
                if !offender.is_empty() {
                    status.addrs.insert(offender.clone());
                }
                status.responses.push(HopResponse::Error);
            }
            ProbeResult::Timeout { .. } | ProbeResult::Unknown { .. } => {
                status.responses.push(HopResponse::Error);
            }
        }
        status.is_last = hop == self.cutoff;
        Some(status.clone())
    }
}

/// Stepped tracer with per-hop aggregation: the callback receives the whole
/// updated [`HopStatus`] after every probe instead of raw outcomes.
pub struct SimpleTracer {
    config: SimpleTraceConfig,
    active: AtomicBool,
}

impl SimpleTracer {
    pub fn new(config: SimpleTraceConfig) -> Self {
        Self {
            config,
            active: AtomicBool::new(false),
        }
    }

    /// Run the trace, emitting an updated [`HopStatus`] per in-window probe.
    pub async fn trace<F>(&self, mut on_update: F) -> Result<(), ProbeError>
    where
        F: FnMut(HopStatus),
    {
        self.config.validate().map_err(ProbeError::Config)?;
        let remote = addr::parse_ip(&self.config.host)
            .map(addr::format_ip)
            .ok_or_else(|| ProbeError::InvalidTarget(self.config.host.clone()))?;
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ProbeError::SessionActive);
        }
        let _guard = ActiveGuard::new(&self.active);

        let tracer = Tracer::new(self.config.to_trace_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = tokio::spawn(async move {
            tracer
                .trace(move |hop, result| {
                    let _ = tx.send((hop, result));
                })
                .await
        });

        let state = Mutex::new(HopAggregator::new());
        while let Some((hop, result)) = rx.recv().await {
            let mut aggregator = state.lock().await;
            if let Some(status) = aggregator.fold(hop, result, &remote, true) {
                on_update(status);
            }
        }

        match session.await {
            Ok(result) => result,
            Err(e) => {
                error!("trace session task failed: {e}");
                Err(ProbeError::Other(e.to_string()))
            }
        }
    }
}
