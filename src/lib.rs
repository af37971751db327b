//! pathprobe - user-space network diagnostics without raw sockets
//!
//! This library provides ping and traceroute built on one reusable primitive:
//! a probe scheduler that keeps many unprivileged ICMP/UDP probes in flight at
//! once, one datagram socket per probe, and correlates each with its reply,
//! kernel error-queue report, or timeout.
//!
//! # Features
//!
//! - **Unprivileged**: datagram ICMP sockets and `IP_RECVERR`, no raw sockets
//!   or root required (subject to the host's `ping_group_range`)
//! - **Parallel probing**: bounded-concurrency stepped traces, or all hops at
//!   once per cycle
//! - **Path-MTU discovery**: reacts to `EMSGSIZE` reports and shrinks the
//!   probe size until it fits
//! - **IPv4 and IPv6**: pre-resolved textual addresses of either family
//! - **Streaming results**: every outcome is delivered to the caller as it
//!   arrives
//!
//! # Quick Start
//!
//! ```no_run
//! use pathprobe::{PingConfig, Pinger};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PingConfig::builder()
//!         .host("127.0.0.1")
//!         .count(3)
//!         .interval(Duration::from_millis(500))
//!         .build()?;
//!
//!     Pinger::new(config)
//!         .ping(|result| println!("{result:?}"))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Tracing a path
//!
//! ```no_run
//! use pathprobe::{SimpleTraceConfig, SimpleTracer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SimpleTraceConfig::builder().host("203.0.113.1").build()?;
//!
//!     SimpleTracer::new(config)
//!         .trace(|hop| println!("hop {}: {:?} last={}", hop.num, hop.addrs, hop.is_last))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Name resolution is deliberately out of scope: every `host` is a textual
//! IPv4 or IPv6 address the caller has already resolved.
//!
//! # Modules
//!
//! - [`manager`]: the probe scheduler owning the per-probe sockets
//! - [`probe`]: request/result types crossing the scheduler boundary
//! - [`ping`]: fixed-cadence ICMP echo driver
//! - [`trace`]: stepped/concurrent traceroute drivers and hop aggregation
//! - [`port`]: destination-port strategies for UDP probes

mod addr;
mod driver;
pub mod error;
pub mod manager;
pub mod packet;
pub mod ping;
pub mod port;
pub mod probe;
pub mod trace;

/// Sentinel for unbounded ping counts and trace cycles.
pub const INFINITE: i64 = -1;

pub use error::ProbeError;
pub use manager::{ProbeManager, ProbeSink};
pub use packet::ICMP_HEADER_SIZE;
pub use ping::{PingConfig, PingConfigBuilder, Pinger};
pub use port::PortStrategy;
pub use probe::{ProbeKind, ProbeRequest, ProbeResult};
pub use trace::simple::{
    HopResponse, HopStatus, SimpleTraceConfig, SimpleTraceConfigBuilder, SimpleTracer,
};
pub use trace::{ProbeSize, TraceConfig, TraceConfigBuilder, TraceStrategy, Tracer};
