//! Probe request and result types
//!
//! These value types cross the probe-manager boundary: a [`ProbeRequest`]
//! describes one outgoing probe, and exactly one [`ProbeResult`] comes back
//! through the session sink for every submitted request.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// IPv4 header size in bytes.
pub const IPV4_OVERHEAD: usize = 20;
/// IPv6 header size in bytes.
pub const IPV6_OVERHEAD: usize = 40;
/// UDP header size in bytes.
pub const UDP_OVERHEAD: usize = 8;

/// Probe transport selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeKind {
    /// ICMP echo requests over an unprivileged datagram socket
    Icmp,
    /// UDP datagrams to a strategy-chosen port
    Udp,
}

impl ProbeKind {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ProbeKind::Icmp => "ICMP Echo Request",
            ProbeKind::Udp => "UDP datagram",
        }
    }
}

/// Wire overhead in front of the probe payload: the IP header plus the UDP
/// header when the probe is UDP.
pub fn wire_overhead(kind: ProbeKind, remote: IpAddr) -> usize {
    let ip = if remote.is_ipv4() {
        IPV4_OVERHEAD
    } else {
        IPV6_OVERHEAD
    };
    let transport = match kind {
        ProbeKind::Udp => UDP_OVERHEAD,
        ProbeKind::Icmp => 0,
    };
    ip + transport
}

/// One probe to be dispatched by the manager
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Caller-chosen identifier echoed back with the result
    pub id: u64,
    /// Transport to probe with
    pub kind: ProbeKind,
    /// Destination port, UDP only; 0 means unused
    pub port: u16,
    /// Sequence number; truncated to 16 bits on the wire
    pub sequence: u64,
    /// Time-to-live; values <= 0 leave the OS default in place
    pub ttl: i32,
    /// Per-probe timeout in milliseconds; values <= 0 disable the timeout
    pub timeout_ms: i64,
    /// Payload size in bytes
    pub size: usize,
    /// Enable kernel path-MTU probing for this probe
    pub detect_mtu: bool,
    /// Pattern tiled across the payload; empty means zero fill
    pub pattern: Vec<u8>,
}

/// Outcome of a single probe
///
/// Every variant carries the probe's sequence number, the session's remote
/// address, the actual number of payload bytes sent and the wire overhead,
/// so callers can account for sizes without tracking requests themselves.
#[derive(Debug, Clone)]
pub enum ProbeResult {
    /// A reply arrived on the probe socket
    Success {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
        /// Round-trip time in microseconds
        elapsed_usec: i64,
        /// Hop limit of the reply as reported by ancillary data
        reply_ttl: i32,
        /// Raw reply bytes
        data: Vec<u8>,
    },
    /// No reply within the probe's timeout
    Timeout {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
    },
    /// The destination refused the probe (`ECONNREFUSED`)
    ConnectionRefused {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
        offender: String,
        elapsed_usec: i64,
    },
    /// A router reported the host unreachable (`EHOSTUNREACH`)
    HostUnreachable {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
        offender: String,
        elapsed_usec: i64,
    },
    /// A router reported the network unreachable (`ENETUNREACH`)
    NetUnreachable {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
        offender: String,
        elapsed_usec: i64,
    },
    /// Any other error-queue report, carried raw
    ///
    /// `err_info` holds the next-hop MTU when `err_no` is `EMSGSIZE`.
    NetError {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
        offender: String,
        err_no: u32,
        err_code: u8,
        err_type: u8,
        err_info: u32,
    },
    /// The probe never made it onto the wire
    Unknown {
        sequence: u16,
        remote: String,
        probe_size: usize,
        overhead: usize,
        message: String,
    },
}

impl ProbeResult {
    /// Sequence number as stamped on the wire
    pub fn sequence(&self) -> u16 {
        match self {
            ProbeResult::Success { sequence, .. }
            | ProbeResult::Timeout { sequence, .. }
            | ProbeResult::ConnectionRefused { sequence, .. }
            | ProbeResult::HostUnreachable { sequence, .. }
            | ProbeResult::NetUnreachable { sequence, .. }
            | ProbeResult::NetError { sequence, .. }
            | ProbeResult::Unknown { sequence, .. } => *sequence,
        }
    }

    /// Actual number of payload bytes sent for this probe
    pub fn probe_size(&self) -> usize {
        match self {
            ProbeResult::Success { probe_size, .. }
            | ProbeResult::Timeout { probe_size, .. }
            | ProbeResult::ConnectionRefused { probe_size, .. }
            | ProbeResult::HostUnreachable { probe_size, .. }
            | ProbeResult::NetUnreachable { probe_size, .. }
            | ProbeResult::NetError { probe_size, .. }
            | ProbeResult::Unknown { probe_size, .. } => *probe_size,
        }
    }

    /// IP plus transport header bytes in front of the payload
    pub fn overhead(&self) -> usize {
        match self {
            ProbeResult::Success { overhead, .. }
            | ProbeResult::Timeout { overhead, .. }
            | ProbeResult::ConnectionRefused { overhead, .. }
            | ProbeResult::HostUnreachable { overhead, .. }
            | ProbeResult::NetUnreachable { overhead, .. }
            | ProbeResult::NetError { overhead, .. }
            | ProbeResult::Unknown { overhead, .. } => *overhead,
        }
    }

    /// Round-trip time in microseconds, for outcomes that measured one
    pub fn elapsed_usec(&self) -> Option<i64> {
        match self {
            ProbeResult::Success { elapsed_usec, .. }
            | ProbeResult::ConnectionRefused { elapsed_usec, .. }
            | ProbeResult::HostUnreachable { elapsed_usec, .. }
            | ProbeResult::NetUnreachable { elapsed_usec, .. } => Some(*elapsed_usec),
            _ => None,
        }
    }

    /// Address of the router that reported an error, if any
    pub fn offender(&self) -> Option<&str> {
        match self {
            ProbeResult::ConnectionRefused { offender, .. }
            | ProbeResult::HostUnreachable { offender, .. }
            | ProbeResult::NetUnreachable { offender, .. }
            | ProbeResult::NetError { offender, .. } => Some(offender),
            _ => None,
        }
    }
}
