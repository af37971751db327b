//! Per-probe bookkeeping owned by the manager

use crate::probe::{ProbeKind, ProbeRequest, ProbeResult};
use socket2::Socket;

/// Reply buffer size for incoming datagrams.
pub(super) const INCOMING_BUFFER_SIZE: usize = 2048;

/// Lifecycle state of an in-flight probe. The transition out of `Waiting`
/// is monotonic; a context is never re-waited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ProbeStatus {
    Waiting,
    Success,
    Timeout,
    NetError,
    FatalError,
}

/// Everything the manager tracks for one outstanding probe, from submission
/// to the callback. The socket lives here so reaping the context closes it.
pub(super) struct ProbeContext {
    pub(super) id: u64,
    pub(super) kind: ProbeKind,
    pub(super) remote: String,
    pub(super) offender: String,
    pub(super) packet: Vec<u8>,
    pub(super) reply: Vec<u8>,
    pub(super) ttl: i32,
    pub(super) reply_ttl: i32,
    pub(super) timeout_ms: i64,
    pub(super) overhead: usize,
    pub(super) sequence: u16,
    pub(super) tv_sent: libc::timeval,
    pub(super) tv_received: libc::timeval,
    pub(super) error_msg: String,
    pub(super) err_no: u32,
    pub(super) err_code: u8,
    pub(super) err_type: u8,
    pub(super) err_info: u32,
    pub(super) status: ProbeStatus,
    pub(super) socket: Option<Socket>,
}

impl ProbeContext {
    pub(super) fn new(request: &ProbeRequest, remote: String, overhead: usize) -> Self {
        Self {
            id: request.id,
            kind: request.kind,
            remote,
            offender: String::new(),
            packet: Vec::new(),
            reply: Vec::new(),
            ttl: request.ttl,
            reply_ttl: 0,
            timeout_ms: request.timeout_ms,
            overhead,
            sequence: (request.sequence & 0xffff) as u16,
            tv_sent: zero_timeval(),
            tv_received: zero_timeval(),
            error_msg: String::new(),
            err_no: 0,
            err_code: 0,
            err_type: 0,
            err_info: 0,
            status: ProbeStatus::Waiting,
            socket: None,
        }
    }

    /// Mark the probe as never having made it onto the wire.
    pub(super) fn fail(&mut self, message: impl Into<String>) {
        self.error_msg = message.into();
        self.status = ProbeStatus::FatalError;
    }

    /// Milliseconds since the probe was sent.
    pub(super) fn elapsed_ms(&self, now: libc::timeval) -> i64 {
        timeval_diff_usec(now, self.tv_sent) / 1000
    }

    /// Collapse the context into the result delivered to the caller.
    ///
    /// `NetError` splits on errno into the typed unreachable/refused cases;
    /// everything else degrades to the generic variant carrying the raw
    /// error-queue fields.
    pub(super) fn into_result(self) -> ProbeResult {
        let probe_size = self.packet.len();
        match self.status {
            ProbeStatus::FatalError => ProbeResult::Unknown {
                sequence: self.sequence,
                remote: self.remote,
                probe_size,
                overhead: self.overhead,
                message: self.error_msg,
            },
            ProbeStatus::Success => {
                let elapsed_usec = self.elapsed_usec();
                ProbeResult::Success {
                    sequence: self.sequence,
                    remote: self.remote,
                    probe_size,
                    overhead: self.overhead,
                    elapsed_usec,
                    reply_ttl: self.reply_ttl,
                    data: self.reply,
                }
            }
            ProbeStatus::Waiting | ProbeStatus::Timeout => ProbeResult::Timeout {
                sequence: self.sequence,
                remote: self.remote,
                probe_size,
                overhead: self.overhead,
            },
            ProbeStatus::NetError => {
                let elapsed_usec = self.elapsed_usec();
                match self.err_no as i32 {
                    libc::ECONNREFUSED => ProbeResult::ConnectionRefused {
                        sequence: self.sequence,
                        remote: self.remote,
                        probe_size,
                        overhead: self.overhead,
                        offender: self.offender,
                        elapsed_usec,
                    },
                    libc::EHOSTUNREACH => ProbeResult::HostUnreachable {
                        sequence: self.sequence,
                        remote: self.remote,
                        probe_size,
                        overhead: self.overhead,
                        offender: self.offender,
                        elapsed_usec,
                    },
                    libc::ENETUNREACH => ProbeResult::NetUnreachable {
                        sequence: self.sequence,
                        remote: self.remote,
                        probe_size,
                        overhead: self.overhead,
                        offender: self.offender,
                        elapsed_usec,
                    },
                    _ => ProbeResult::NetError {
                        sequence: self.sequence,
                        remote: self.remote,
                        probe_size,
                        overhead: self.overhead,
                        offender: self.offender,
                        err_no: self.err_no,
                        err_code: self.err_code,
                        err_type: self.err_type,
                        err_info: self.err_info,
                    },
                }
            }
        }
    }

    fn elapsed_usec(&self) -> i64 {
        timeval_diff_usec(self.tv_received, self.tv_sent).max(0)
    }
}

pub(super) fn zero_timeval() -> libc::timeval {
    libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    }
}

/// Current wall-clock time. Wall clock rather than monotonic so the send
/// stamp composes with the `SIOCGSTAMP` receive stamp.
pub(super) fn now_timeval() -> libc::timeval {
    let mut tv = zero_timeval();
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    tv
}

pub(super) fn timeval_diff_usec(later: libc::timeval, earlier: libc::timeval) -> i64 {
    let later_usec = later.tv_sec as i64 * 1_000_000 + later.tv_usec as i64;
    let earlier_usec = earlier.tv_sec as i64 * 1_000_000 + earlier.tv_usec as i64;
    later_usec - earlier_usec
}
