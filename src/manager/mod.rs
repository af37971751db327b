//! Probe manager: one event loop owning many in-flight probe sockets
//!
//! Each submitted probe gets its own unprivileged datagram socket, configured
//! for error-queue and hop-limit reception, and is tracked by a background
//! worker multiplexing all of them. The worker correlates every socket with
//! exactly one outcome (reply, error-queue report, or timeout) and hands it
//! to the session sink as a [`ProbeResult`].
//!
//! Linux-only: the mechanism rests on `IP_RECVERR`/`IPV6_RECVERR`, `epoll`
//! and `eventfd`.

mod context;
mod event_loop;

use crate::addr;
use crate::error::ProbeError;
use crate::packet;
use crate::probe::{wire_overhead, ProbeKind, ProbeRequest, ProbeResult};
use context::{now_timeval, ProbeContext};
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Send timeout applied to every probe socket.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `start` waits for the event loop to come up.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink invoked with `(probe id, outcome)` for every submitted probe.
///
/// Called from the manager's worker thread (or from the submitting thread for
/// probes that fail before reaching the wire), so it must not block on the
/// manager's own API. Bridging into a channel is the usual shape.
pub type ProbeSink = Arc<dyn Fn(u64, ProbeResult) + Send + Sync>;

/// Shared between the public handle and the worker thread.
pub(crate) struct Inner {
    pub(crate) remote: Option<IpAddr>,
    pub(crate) remote_ip: String,
    source: Option<IpAddr>,
    ident: u16,
    sink: ProbeSink,
    pub(crate) probes: Mutex<HashMap<RawFd, ProbeContext>>,
    pub(crate) running: AtomicBool,
    pub(crate) epoll_fd: AtomicI32,
    pub(crate) wakeup_fd: AtomicI32,
}

impl Inner {
    /// Interrupt a blocked multiplexer wait.
    pub(crate) fn wakeup(&self) {
        let fd = self.wakeup_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            let one: u64 = 1;
            unsafe {
                libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
            }
        }
    }

    /// Classify a finished context and hand it to the sink.
    pub(crate) fn dispatch(&self, ctx: ProbeContext) {
        let id = ctx.id;
        (self.sink)(id, ctx.into_result());
    }
}

/// A probe session bound to one remote address.
///
/// Thread-safe: probes may be submitted from any thread while the worker is
/// running. The manager is terminal after [`stop`](Self::stop); create a new
/// one per session.
pub struct ProbeManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ProbeManager {
    /// Create a manager for one remote address.
    ///
    /// `remote_ip` is parsed as IPv4 then IPv6; if neither parses the manager
    /// is created inert and every submission reports `Unknown`. A non-empty
    /// `source_ip` that fails to parse is dropped with a warning and the OS
    /// picks the source address.
    pub fn new(remote_ip: &str, source_ip: &str, sink: ProbeSink) -> Self {
        let remote = addr::parse_ip(remote_ip);
        if remote.is_none() {
            error!(remote_ip, "invalid network address format");
        }
        let source = if source_ip.is_empty() {
            None
        } else {
            let parsed = addr::parse_ip(source_ip);
            if parsed.is_none() {
                warn!(source_ip, "invalid source address format, using OS default");
            }
            parsed
        };
        let ident = rand::rng().random::<u16>();
        Self {
            inner: Arc::new(Inner {
                remote,
                remote_ip: remote_ip.to_string(),
                source,
                ident,
                sink,
                probes: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                epoll_fd: AtomicI32::new(-1),
                wakeup_fd: AtomicI32::new(-1),
            }),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the event loop and wait for it to come up.
    ///
    /// Bounded by 10 s; an initialization failure inside the worker is
    /// reported as [`ProbeError::StartFailed`].
    pub fn start(&self) -> Result<(), ProbeError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            // stopped managers are terminal
            return Err(ProbeError::NotRunning);
        }
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("pathprobe-probes".to_string())
            .spawn(move || event_loop::run(inner, ready_tx))
            .map_err(|e| ProbeError::StartFailed(e.to_string()))?;
        *worker = Some(handle);
        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(ProbeError::StartFailed(message)),
            Err(_) => Err(ProbeError::StartFailed(
                "timed out waiting for the event loop".to_string(),
            )),
        }
    }

    /// Stop the worker, forcing every waiting probe to `Timeout` first so no
    /// outstanding callback is swallowed. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wakeup();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the event loop is up.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The session's 16-bit echo identifier.
    pub fn ident(&self) -> u16 {
        self.inner.ident
    }

    /// The remote address this session probes, as given at construction.
    pub fn remote_ip(&self) -> &str {
        &self.inner.remote_ip
    }

    /// Number of probes currently in flight.
    pub fn queue_size(&self) -> usize {
        self.inner.probes.lock().len()
    }

    /// Submit one probe.
    ///
    /// On success the probe is in flight and its outcome will arrive through
    /// the sink. On error the matching `Unknown` result has already been
    /// delivered synchronously; the error is for the submitter's control
    /// flow only. Callable from any thread.
    pub fn send_probe(&self, request: ProbeRequest) -> Result<(), ProbeError> {
        let Some(remote) = self.inner.remote else {
            let mut ctx = ProbeContext::new(&request, self.inner.remote_ip.clone(), 0);
            ctx.fail(format!(
                "invalid remote address: {}",
                self.inner.remote_ip
            ));
            self.inner.dispatch(ctx);
            return Err(ProbeError::InvalidTarget(self.inner.remote_ip.clone()));
        };
        let overhead = wire_overhead(request.kind, remote);
        let mut ctx = ProbeContext::new(&request, self.inner.remote_ip.clone(), overhead);

        if !self.inner.running.load(Ordering::SeqCst) {
            ctx.fail("probe manager is not running");
            self.inner.dispatch(ctx);
            return Err(ProbeError::NotRunning);
        }

        let domain = if remote.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let protocol = match request.kind {
            ProbeKind::Icmp if remote.is_ipv4() => Protocol::ICMPV4,
            ProbeKind::Icmp => Protocol::ICMPV6,
            ProbeKind::Udp => Protocol::UDP,
        };
        let socket = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => socket,
            Err(e) => {
                error!("error creating socket: {e}");
                ctx.fail(format!("error creating socket: {e}"));
                self.inner.dispatch(ctx);
                return Err(ProbeError::Send(e.to_string()));
            }
        };

        if let Some(source) = self.inner.source {
            let bind_addr = SockAddr::from(SocketAddr::new(source, 0));
            if let Err(e) = socket.bind(&bind_addr) {
                error!("error binding socket: {e}");
                ctx.fail(format!("error binding socket: {e}"));
                self.inner.dispatch(ctx);
                return Err(ProbeError::Send(e.to_string()));
            }
        }

        init_socket(&socket, remote, &ctx, request.detect_mtu);
        ctx.packet = packet::build_probe_packet(
            request.kind,
            remote,
            self.inner.ident,
            ctx.sequence,
            request.size,
            &request.pattern,
        );

        let port = match request.kind {
            ProbeKind::Udp => request.port,
            ProbeKind::Icmp => 0,
        };
        let dest = SockAddr::from(SocketAddr::new(remote, port));

        ctx.tv_sent = now_timeval();
        match socket.send_to(&ctx.packet, &dest) {
            Ok(_) => {}
            // expected while probing the path MTU; the error-queue report follows
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {}
            Err(e) => {
                error!("error sending probe: {e}");
                ctx.fail(format!("error sending probe: {e}"));
                self.inner.dispatch(ctx);
                return Err(ProbeError::Send(e.to_string()));
            }
        }

        let fd = socket.as_raw_fd();
        ctx.socket = Some(socket);
        {
            let mut probes = self.inner.probes.lock();
            // re-check under the same lock the shutdown sweep holds, so a
            // stopping worker cannot miss this probe
            if !self.inner.running.load(Ordering::SeqCst) {
                drop(probes);
                ctx.socket = None;
                ctx.fail("probe manager is not running");
                self.inner.dispatch(ctx);
                return Err(ProbeError::NotRunning);
            }
            debug!(
                fd,
                sequence = ctx.sequence,
                ttl = ctx.ttl,
                "probe registered"
            );
            probes.insert(fd, ctx);
            let mut event = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                u64: fd as u64,
            };
            let epoll_fd = self.inner.epoll_fd.load(Ordering::SeqCst);
            if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } < 0 {
                warn!(
                    "error registering probe socket: {}",
                    io::Error::last_os_error()
                );
            }
        }
        self.inner.wakeup();
        Ok(())
    }
}

impl Drop for ProbeManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configure a freshly created probe socket. Option failures are logged and
/// the probe proceeds with whatever the kernel gave us, like classic ping
/// does.
fn init_socket(socket: &Socket, remote: IpAddr, ctx: &ProbeContext, detect_mtu: bool) {
    let fd = socket.as_raw_fd();
    if ctx.ttl > 0 {
        let res = if remote.is_ipv4() {
            socket.set_ttl(ctx.ttl as u32)
        } else {
            socket.set_unicast_hops_v6(ctx.ttl as u32)
        };
        if let Err(e) = res {
            warn!("error setting TTL: {e}");
        }
    }
    if ctx.timeout_ms > 0 {
        if let Err(e) =
            socket.set_read_timeout(Some(Duration::from_millis(ctx.timeout_ms as u64)))
        {
            warn!("error setting receive timeout: {e}");
        }
    }
    if let Err(e) = socket.set_write_timeout(Some(SEND_TIMEOUT)) {
        warn!("error setting send timeout: {e}");
    }
    if remote.is_ipv4() {
        set_opt_i32(fd, libc::SOL_IP, libc::IP_RECVERR, 1, "recverr");
        set_opt_i32(fd, libc::SOL_IP, libc::IP_RECVTTL, 1, "recvttl");
        if detect_mtu {
            set_opt_i32(
                fd,
                libc::SOL_IP,
                libc::IP_MTU_DISCOVER,
                libc::IP_PMTUDISC_PROBE,
                "mtu discover",
            );
        }
        if let Err(e) = socket.set_tos(libc::IPTOS_LOWDELAY as u32) {
            warn!("error setting tos: {e}");
        }
    } else {
        set_opt_i32(fd, libc::SOL_IPV6, libc::IPV6_RECVERR, 1, "recverr");
        set_opt_i32(fd, libc::SOL_IPV6, libc::IPV6_RECVHOPLIMIT, 1, "recvttl");
        if detect_mtu {
            set_opt_i32(
                fd,
                libc::SOL_IPV6,
                libc::IPV6_MTU_DISCOVER,
                libc::IPV6_PMTUDISC_PROBE,
                "mtu discover",
            );
        }
        set_opt_i32(
            fd,
            libc::SOL_IPV6,
            libc::IPV6_TCLASS,
            libc::IPTOS_LOWDELAY as i32,
            "traffic class",
        );
    }
}

fn set_opt_i32(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int, what: &str) {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res < 0 {
        warn!("error setting {what}: {}", io::Error::last_os_error());
    }
}
