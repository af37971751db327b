//! The manager's worker: epoll loop, receive paths, timeout sweep, reaping

use super::context::{now_timeval, timeval_diff_usec, ProbeStatus, INCOMING_BUFFER_SIZE};
use super::Inner;
use crate::addr;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, error, trace};

const MAX_EVENTS: usize = 32;

/// `struct sock_extended_err` as the kernel lays it out in an
/// `IP_RECVERR` / `IPV6_RECVERR` control message. The offending router's
/// sockaddr follows immediately after.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// Worker entry point. Readiness (or the setup failure) is reported once
/// through `ready`; after that every outcome flows through the sink.
pub(super) fn run(inner: Arc<Inner>, ready: Sender<Result<(), String>>) {
    let (epoll_fd, wakeup_fd) = match setup_epoll() {
        Ok(fds) => fds,
        Err(message) => {
            error!("error setting up event loop: {message}");
            let _ = ready.send(Err(message));
            return;
        }
    };
    inner.epoll_fd.store(epoll_fd, Ordering::SeqCst);
    inner.wakeup_fd.store(wakeup_fd, Ordering::SeqCst);
    inner.running.store(true, Ordering::SeqCst);
    let _ = ready.send(Ok(()));

    let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
    while inner.running.load(Ordering::SeqCst) {
        let timeout = min_wait_time(&inner);
        let n = unsafe {
            libc::epoll_wait(epoll_fd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!("epoll_wait failed: {err}");
            break;
        }
        for event in events.iter().take(n as usize) {
            let fd = event.u64 as RawFd;
            if fd == wakeup_fd {
                let mut counter: u64 = 0;
                unsafe {
                    libc::read(
                        wakeup_fd,
                        &mut counter as *mut u64 as *mut libc::c_void,
                        8,
                    );
                }
                continue;
            }
            read_data(&inner, fd);
        }
        check_timeouts(&inner);
        reap_finished(&inner, epoll_fd);
    }

    shutdown_sweep(&inner, epoll_fd);
    inner.epoll_fd.store(-1, Ordering::SeqCst);
    inner.wakeup_fd.store(-1, Ordering::SeqCst);
    inner.running.store(false, Ordering::SeqCst);
    unsafe {
        libc::close(wakeup_fd);
        libc::close(epoll_fd);
    }
}

fn setup_epoll() -> Result<(RawFd, RawFd), String> {
    let epoll_fd = unsafe { libc::epoll_create1(0) };
    if epoll_fd < 0 {
        return Err(format!("error creating epoll: {}", io::Error::last_os_error()));
    }
    let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    if wakeup_fd < 0 {
        let err = format!("error creating wakeup fd: {}", io::Error::last_os_error());
        unsafe { libc::close(epoll_fd) };
        return Err(err);
    }
    let mut event = libc::epoll_event {
        events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
        u64: wakeup_fd as u64,
    };
    if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wakeup_fd, &mut event) } < 0 {
        let err = format!(
            "error registering wakeup fd: {}",
            io::Error::last_os_error()
        );
        unsafe {
            libc::close(wakeup_fd);
            libc::close(epoll_fd);
        }
        return Err(err);
    }
    Ok((epoll_fd, wakeup_fd))
}

/// Milliseconds until the earliest pending probe deadline, or -1 to block
/// indefinitely. Probes with a non-positive timeout never contribute a
/// deadline.
fn min_wait_time(inner: &Inner) -> libc::c_int {
    let probes = inner.probes.lock();
    let now = now_timeval();
    let mut min_wait: i64 = -1;
    for ctx in probes.values() {
        if ctx.status != ProbeStatus::Waiting || ctx.timeout_ms <= 0 {
            continue;
        }
        let remaining = (ctx.timeout_ms - ctx.elapsed_ms(now)).max(0);
        if min_wait == -1 || remaining < min_wait {
            min_wait = remaining;
        }
    }
    min_wait.clamp(-1, libc::c_int::MAX as i64) as libc::c_int
}

/// Escalate every waiting probe whose deadline has passed.
fn check_timeouts(inner: &Inner) {
    let mut probes = inner.probes.lock();
    let now = now_timeval();
    for ctx in probes.values_mut() {
        if ctx.status == ProbeStatus::Waiting
            && ctx.timeout_ms > 0
            && ctx.elapsed_ms(now) >= ctx.timeout_ms
        {
            trace!(sequence = ctx.sequence, "probe timed out");
            ctx.status = ProbeStatus::Timeout;
        }
    }
}

/// Unregister, remove and close every finished probe, then deliver its
/// callback outside the lock. The worker is the only dispatcher, so the
/// callback order is its iteration order.
fn reap_finished(inner: &Inner, epoll_fd: RawFd) {
    let mut finished = Vec::new();
    {
        let mut probes = inner.probes.lock();
        let done: Vec<RawFd> = probes
            .iter()
            .filter(|(_, ctx)| ctx.status != ProbeStatus::Waiting)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in done {
            unsafe {
                libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut());
            }
            if let Some(ctx) = probes.remove(&fd) {
                finished.push(ctx);
            }
        }
    }
    for ctx in finished {
        inner.dispatch(ctx);
    }
}

/// Final sweep on shutdown: force remaining probes to `Timeout` and drain the
/// map in one locked pass, so a submission racing the shutdown either lands
/// before the sweep or observes the cleared running flag.
fn shutdown_sweep(inner: &Inner, epoll_fd: RawFd) {
    let mut finished = Vec::new();
    {
        let mut probes = inner.probes.lock();
        let fds: Vec<RawFd> = probes.keys().copied().collect();
        for fd in fds {
            unsafe {
                libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut());
            }
            if let Some(mut ctx) = probes.remove(&fd) {
                if ctx.status == ProbeStatus::Waiting {
                    ctx.status = ProbeStatus::Timeout;
                }
                finished.push(ctx);
            }
        }
    }
    debug!(count = finished.len(), "draining probes on shutdown");
    for ctx in finished {
        inner.dispatch(ctx);
    }
}

/// Classify a readable probe socket.
///
/// Pass 1 reads the error queue: an extended-error control message turns the
/// probe into `NetError` with the offender address and raw error fields.
/// Pass 2 reads ordinary data and marks `Success`. Receive timestamps come
/// from `SIOCGSTAMP` so queueing inside the host does not inflate the RTT.
/// A readable socket that yields neither is reaped as `Timeout`.
fn read_data(inner: &Inner, fd: RawFd) {
    let mut probes = inner.probes.lock();
    let Some(ctx) = probes.get_mut(&fd) else {
        return;
    };
    let family = match inner.remote {
        Some(remote) if remote.is_ipv4() => libc::AF_INET,
        Some(_) => libc::AF_INET6,
        None => return,
    };

    ctx.tv_received = now_timeval();
    ctx.status = ProbeStatus::Timeout;
    ctx.reply.resize(INCOMING_BUFFER_SIZE, 0);

    let mut flags = libc::MSG_ERRQUEUE;
    for _pass in 0..2 {
        let mut control = [0u8; 1024];
        let mut iov = libc::iovec {
            iov_base: ctx.reply.as_mut_ptr() as *mut libc::c_void,
            iov_len: ctx.reply.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        let data_len = unsafe { libc::recvmsg(fd, &mut msg, flags | libc::MSG_DONTWAIT) };
        if data_len >= 0 {
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let level = (*cmsg).cmsg_level;
                    let kind = (*cmsg).cmsg_type;
                    if (level == libc::SOL_IP && kind == libc::IP_RECVERR)
                        || (level == libc::SOL_IPV6 && kind == libc::IPV6_RECVERR)
                    {
                        let data = libc::CMSG_DATA(cmsg);
                        let err = ptr::read_unaligned(data as *const SockExtendedErr);
                        let offender = data.add(mem::size_of::<SockExtendedErr>());
                        ctx.offender = addr::sockaddr_to_ip(offender, family)
                            .map(addr::format_ip)
                            .unwrap_or_default();
                        ctx.err_no = err.ee_errno;
                        ctx.err_code = err.ee_code;
                        ctx.err_type = err.ee_origin;
                        ctx.err_info = err.ee_info;
                        ctx.status = ProbeStatus::NetError;
                        stamp_rx_time(fd, &mut ctx.tv_received);
                    } else if (level == libc::SOL_IP && kind == libc::IP_TTL)
                        || (level == libc::SOL_IPV6 && kind == libc::IPV6_HOPLIMIT)
                    {
                        ctx.reply_ttl = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const i32);
                    }
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
            if flags == 0 {
                ctx.status = ProbeStatus::Success;
                stamp_rx_time(fd, &mut ctx.tv_received);
                ctx.reply.truncate(data_len as usize);
            }
        }
        if ctx.status == ProbeStatus::NetError {
            break;
        }
        flags = 0;
    }
    trace!(
        sequence = ctx.sequence,
        elapsed_usec = timeval_diff_usec(ctx.tv_received, ctx.tv_sent),
        status = ?ctx.status,
        "probe socket drained"
    );
}

/// Read the kernel's receive timestamp for the last packet on this socket.
/// Falls back to the wall-clock stamp already taken when unavailable.
const SIOCGSTAMP: libc::c_ulong = 0x8906;

fn stamp_rx_time(fd: RawFd, tv: &mut libc::timeval) {
    unsafe {
        libc::ioctl(fd, SIOCGSTAMP, tv as *mut libc::timeval);
    }
}
