//! Textual address helpers
//!
//! The engine consumes pre-resolved textual addresses, so parsing tries the
//! IPv4 form first and falls back to IPv6, mirroring the family detection the
//! kernel-facing layer needs. Formatting uses the canonical `Display` form.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Parse a textual address as IPv4, then as IPv6.
pub(crate) fn parse_ip(text: &str) -> Option<IpAddr> {
    if let Ok(v4) = text.parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }
    text.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
}

/// Canonical textual form of an address.
pub(crate) fn format_ip(addr: IpAddr) -> String {
    addr.to_string()
}

/// Read an address out of a raw `sockaddr`, trusting `family` for the layout.
///
/// Used to format the `SO_EE_OFFENDER` address that follows a
/// `sock_extended_err` in an error-queue control message.
///
/// # Safety
///
/// `ptr` must point to at least `sockaddr_in` (for `AF_INET`) or
/// `sockaddr_in6` (for `AF_INET6`) readable bytes.
pub(crate) unsafe fn sockaddr_to_ip(ptr: *const u8, family: i32) -> Option<IpAddr> {
    match family {
        libc::AF_INET => {
            let sa = std::ptr::read_unaligned(ptr as *const libc::sockaddr_in);
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sa = std::ptr::read_unaligned(ptr as *const libc::sockaddr_in6);
            Some(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_parse_v4() {
        assert_eq!(
            parse_ip("192.0.2.7"),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)))
        );
    }

    #[test]
    fn test_parse_v6() {
        assert_eq!(
            parse_ip("2001:db8::1"),
            Some(IpAddr::V6("2001:db8::1".parse().unwrap()))
        );
    }

    #[test]
    fn test_parse_rejects_hostnames() {
        assert_eq!(parse_ip("example.com"), None);
        assert_eq!(parse_ip(""), None);
        assert_eq!(parse_ip("192.0.2"), None);
    }

    #[test]
    fn test_format_parse_round_trip() {
        for text in ["127.0.0.1", "203.0.113.255", "::1", "2001:db8::dead:beef"] {
            let parsed = parse_ip(text).unwrap();
            assert_eq!(format_ip(parsed), text);
        }
    }

    #[test]
    fn test_format_canonicalizes_v6() {
        let parsed = parse_ip("2001:0db8:0000:0000:0000:0000:0000:0001").unwrap();
        assert_eq!(format_ip(parsed), "2001:db8::1");
    }

    #[test]
    fn test_sockaddr_round_trip_v4() {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_addr.s_addr = u32::from(Ipv4Addr::new(198, 51, 100, 23)).to_be();
        let ip = unsafe { sockaddr_to_ip(&sa as *const _ as *const u8, libc::AF_INET) };
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 23))));
    }

    #[test]
    fn test_sockaddr_round_trip_v6() {
        let addr: Ipv6Addr = "2001:db8::42".parse().unwrap();
        let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa.sin6_addr.s6_addr = addr.octets();
        let ip = unsafe { sockaddr_to_ip(&sa as *const _ as *const u8, libc::AF_INET6) };
        assert_eq!(ip, Some(IpAddr::V6(addr)));
    }

    #[test]
    fn test_sockaddr_unknown_family() {
        let sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let ip = unsafe { sockaddr_to_ip(&sa as *const _ as *const u8, libc::AF_UNSPEC) };
        assert_eq!(ip, None);
    }
}
