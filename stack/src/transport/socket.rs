// TERN STACK — TRANSPORT: SOCKET MODULE
// The POSIX-shaped surface. (AF_INET, SOCK_STREAM, TCP) descriptors are
// ours and route to the engine; every other combination — and every
// descriptor we don't own — falls through to the host kernel unchanged.
// The engine itself is process-global and comes up lazily on first use.

use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::os::unix::io::RawFd;

use crate::runtime::SockErr;
use crate::stack::{global_stack, Stack};

fn engine() -> &'static Stack {
    global_stack()
}

// ============================================================================
// ADDRESS CONVERSION
// ============================================================================

fn to_parts(addr: &SocketAddrV4) -> (u32, u16) {
    (u32::from(*addr.ip()), addr.port())
}

fn from_parts(addr: u32, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::from(addr), port)
}

fn sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is repr(C); all-zeroes is a valid bit pattern.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

// ============================================================================
// SOCKET CALLS
// ============================================================================

/// Only (AF_INET, SOCK_STREAM, 0|TCP) is ours; anything else goes to the
/// host kernel.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> Result<RawFd, SockErr> {
    if domain != libc::AF_INET
        || ty != libc::SOCK_STREAM
        || (protocol != 0 && protocol != libc::IPPROTO_TCP)
    {
        // SAFETY: plain socket(2) passthrough.
        let fd = unsafe { libc::socket(domain, ty, protocol) };
        return if fd < 0 { Err(SockErr::last_os()) } else { Ok(fd) };
    }
    engine().tcp.socket()
}

pub fn bind(fd: RawFd, addr: SocketAddrV4) -> Result<(), SockErr> {
    if !engine().tcp.owns(fd) {
        let sin = sockaddr_in(&addr);
        // SAFETY: bind(2) passthrough with a correctly sized sockaddr_in.
        let rc = unsafe {
            libc::bind(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        return if rc < 0 { Err(SockErr::last_os()) } else { Ok(()) };
    }
    let (a, p) = to_parts(&addr);
    engine().tcp.bind(fd, a, p)
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<(), SockErr> {
    if !engine().tcp.owns(fd) {
        // SAFETY: listen(2) passthrough.
        let rc = unsafe { libc::listen(fd, backlog) };
        return if rc < 0 { Err(SockErr::last_os()) } else { Ok(()) };
    }
    engine().tcp.listen(fd, backlog)
}

pub fn connect(fd: RawFd, addr: SocketAddrV4) -> Result<(), SockErr> {
    if !engine().tcp.owns(fd) {
        let sin = sockaddr_in(&addr);
        // SAFETY: connect(2) passthrough with a correctly sized sockaddr_in.
        let rc = unsafe {
            libc::connect(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        return if rc < 0 { Err(SockErr::last_os()) } else { Ok(()) };
    }
    let (a, p) = to_parts(&addr);
    engine().tcp.connect(fd, a, p)
}

pub fn accept(fd: RawFd) -> Result<(RawFd, SocketAddrV4), SockErr> {
    if !engine().tcp.owns(fd) {
        // SAFETY: accept(2) passthrough with an out sockaddr_in.
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // SAFETY: valid out-pointers for the peer address.
        let conn = unsafe {
            libc::accept(
                fd,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if conn < 0 {
            return Err(SockErr::last_os());
        }
        let peer = from_parts(u32::from_be(sin.sin_addr.s_addr), u16::from_be(sin.sin_port));
        return Ok((conn, peer));
    }
    let (conn, (a, p)) = engine().tcp.accept(fd)?;
    Ok((conn, from_parts(a, p)))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, SockErr> {
    if !engine().tcp.owns(fd) {
        // SAFETY: read(2) passthrough into a live buffer.
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        return if rc < 0 { Err(SockErr::last_os()) } else { Ok(rc as usize) };
    }
    engine().tcp.read(fd, buf)
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, SockErr> {
    if !engine().tcp.owns(fd) {
        // SAFETY: write(2) passthrough from a live buffer.
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        return if rc < 0 { Err(SockErr::last_os()) } else { Ok(rc as usize) };
    }
    engine().tcp.write(fd, buf)
}

pub fn close(fd: RawFd) -> Result<(), SockErr> {
    if !engine().tcp.owns(fd) {
        // SAFETY: close(2) passthrough.
        let rc = unsafe { libc::close(fd) };
        return if rc < 0 { Err(SockErr::last_os()) } else { Ok(()) };
    }
    engine().tcp.close(fd)
}

// ============================================================================
// ADDRESS RESOLUTION
// ============================================================================

/// The hint subset we answer ourselves.
#[derive(Debug, Clone, Copy)]
pub struct AddrHints {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub flags: i32,
}

impl Default for AddrHints {
    fn default() -> Self {
        AddrHints {
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
            flags: 0,
        }
    }
}

/// A thin literal-address parser for (IPv4, stream, TCP). Anything it
/// can't answer — names, other families, other hints — falls through to
/// the host resolver.
pub fn getaddrinfo(
    node: Option<&str>,
    service: Option<&str>,
    hints: Option<&AddrHints>,
) -> Result<Vec<SocketAddrV4>, SockErr> {
    let hints_ok = hints.map_or(true, |h| {
        h.family == libc::AF_INET
            && h.socktype == libc::SOCK_STREAM
            && (h.protocol == 0 || h.protocol == libc::IPPROTO_TCP)
            && h.flags == 0
    });

    let literal = node.map_or(Some(Ipv4Addr::UNSPECIFIED), |n| n.parse::<Ipv4Addr>().ok());
    let port = match service {
        Some(s) => s.parse::<u16>().ok(),
        None => Some(0),
    };

    if hints_ok {
        if let (Some(addr), Some(port)) = (literal, port) {
            if node.is_some() || service.is_some() {
                return Ok(vec![SocketAddrV4::new(addr, port)]);
            }
        }
    }

    // Not a literal we understand: hand the question to the host resolver.
    let host = node.unwrap_or("0.0.0.0");
    let port = match service {
        Some(s) => s.parse::<u16>().map_err(|_| SockErr::BadArg)?,
        None => 0,
    };
    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let v4: Vec<SocketAddrV4> = addrs
                .filter_map(|a| match a {
                    std::net::SocketAddr::V4(v4) => Some(v4),
                    _ => None,
                })
                .collect();
            if v4.is_empty() {
                Err(SockErr::AddrUnavailable)
            } else {
                Ok(v4)
            }
        }
        Err(_) => Err(SockErr::AddrUnavailable),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_parse_stays_in_house() {
        let got = getaddrinfo(Some("10.100.2.3"), Some("2345"), Some(&AddrHints::default())).unwrap();
        assert_eq!(got, vec!["10.100.2.3:2345".parse().unwrap()]);
    }

    #[test]
    fn missing_node_is_wildcard() {
        let got = getaddrinfo(None, Some("80"), None).unwrap();
        assert_eq!(got[0], SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80));
    }

    #[test]
    fn out_of_range_service_is_not_ours() {
        // 70000 doesn't fit a port; the fallthrough resolver rejects it too.
        assert!(getaddrinfo(Some("10.0.0.1"), Some("70000"), None).is_err());
    }
}
