//! ICMP socket abstraction.
//!
//! `Endpoint` owns a single socket used to send to every destination and to
//! receive whatever replies land on it, instead of one socket per
//! destination. It tries a raw ICMP socket first (needs `CAP_NET_RAW` /
//! root) and falls back to an unprivileged datagram ("ping") socket rather
//! than escalating privileges.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::codec::{Family, IP_HEADER_LEN, REQUEST_LEN};

/// What a blocking receive attempt can fail with.
#[derive(Debug)]
pub enum RecvError {
    /// No datagram arrived before the deadline.
    Timeout,
    /// The receive path itself failed; fatal for the engine run.
    Fatal(io::Error),
}

impl From<io::Error> for RecvError {
    fn from(err: io::Error) -> Self {
        RecvError::Fatal(err)
    }
}

/// Whether the kernel hands ICMP datagrams back with a 20-octet IPv4
/// header glued on the front. True for raw sockets on every platform, and
/// for unprivileged datagram ICMP sockets on BSD-derived kernels (macOS);
/// false for unprivileged datagram ICMP on Linux, which strips it.
#[cfg(target_os = "linux")]
fn platform_prepends_ip_header_on_datagram() -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn platform_prepends_ip_header_on_datagram() -> bool {
    true
}

/// The socket mode an `Endpoint` ended up with after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    Raw,
    Datagram,
}

/// Capability set the sweep engine needs from a transport: send to one
/// destination, block-with-deadline for one reply, and report the framing
/// quirks of the receive path.
pub trait Transport {
    fn send_one(&self, ip: IpAddr, bytes: &[u8]) -> io::Result<()>;
    fn try_recv_one(&self, deadline: Option<Instant>) -> Result<(Vec<u8>, IpAddr), RecvError>;
    fn has_outer_ip_header(&self) -> bool;
    /// The identifier replies will actually carry: the caller's configured
    /// wire id, unless the kernel rewrote it to the socket's ephemeral
    /// source port (unprivileged datagram ICMP without an outer header).
    fn effective_wire_id(&self, configured: u16) -> u16;
    fn family(&self) -> Family;
}

/// A single ICMP socket shared by every destination of one engine run.
pub struct Endpoint {
    socket: Socket,
    family: Family,
    mode: SocketMode,
    has_outer_ip_header: bool,
    local_port: u16,
}

impl Endpoint {
    pub fn new(family: Family) -> io::Result<Self> {
        let (domain, protocol) = match family {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, mode) = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(socket) => (socket, SocketMode::Raw),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
                (socket, SocketMode::Datagram)
            }
            Err(err) => return Err(err),
        };

        let bind_addr: SocketAddr = match family {
            Family::V4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
            Family::V6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket.bind(&bind_addr.into())?;

        let has_outer_ip_header = match mode {
            SocketMode::Raw => true,
            SocketMode::Datagram => platform_prepends_ip_header_on_datagram(),
        };

        let local_port = match socket.local_addr()?.as_socket() {
            Some(addr) => addr.port(),
            None => 0,
        };

        Ok(Self {
            socket,
            family,
            mode,
            has_outer_ip_header,
            local_port,
        })
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    fn recv_buffer_len(&self) -> usize {
        REQUEST_LEN + if self.has_outer_ip_header { IP_HEADER_LEN } else { 0 }
    }
}

impl Transport for Endpoint {
    fn send_one(&self, ip: IpAddr, bytes: &[u8]) -> io::Result<()> {
        let addr: SockAddr = SocketAddr::new(ip, 0).into();
        let written = self.socket.send_to(bytes, &addr)?;
        if written != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: wrote {written} of {} bytes", bytes.len()),
            ));
        }
        Ok(())
    }

    fn try_recv_one(&self, deadline: Option<Instant>) -> Result<(Vec<u8>, IpAddr), RecvError> {
        let timeout = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(RecvError::Timeout);
                }
                Some(remaining)
            }
            None => None,
        };
        self.socket.set_read_timeout(timeout)?;

        let mut buf = vec![std::mem::MaybeUninit::new(0u8); self.recv_buffer_len()];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(result) => result,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(RecvError::Timeout);
            }
            Err(err) => return Err(RecvError::Fatal(err)),
        };

        // Safety: `recv_from` guarantees the first `len` slots were
        // initialized by the kernel.
        let bytes: Vec<u8> = buf[..len]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();
        let peer_ip = from
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| RecvError::Fatal(io::Error::new(io::ErrorKind::Other, "no peer address")))?;
        Ok((bytes, peer_ip))
    }

    fn has_outer_ip_header(&self) -> bool {
        self.has_outer_ip_header
    }

    fn effective_wire_id(&self, configured: u16) -> u16 {
        if self.mode == SocketMode::Datagram && !self.has_outer_ip_header {
            self.local_port
        } else {
            configured
        }
    }

    fn family(&self) -> Family {
        self.family
    }
}

/// An in-memory transport used to exercise the sweep engine deterministically
/// in tests, without any live socket or raw-socket privilege.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Mutex<Vec<(IpAddr, Vec<u8>)>>,
        pub inbox: Mutex<VecDeque<(Vec<u8>, IpAddr)>>,
        pub has_outer_ip_header: bool,
        pub family: FamilySlot,
    }

    #[derive(Clone, Copy)]
    pub struct FamilySlot(pub Family);
    impl Default for FamilySlot {
        fn default() -> Self {
            FamilySlot(Family::V4)
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_reply(&self, bytes: Vec<u8>, from: IpAddr) {
            self.inbox.lock().unwrap().push_back((bytes, from));
        }
    }

    impl Transport for MockTransport {
        fn send_one(&self, ip: IpAddr, bytes: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push((ip, bytes.to_vec()));
            Ok(())
        }

        fn try_recv_one(&self, deadline: Option<Instant>) -> Result<(Vec<u8>, IpAddr), RecvError> {
            if let Some(item) = self.inbox.lock().unwrap().pop_front() {
                return Ok(item);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(RecvError::Timeout);
                }
            }
            Err(RecvError::Timeout)
        }

        fn has_outer_ip_header(&self) -> bool {
            self.has_outer_ip_header
        }

        fn effective_wire_id(&self, configured: u16) -> u16 {
            configured
        }

        fn family(&self) -> Family {
            self.family.0
        }
    }
}
