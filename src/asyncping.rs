//! Cooperative async variant of the ping engine.
//!
//! Shares the sweep algorithm's shape with [`crate::sweep::run_sweep`] (send
//! everything, drain replies until `pending` is empty or a deadline fires,
//! filter stale/unsolicited traffic) but suspends on socket readiness and on
//! the pacer's timer instead of blocking a thread. The socket itself is
//! wrapped in `tokio::io::unix::AsyncFd`, the same readiness-registration
//! primitive a plain non-blocking ICMP pinger in this ecosystem uses.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use crate::codec::{decode_reply, duration_to_wire, encode_request, Family};
use crate::driver::{self, partition_resolved, to_outcome, EngineConfig, Outcome};
use crate::error::EngineError;
use crate::pacer::AsyncPacer;
use crate::resolver::{self, ResolvedHost};
use crate::sweep::{SweepOutcome, SweepResult};

/// A source of outcomes that can be pulled one at a time with `await`.
/// Lets [`crate::stats::AsyncStats`] wrap either [`AsyncPingStream`] or any
/// other async driver without depending on its concrete type.
pub trait OutcomeSource {
    async fn next_outcome(&mut self) -> Option<Outcome>;
}

#[cfg(unix)]
mod unix_endpoint {
    use super::*;
    use std::io;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    use crate::codec::{IP_HEADER_LEN, REQUEST_LEN};
    use crate::endpoint::SocketMode;

    #[cfg(target_os = "linux")]
    fn platform_prepends_ip_header_on_datagram() -> bool {
        false
    }

    #[cfg(not(target_os = "linux"))]
    fn platform_prepends_ip_header_on_datagram() -> bool {
        true
    }

    /// Async counterpart of [`crate::endpoint::Endpoint`]. Construction is
    /// the same raw-then-fallback-to-datagram dance; sending and receiving
    /// register interest on the socket's readiness instead of calling a
    /// blocking syscall with a deadline.
    pub struct AsyncEndpoint {
        async_fd: AsyncFd<Socket>,
        family: Family,
        mode: SocketMode,
        has_outer_ip_header: bool,
        local_port: u16,
    }

    impl AsyncEndpoint {
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
            socket.set_nonblocking(true)?;

            let has_outer_ip_header = match mode {
                SocketMode::Raw => true,
                SocketMode::Datagram => platform_prepends_ip_header_on_datagram(),
            };
            let local_port = match socket.local_addr()?.as_socket() {
                Some(addr) => addr.port(),
                None => 0,
            };

            Ok(Self {
                async_fd: AsyncFd::new(socket)?,
                family,
                mode,
                has_outer_ip_header,
                local_port,
            })
        }

        fn recv_buffer_len(&self) -> usize {
            REQUEST_LEN + if self.has_outer_ip_header { IP_HEADER_LEN } else { 0 }
        }

        pub fn has_outer_ip_header(&self) -> bool {
            self.has_outer_ip_header
        }

        pub fn family(&self) -> Family {
            self.family
        }

        pub fn effective_wire_id(&self, configured: u16) -> u16 {
            if self.mode == SocketMode::Datagram && !self.has_outer_ip_header {
                self.local_port
            } else {
                configured
            }
        }

        pub async fn send_one(&self, ip: IpAddr, bytes: &[u8]) -> io::Result<()> {
            let addr: SockAddr = SocketAddr::new(ip, 0).into();
            let written = self
                .async_fd
                .async_io(Interest::WRITABLE, |socket| socket.send_to(bytes, &addr))
                .await?;
            if written != bytes.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short send: wrote {written} of {} bytes", bytes.len()),
                ));
            }
            Ok(())
        }

        /// Awaits readiness, then performs one non-blocking read. Matches
        /// the `read_one_ping` step of the sweep's readiness callback: a
        /// single datagram per call, left to the caller to loop.
        pub async fn recv_one(&self) -> io::Result<(Vec<u8>, IpAddr)> {
            let mut buf = vec![std::mem::MaybeUninit::new(0u8); self.recv_buffer_len()];
            let (len, from) = self
                .async_fd
                .async_io(Interest::READABLE, |socket| socket.recv_from(&mut buf))
                .await?;
            let bytes: Vec<u8> = buf[..len]
                .iter()
                .map(|b| unsafe { b.assume_init() })
                .collect();
            let peer_ip = from
                .as_socket()
                .map(|addr| addr.ip())
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no peer address"))?;
            Ok((bytes, peer_ip))
        }
    }
}

#[cfg(not(unix))]
mod unix_endpoint {
    use super::*;
    use std::io;

    /// Non-Unix platforms have no `AsyncFd`-style readiness registration in
    /// this crate's dependency set; the async variant is unsupported there
    /// and reports so at construction rather than pretending to work.
    pub struct AsyncEndpoint;

    impl AsyncEndpoint {
        pub fn new(_family: Family) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the async ping variant requires a Unix-like readiness primitive",
            ))
        }

        pub fn has_outer_ip_header(&self) -> bool {
            unreachable!()
        }
        pub fn family(&self) -> Family {
            unreachable!()
        }
        pub fn effective_wire_id(&self, _configured: u16) -> u16 {
            unreachable!()
        }
        pub async fn send_one(&self, _ip: IpAddr, _bytes: &[u8]) -> io::Result<()> {
            unreachable!()
        }
        pub async fn recv_one(&self) -> io::Result<(Vec<u8>, IpAddr)> {
            unreachable!()
        }
    }
}

pub use unix_endpoint::AsyncEndpoint;

/// Async equivalent of [`crate::sweep::run_sweep`]: sends one request per
/// destination, then awaits readiness until every destination answers or
/// `timeout` elapses (enforced with `tokio::time::timeout` rather than a
/// blocking deadline).
pub async fn run_sweep_async(
    endpoint: &AsyncEndpoint,
    ips: &[IpAddr],
    id: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Vec<SweepResult>, EngineError> {
    let epoch = tokio::time::Instant::now();
    let expected_id = endpoint.effective_wire_id(id);
    let family = endpoint.family();

    let mut pending: HashMap<IpAddr, ()> = ips.iter().map(|ip| (*ip, ())).collect();
    // See `sweep::run_sweep`: results are pushed in the order they become
    // known (send failures, then arrival-order replies), and the
    // end-of-sweep timeout/unreachable block for whatever's left in
    // `pending` is appended last, in `ips`' order.
    let mut results: Vec<SweepResult> = Vec::with_capacity(ips.len());
    let mut unreachable: HashMap<IpAddr, (u8, u8, f64)> = HashMap::new();

    for &ip in ips {
        let packet = encode_request(family, id, sequence, duration_to_wire(epoch.elapsed()));
        if let Err(err) = endpoint.send_one(ip, &packet).await {
            pending.remove(&ip);
            results.push(SweepResult {
                ip,
                outcome: SweepOutcome::Send(err.to_string()),
            });
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;

    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, endpoint.recv_one()).await {
            Err(_elapsed) => break,
            Ok(Err(io_err)) => return Err(EngineError::Socket(io_err)),
            Ok(Ok((bytes, from))) => {
                let reply = match decode_reply(&bytes, endpoint.has_outer_ip_header()) {
                    Ok(reply) => reply,
                    Err(_) => continue,
                };
                if reply.is_destination_unreachable() {
                    if pending.contains_key(&from) {
                        let now = epoch.elapsed().as_secs_f64();
                        unreachable.insert(from, (reply.kind, reply.code, now));
                    }
                    continue;
                }
                if reply.id != expected_id || reply.sequence != sequence {
                    continue;
                }
                if pending.remove(&from).is_none() {
                    continue;
                }
                let now = epoch.elapsed().as_secs_f64();
                let sent_at = reply.time_sent.unwrap_or(0.0);
                let rtt = Duration::from_secs_f64((now - sent_at).max(0.0));
                results.push(SweepResult {
                    ip: from,
                    outcome: SweepOutcome::Reply {
                        kind: reply.kind,
                        code: reply.code,
                        time_sent: sent_at,
                        time_received: now,
                        rtt,
                        size: reply.size,
                    },
                });
            }
        }
    }

    for &ip in ips {
        if !pending.contains_key(&ip) {
            continue;
        }
        let outcome = match unreachable.remove(&ip) {
            Some((kind, code, time_received)) => SweepOutcome::Unreachable {
                kind,
                code,
                time_received,
            },
            None => SweepOutcome::Timeout,
        };
        results.push(SweepResult { ip, outcome });
    }

    Ok(results)
}

/// Cooperative counterpart of [`crate::driver::PingStream`]. Consumers pull
/// items with [`AsyncPingStream::next`] instead of `Iterator::next`;
/// dropping the stream mid-sweep releases the socket and deregisters its
/// readiness interest at the next await point, same as any other dropped
/// future.
pub struct AsyncPingStream {
    endpoint: AsyncEndpoint,
    wire_id: u16,
    addr_map: HashMap<IpAddr, Vec<ResolvedHost>>,
    ips: Vec<IpAddr>,
    timeout: Duration,
    sequences: driver::SequenceClock,
    pacer: AsyncPacer,
    pending_errors: Vec<Outcome>,
    buffer: VecDeque<Outcome>,
    started: bool,
    done: bool,
}

impl AsyncPingStream {
    async fn refill(&mut self) -> bool {
        let Some(sequence) = self.sequences.next() else {
            return false;
        };

        match run_sweep_async(&self.endpoint, &self.ips, self.wire_id, sequence, self.timeout).await {
            Ok(results) => {
                for result in results {
                    let labels = self.addr_map.get(&result.ip).cloned().unwrap_or_default();
                    for label in labels {
                        self.buffer.push_back(to_outcome(&label, sequence, &result.outcome));
                    }
                }
                true
            }
            Err(_) => {
                self.done = true;
                false
            }
        }
    }

    /// Pulls the next outcome, suspending on the pacer or the sweep's
    /// readiness/timer as needed. Returns `None` once the run's sequence
    /// count (if any) is exhausted.
    pub async fn next(&mut self) -> Option<Outcome> {
        if let Some(error) = self.pending_errors.pop() {
            return Some(error);
        }
        loop {
            if let Some(outcome) = self.buffer.pop_front() {
                return Some(outcome);
            }
            if self.done || self.ips.is_empty() {
                return None;
            }
            if self.started {
                self.pacer.wait().await;
            }
            self.started = true;
            if !self.refill().await {
                return None;
            }
        }
    }
}

impl OutcomeSource for AsyncPingStream {
    async fn next_outcome(&mut self) -> Option<Outcome> {
        self.next().await
    }
}

/// Async equivalent of [`crate::driver::ping`]. Resolution runs every input
/// concurrently (see [`crate::resolver::async_resolve`]); everything past
/// that point shares [`partition_resolved`] and [`to_outcome`] with the
/// blocking driver.
pub async fn ping(
    inputs: &[String],
    config: EngineConfig,
) -> Result<AsyncPingStream, EngineError> {
    let (addr_map, order, resolution_errors) = resolver::async_resolve(inputs).await;
    let (family, addr_map, ips, pending_errors) = partition_resolved(addr_map, order, resolution_errors);

    let endpoint = AsyncEndpoint::new(family)?;
    let timeout = config.timeout.unwrap_or(Duration::from_secs(3600 * 24));

    Ok(AsyncPingStream {
        endpoint,
        wire_id: driver::new_wire_id(),
        addr_map,
        ips,
        timeout,
        sequences: driver::SequenceClock::new(config.count),
        pacer: AsyncPacer::new(config.interval, config.strict),
        pending_errors,
        buffer: VecDeque::new(),
        started: false,
        done: false,
    })
}
