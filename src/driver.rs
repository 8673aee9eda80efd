//! Composition root for the blocking ping engine: resolves inputs, owns the
//! socket and sequence clock, and turns per-sweep [`SweepOutcome`]s back
//! into user-facing [`Outcome`]s labeled with the original input strings.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::codec::Family;
use crate::endpoint::{Endpoint, Transport};
use crate::error::EngineError;
use crate::pacer::Pacer;
use crate::resolver::{self, ResolvedHost};
use crate::stats::StatsSnapshot;
use crate::sweep::{run_sweep, SweepOutcome};

/// Engine-wide knobs. Mirrors the CLI's own defaults so a library caller
/// gets ping(8)-like behavior without having to know them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub count: Option<u32>,
    pub strict: bool,
    /// Bounds how many concurrent DNS lookups the async resolver runs; the
    /// blocking variant ignores it (its resolution is sequential).
    pub concurrency_hint: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(1)),
            count: None,
            strict: false,
            concurrency_hint: 16,
        }
    }
}

/// One destination's result for one sweep. `error` is set, and `time`/`size`
/// are absent, whenever no echo reply arrived in time, the input never
/// resolved, or the destination answered Destination Unreachable. `stats` is
/// populated only when the stream passes through a [`crate::stats::Stats`]
/// wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub ip: Option<IpAddr>,
    pub host: String,
    pub sequence: u16,
    pub time_sent: Option<f64>,
    pub time_received: Option<f64>,
    pub time: Option<Duration>,
    pub size: Option<usize>,
    pub kind: Option<u8>,
    pub code: Option<u8>,
    pub error: Option<String>,
    pub stats: Option<StatsSnapshot>,
}

impl Outcome {
    fn resolution_failure(input: String, reason: String, sequence: u16) -> Self {
        Outcome {
            ip: None,
            host: input,
            sequence,
            time_sent: None,
            time_received: None,
            time: None,
            size: None,
            kind: None,
            code: None,
            error: Some(reason),
            stats: None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.ip, self.time, self.size) {
            (Some(reason), Some(ip), _, _) => write!(f, "{} ({ip}): {reason}", self.host),
            (Some(reason), None, _, _) => write!(f, "{}: {reason}", self.host),
            (None, Some(ip), Some(rtt), Some(size)) => write!(
                f,
                "{size} bytes from {} ({ip}): icmp_seq={} time={:.2} ms",
                self.host,
                self.sequence,
                rtt.as_secs_f64() * 1000.0
            ),
            _ => write!(f, "{}: no result", self.host),
        }
    }
}

/// Generates a 16-bit identifier that is unique enough to distinguish this
/// engine's own packets from unrelated ICMP traffic, the way the original
/// derives one from a random UUID's low bits.
pub(crate) fn new_wire_id() -> u16 {
    (uuid::Uuid::new_v4().as_u128() & 0xffff) as u16
}

/// Yields sweep sequence numbers 1..=65535, wrapping back to 1, stopping
/// after `count` sweeps if given. Shared by the blocking and async drivers.
pub(crate) struct SequenceClock {
    next: u16,
    remaining: Option<u32>,
}

impl SequenceClock {
    pub(crate) fn new(count: Option<u32>) -> Self {
        Self {
            next: 1,
            remaining: count,
        }
    }
}

impl Iterator for SequenceClock {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let seq = self.next;
        self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
        Some(seq)
    }
}

/// Lazily drives the sweep/pacer state machine over a concrete transport,
/// re-attaching every originating input label to each outcome it yields.
pub struct PingStream<T: Transport> {
    transport: T,
    wire_id: u16,
    addr_map: HashMap<IpAddr, Vec<ResolvedHost>>,
    ips: Vec<IpAddr>,
    timeout: Duration,
    sequences: SequenceClock,
    pacer: Pacer,
    pending_errors: Vec<Outcome>,
    buffer: std::collections::VecDeque<Outcome>,
    started: bool,
    done: bool,
}

impl<T: Transport> PingStream<T> {
    /// Runs the next sweep and appends its outcomes to `buffer`. Returns
    /// `false` once the sequence clock is exhausted (finite `count`
    /// reached) or the transport failed fatally.
    fn refill(&mut self) -> bool {
        let Some(sequence) = self.sequences.next() else {
            return false;
        };

        match run_sweep(
            &self.transport,
            &self.ips,
            self.wire_id,
            sequence,
            self.timeout,
        ) {
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
}

pub(crate) fn to_outcome(label: &ResolvedHost, sequence: u16, outcome: &SweepOutcome) -> Outcome {
    match outcome {
        SweepOutcome::Reply {
            kind,
            code,
            time_sent,
            time_received,
            rtt,
            size,
        } => Outcome {
            ip: Some(label.ip),
            host: label.display_host.clone(),
            sequence,
            time_sent: Some(*time_sent),
            time_received: Some(*time_received),
            time: Some(*rtt),
            size: Some(*size),
            kind: Some(*kind),
            code: Some(*code),
            error: None,
            stats: None,
        },
        SweepOutcome::Unreachable {
            kind,
            code,
            time_received,
        } => {
            let reason = crate::codec::unreachable_reason(*code)
                .unwrap_or("destination unreachable")
                .to_string();
            Outcome {
                ip: Some(label.ip),
                host: label.display_host.clone(),
                sequence,
                time_sent: None,
                time_received: Some(*time_received),
                time: None,
                size: None,
                kind: Some(*kind),
                code: Some(*code),
                error: Some(reason),
                stats: None,
            }
        }
        SweepOutcome::Timeout => Outcome {
            ip: Some(label.ip),
            host: label.display_host.clone(),
            sequence,
            time_sent: None,
            time_received: None,
            time: None,
            size: None,
            kind: None,
            code: None,
            error: Some("request timed out".to_string()),
            stats: None,
        },
        SweepOutcome::Send(reason) => Outcome {
            ip: Some(label.ip),
            host: label.display_host.clone(),
            sequence,
            time_sent: None,
            time_received: None,
            time: None,
            size: None,
            kind: None,
            code: None,
            error: Some(reason.clone()),
            stats: None,
        },
    }
}

impl<T: Transport> Iterator for PingStream<T> {
    type Item = Outcome;

    fn next(&mut self) -> Option<Outcome> {
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
                self.pacer.wait();
            }
            self.started = true;
            if !self.refill() {
                return None;
            }
        }
    }
}

/// Picks the engine's address family from the first-seen resolved IP, drops
/// any resolved IP of the other family (reporting it the same way a
/// resolution failure would be reported), and turns up-front resolution
/// failures into ready-made `Outcome`s. Shared by the blocking and async
/// drivers so the family/error bookkeeping lives in exactly one place.
///
/// `order` carries the IPs' first-seen insertion order from the resolver
/// (a plain `HashMap` has no reproducible iteration order of its own); it is
/// filtered the same way `addr_map` is and returned so a sweep's send order,
/// and the end-of-sweep timeout block's order, are deterministic instead of
/// riding the map's internal layout.
pub(crate) fn partition_resolved(
    mut addr_map: HashMap<IpAddr, Vec<ResolvedHost>>,
    order: Vec<IpAddr>,
    resolution_errors: Vec<EngineError>,
) -> (Family, HashMap<IpAddr, Vec<ResolvedHost>>, Vec<IpAddr>, Vec<Outcome>) {
    let family = order
        .first()
        .map(|ip| match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        })
        .unwrap_or(Family::V4);

    let mut family_mismatch_errors = Vec::new();
    let ordered_ips: Vec<IpAddr> = order
        .into_iter()
        .filter(|ip| {
            let matches = matches!(
                (ip, family),
                (IpAddr::V4(_), Family::V4) | (IpAddr::V6(_), Family::V6)
            );
            if !matches {
                if let Some(labels) = addr_map.remove(ip) {
                    for label in labels {
                        family_mismatch_errors.push(Outcome::resolution_failure(
                            label.input,
                            "address family does not match this engine run's socket".to_string(),
                            0,
                        ));
                    }
                }
            }
            matches
        })
        .collect();

    let mut pending_errors: Vec<Outcome> = resolution_errors
        .into_iter()
        .map(|err| match err {
            EngineError::Resolution { input, reason } => {
                Outcome::resolution_failure(input, reason, 0)
            }
            other => Outcome::resolution_failure("<unknown>".to_string(), other.to_string(), 0),
        })
        .collect();
    pending_errors.extend(family_mismatch_errors);

    (family, addr_map, ordered_ips, pending_errors)
}

/// Resolves `inputs`, picks an address family from the first-seen resolved
/// IP, opens one socket for the run, and returns a lazy stream of per-sweep
/// results labeled with the caller's original strings.
///
/// Inputs that fail to resolve up front are emitted as `Outcome`s with
/// `error` set before any sweep begins; an `IpAddr` whose family doesn't
/// match the socket's (for example an AAAA result when the run picked
/// IPv4) is reported the same way rather than silently dropped.
pub fn ping(
    inputs: &[String],
    config: EngineConfig,
) -> Result<PingStream<Endpoint>, EngineError> {
    let (addr_map, order, resolution_errors) = resolver::resolve(inputs);
    let (family, addr_map, ips, pending_errors) = partition_resolved(addr_map, order, resolution_errors);

    let transport = Endpoint::new(family)?;
    let timeout = config.timeout.unwrap_or(Duration::from_secs(3600 * 24));

    Ok(PingStream {
        transport,
        wire_id: new_wire_id(),
        addr_map,
        ips,
        timeout,
        sequences: SequenceClock::new(config.count),
        pacer: Pacer::new(config.interval, config.strict),
        pending_errors,
        buffer: std::collections::VecDeque::new(),
        started: false,
        done: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::mock::MockTransport;
    use crate::codec::encode_request;

    fn build_stream(transport: MockTransport, ips: Vec<IpAddr>, count: u32) -> PingStream<MockTransport> {
        let mut addr_map = HashMap::new();
        for ip in &ips {
            addr_map.insert(
                *ip,
                vec![ResolvedHost {
                    input: ip.to_string(),
                    ip: *ip,
                    display_host: ip.to_string(),
                }],
            );
        }
        PingStream {
            transport,
            wire_id: 42,
            addr_map,
            ips,
            timeout: Duration::from_millis(20),
            sequences: SequenceClock::new(Some(count)),
            pacer: Pacer::new(Duration::from_millis(1), false),
            pending_errors: Vec::new(),
            buffer: std::collections::VecDeque::new(),
            started: false,
            done: false,
        }
    }

    #[test]
    fn emits_one_outcome_per_destination_per_sweep() {
        let transport = MockTransport::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let mut packet = encode_request(Family::V4, 42, 1, 0.0).to_vec();
        packet[0] = 0;
        packet[2] = 0;
        packet[3] = 0;
        let csum = crate::codec::checksum(&packet);
        packet[2..4].copy_from_slice(&csum.to_be_bytes());
        transport.push_reply(packet, ip);

        let stream = build_stream(transport, vec![ip], 1);
        let outcomes: Vec<_> = stream.collect();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].sequence, 1);
        assert!(outcomes[0].error.is_none());
    }

    #[test]
    fn sequence_clock_wraps_after_u16_max() {
        let mut clock = SequenceClock {
            next: u16::MAX,
            remaining: Some(2),
        };
        assert_eq!(clock.next(), Some(u16::MAX));
        assert_eq!(clock.next(), Some(1));
        assert_eq!(clock.next(), None);
    }

    #[test]
    fn finite_count_terminates_the_stream() {
        let transport = MockTransport::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let stream = build_stream(transport, vec![ip], 2);
        let outcomes: Vec<_> = stream.collect();
        // No replies queued: two sweeps, each times out the single destination.
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.error.is_some()));
    }
}
