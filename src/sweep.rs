//! Per-sequence-number sweep state machine.
//!
//! One sweep sends an Echo request carrying `sequence` to every destination
//! in `ips`, then drains the shared socket until every destination has
//! replied or the deadline passes. Two kinds of incoming noise are filtered
//! rather than acted on: a reply whose sequence number doesn't match the
//! current sweep (left over from a previous, already-timed-out sweep) and a
//! reply from an address that isn't (or is no longer) pending, which would
//! otherwise let a duplicate or spoofed reply double-count a destination.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::codec::{decode_reply, duration_to_wire, encode_request, Family};
use crate::endpoint::{RecvError, Transport};
use crate::error::EngineError;

/// What happened to one destination during a single sweep.
#[derive(Debug, Clone)]
pub enum SweepOutcome {
    Reply {
        kind: u8,
        code: u8,
        time_sent: f64,
        time_received: f64,
        rtt: Duration,
        size: usize,
    },
    Unreachable {
        kind: u8,
        code: u8,
        time_received: f64,
    },
    Timeout,
    Send(String),
}

#[derive(Debug, Clone)]
pub struct SweepResult {
    pub ip: IpAddr,
    pub outcome: SweepOutcome,
}

/// Sends one Echo request to every address in `ips` and collects replies
/// until either all have answered or `timeout` elapses, in which case the
/// destinations still outstanding are reported as `SweepOutcome::Timeout`.
///
/// `id` is the wire identifier to request; the identifier actually matched
/// against incoming replies is `transport.effective_wire_id(id)`, which
/// accounts for kernels that rewrite it to the socket's local port.
pub fn run_sweep<T: Transport>(
    transport: &T,
    ips: &[IpAddr],
    id: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Vec<SweepResult>, EngineError> {
    let epoch = Instant::now();
    let expected_id = transport.effective_wire_id(id);
    let family = transport.family();

    let mut pending: HashMap<IpAddr, ()> = ips.iter().map(|ip| (*ip, ())).collect();
    // Results are pushed in the order they become known: send failures as
    // they're discovered during the send loop, then replies in the order
    // they arrive during the receive loop. The end-of-sweep block for
    // whatever is still in `pending` (timeouts and any bookkept Destination
    // Unreachable) is appended last, in `ips`' order, matching §4.4/§5's
    // guarantee that arrival-order replies precede the timeout block.
    let mut results: Vec<SweepResult> = Vec::with_capacity(ips.len());
    // Destination Unreachable doesn't answer the echo request, so it must
    // not remove its sender from `pending`; it's remembered here so the
    // timeout path can report it instead of a plain timeout if the deadline
    // fires while the sender is still pending.
    let mut unreachable: HashMap<IpAddr, (u8, u8, f64)> = HashMap::new();

    for &ip in ips {
        let packet = encode_request(family, id, sequence, duration_to_wire(epoch.elapsed()));
        if let Err(err) = transport.send_one(ip, &packet) {
            pending.remove(&ip);
            results.push(SweepResult {
                ip,
                outcome: SweepOutcome::Send(err.to_string()),
            });
        }
    }

    let deadline = Instant::now() + timeout;

    while !pending.is_empty() {
        match transport.try_recv_one(Some(deadline)) {
            Ok((bytes, from)) => {
                let reply = match decode_reply(&bytes, transport.has_outer_ip_header()) {
                    Ok(reply) => reply,
                    Err(_) => continue, // malformed or foreign datagram, ignore
                };
                if reply.is_destination_unreachable() {
                    // Unreachable notifications don't carry the original
                    // sequence in a way we trust for this simple codec,
                    // so only bookkeep one for an IP that's still pending.
                    if pending.contains_key(&from) {
                        let now = epoch.elapsed().as_secs_f64();
                        unreachable.insert(from, (reply.kind, reply.code, now));
                    }
                    continue;
                }
                if reply.id != expected_id || reply.sequence != sequence {
                    continue; // stale: belongs to an earlier or foreign sweep
                }
                if pending.remove(&from).is_none() {
                    continue; // unsolicited or duplicate reply for this sweep
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
            Err(RecvError::Timeout) => break,
            Err(RecvError::Fatal(source)) => return Err(EngineError::Socket(source)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::mock::MockTransport;
    use crate::codec::encode_request;

    fn reply_packet(family: Family, id: u16, sequence: u16, sent_at: f64, kind_override: Option<u8>) -> Vec<u8> {
        let mut packet = encode_request(family, id, sequence, sent_at).to_vec();
        if let Some(kind) = kind_override {
            packet[0] = kind;
            packet[2] = 0;
            packet[3] = 0;
            let csum = crate::codec::checksum(&packet);
            packet[2..4].copy_from_slice(&csum.to_be_bytes());
        } else {
            packet[0] = 0; // ICMPv4 echo reply
            packet[2] = 0;
            packet[3] = 0;
            let csum = crate::codec::checksum(&packet);
            packet[2..4].copy_from_slice(&csum.to_be_bytes());
        }
        packet
    }

    #[test]
    fn all_replies_arrive_before_deadline() {
        let transport = MockTransport::new();
        let ip_a: IpAddr = "10.0.0.1".parse().unwrap();
        let ip_b: IpAddr = "10.0.0.2".parse().unwrap();
        transport.push_reply(reply_packet(Family::V4, 7, 1, 0.0, None), ip_a);
        transport.push_reply(reply_packet(Family::V4, 7, 1, 0.0, None), ip_b);

        let results = run_sweep(&transport, &[ip_a, ip_b], 7, 1, Duration::from_millis(50)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r.outcome, SweepOutcome::Reply { .. })));
    }

    #[test]
    fn arrival_order_replies_precede_the_end_of_sweep_timeout_block() {
        let transport = MockTransport::new();
        let ip_a: IpAddr = "10.0.0.1".parse().unwrap();
        let ip_b: IpAddr = "10.0.0.2".parse().unwrap();
        // Only B replies; A is never answered and must time out. A is
        // listed first in `ips`, so a naive ips-order result would emit the
        // timeout before the reply.
        transport.push_reply(reply_packet(Family::V4, 7, 1, 0.0, None), ip_b);

        let results = run_sweep(&transport, &[ip_a, ip_b], 7, 1, Duration::from_millis(20)).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].ip, ip_b);
        assert!(matches!(results[0].outcome, SweepOutcome::Reply { .. }));
        assert_eq!(results[1].ip, ip_a);
        assert!(matches!(results[1].outcome, SweepOutcome::Timeout));
    }

    #[test]
    fn missing_reply_times_out() {
        let transport = MockTransport::new();
        let ip_a: IpAddr = "10.0.0.1".parse().unwrap();
        let results = run_sweep(&transport, &[ip_a], 7, 1, Duration::from_millis(20)).unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, SweepOutcome::Timeout));
    }

    #[test]
    fn stale_sequence_is_ignored() {
        let transport = MockTransport::new();
        let ip_a: IpAddr = "10.0.0.1".parse().unwrap();
        // Reply belongs to sequence 0, the sweep is running sequence 1.
        transport.push_reply(reply_packet(Family::V4, 7, 0, 0.0, None), ip_a);
        let results = run_sweep(&transport, &[ip_a], 7, 1, Duration::from_millis(20)).unwrap();
        assert!(matches!(results[0].outcome, SweepOutcome::Timeout));
    }

    #[test]
    fn unsolicited_address_is_ignored() {
        let transport = MockTransport::new();
        let ip_a: IpAddr = "10.0.0.1".parse().unwrap();
        let stranger: IpAddr = "10.0.0.9".parse().unwrap();
        transport.push_reply(reply_packet(Family::V4, 7, 1, 0.0, None), stranger);
        let results = run_sweep(&transport, &[ip_a], 7, 1, Duration::from_millis(20)).unwrap();
        assert!(matches!(results[0].outcome, SweepOutcome::Timeout));
    }

    #[test]
    fn destination_unreachable_is_reported_distinctly_from_timeout() {
        let transport = MockTransport::new();
        let ip_a: IpAddr = "10.0.0.1".parse().unwrap();
        let mut packet = [0u8; crate::codec::HEADER_LEN].to_vec();
        packet[0] = 3; // Destination Unreachable
        packet[1] = 1; // host unreachable
        packet[6..8].copy_from_slice(&1u16.to_be_bytes());
        packet[4..6].copy_from_slice(&7u16.to_be_bytes());
        transport.push_reply(packet, ip_a);
        let results = run_sweep(&transport, &[ip_a], 7, 1, Duration::from_millis(20)).unwrap();
        assert!(matches!(
            results[0].outcome,
            SweepOutcome::Unreachable { kind: 3, code: 1, .. }
        ));
    }
}
