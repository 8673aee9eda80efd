//! Online per-destination statistics, layered over the result stream.
//!
//! `Stats` wraps any `Iterator<Item = Outcome>` (or, via [`AsyncStats`], the
//! async driver's stream) and annotates each passing item with the running
//! min/max/avg RTT and loss for that item's destination, the way `ping -c`
//! prints a cumulative summary line as replies come in rather than only at
//! the end.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::driver::Outcome;

/// A snapshot of one destination's running statistics, attached to every
/// `Outcome` for that destination once a `Stats` wrapper is in the pipeline.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub nb_requests: u64,
    pub nb_ok: u64,
    pub nb_errors: u64,
    pub min_time: Duration,
    pub max_time: Duration,
    pub avg_time: Duration,
    pub accum_time: Duration,
    pub loss: f64,
}

/// Mutable per-destination accumulator. `Stats` keeps one of these per IP
/// for the lifetime of the run.
#[derive(Debug, Clone, Copy, Default)]
struct HostStats {
    total: u64,
    ok: u64,
    errors: u64,
    min_rtt: Duration,
    max_rtt: Duration,
    sum_rtt: Duration,
}

impl HostStats {
    fn record(&mut self, rtt: Option<Duration>) {
        self.total += 1;
        match rtt {
            Some(rtt) => {
                self.ok += 1;
                self.sum_rtt += rtt;
                self.min_rtt = if self.ok == 1 { rtt } else { self.min_rtt.min(rtt) };
                self.max_rtt = self.max_rtt.max(rtt);
            }
            None => self.errors += 1,
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let avg = if self.ok > 0 {
            self.sum_rtt / self.ok as u32
        } else {
            Duration::ZERO
        };
        StatsSnapshot {
            nb_requests: self.total,
            nb_ok: self.ok,
            nb_errors: self.errors,
            min_time: self.min_rtt,
            max_time: self.max_rtt,
            avg_time: avg,
            accum_time: self.sum_rtt,
            loss: self.errors as f64 / self.total as f64,
        }
    }
}

/// Final per-host summary, the kind `ping -c N` prints when a run ends.
#[derive(Debug, Clone, Copy)]
pub struct HostSummary {
    pub total: u64,
    pub ok: u64,
    pub loss_pct: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

impl fmt::Display for HostSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets transmitted, {} received, {:.1}% packet loss / rtt min/max/avg (ms) = {:.3}/{:.3}/{:.3}",
            self.total, self.ok, self.loss_pct, self.min_ms, self.max_ms, self.avg_ms
        )
    }
}

/// Iterator adapter that annotates each `Outcome` with its destination's
/// running statistics and remembers enough to format a final summary once
/// the underlying stream is exhausted.
pub struct Stats<I> {
    inner: I,
    hosts: HashMap<IpAddr, HostStats>,
}

impl<I> Stats<I> {
    pub fn wrap(inner: I) -> Self {
        Self {
            inner,
            hosts: HashMap::new(),
        }
    }

    /// Per-destination summaries for every host with at least one success,
    /// in the style `ping` prints on exit. Hosts that never replied once
    /// (pure resolution failures, or a destination that never answered in
    /// the whole run) are omitted: only targets that were ever reachable
    /// get a summary line.
    pub fn summaries(&self) -> Vec<(IpAddr, HostSummary)> {
        self.hosts
            .iter()
            .filter(|(_, stats)| stats.ok > 0)
            .map(|(ip, stats)| {
                let snap = stats.snapshot();
                (
                    *ip,
                    HostSummary {
                        total: snap.nb_requests,
                        ok: snap.nb_ok,
                        loss_pct: snap.loss * 100.0,
                        min_ms: snap.min_time.as_secs_f64() * 1000.0,
                        max_ms: snap.max_time.as_secs_f64() * 1000.0,
                        avg_ms: snap.avg_time.as_secs_f64() * 1000.0,
                    },
                )
            })
            .collect()
    }

    fn annotate(&mut self, mut outcome: Outcome) -> Outcome {
        let Some(ip) = outcome.ip else {
            return outcome;
        };
        let rtt = if outcome.error.is_none() { outcome.time } else { None };
        let stats = self.hosts.entry(ip).or_default();
        stats.record(rtt);
        outcome.stats = Some(stats.snapshot());
        outcome
    }
}

impl<I: Iterator<Item = Outcome>> Iterator for Stats<I> {
    type Item = Outcome;

    fn next(&mut self) -> Option<Outcome> {
        let outcome = self.inner.next()?;
        Some(self.annotate(outcome))
    }
}

/// Async equivalent of [`Stats`], driving any source with an `async fn
/// next(&mut self) -> Option<Outcome>` method (the shape both
/// [`crate::asyncping::AsyncPingStream`] and this wrapper itself expose).
pub struct AsyncStats<S> {
    inner: S,
    hosts: HashMap<IpAddr, HostStats>,
}

impl<S> AsyncStats<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            hosts: HashMap::new(),
        }
    }

    pub fn summaries(&self) -> Vec<(IpAddr, HostSummary)> {
        Stats {
            inner: std::iter::empty::<Outcome>(),
            hosts: self.hosts.clone(),
        }
        .summaries()
    }
}

impl<S> AsyncStats<S>
where
    S: crate::asyncping::OutcomeSource,
{
    pub async fn next(&mut self) -> Option<Outcome> {
        let outcome = self.inner.next_outcome().await?;
        let Some(ip) = outcome.ip else {
            return Some(outcome);
        };
        let rtt = if outcome.error.is_none() { outcome.time } else { None };
        let stats = self.hosts.entry(ip).or_default();
        stats.record(rtt);
        let mut outcome = outcome;
        outcome.stats = Some(stats.snapshot());
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok_outcome(ip: &str, rtt_ms: u64) -> Outcome {
        Outcome {
            ip: Some(ip.parse().unwrap()),
            host: ip.to_string(),
            sequence: 1,
            time_sent: Some(0.0),
            time_received: Some(rtt_ms as f64 / 1000.0),
            time: Some(Duration::from_millis(rtt_ms)),
            size: Some(64),
            kind: Some(0),
            code: Some(0),
            error: None,
            stats: None,
        }
    }

    fn timeout_outcome(ip: &str) -> Outcome {
        Outcome {
            ip: Some(ip.parse().unwrap()),
            host: ip.to_string(),
            sequence: 2,
            time_sent: None,
            time_received: None,
            time: None,
            size: None,
            kind: None,
            code: None,
            error: Some("request timed out".to_string()),
            stats: None,
        }
    }

    #[test]
    fn annotates_running_stats_across_two_outcomes() {
        let outcomes = vec![ok_outcome("10.0.0.1", 10), timeout_outcome("10.0.0.1")];
        let mut stats = Stats::wrap(outcomes.into_iter());

        let first = stats.next().unwrap();
        let snap = first.stats.unwrap();
        assert_eq!(snap.nb_requests, 1);
        assert_eq!(snap.nb_ok, 1);
        assert_eq!(snap.nb_errors, 0);
        assert_eq!(snap.loss, 0.0);

        let second = stats.next().unwrap();
        let snap = second.stats.unwrap();
        assert_eq!(snap.nb_requests, 2);
        assert_eq!(snap.nb_ok, 1);
        assert_eq!(snap.nb_errors, 1);
        assert_eq!(snap.loss, 0.5);
        assert_eq!(snap.min_time, Duration::from_millis(10));
        assert_eq!(snap.max_time, Duration::from_millis(10));
        assert_eq!(snap.avg_time, Duration::from_millis(10));

        assert!(stats.next().is_none());
    }

    #[test]
    fn summary_omits_hosts_with_no_successes() {
        let outcomes = vec![timeout_outcome("10.0.0.2")];
        let mut stats = Stats::wrap(outcomes.into_iter());
        while stats.next().is_some() {}
        assert!(stats.summaries().is_empty());
    }

    #[test]
    fn summary_formats_like_ping_c() {
        let outcomes = vec![ok_outcome("10.0.0.1", 10), ok_outcome("10.0.0.1", 20)];
        let mut stats = Stats::wrap(outcomes.into_iter());
        while stats.next().is_some() {}
        let summaries = stats.summaries();
        assert_eq!(summaries.len(), 1);
        let (_, summary) = &summaries[0];
        assert_eq!(summary.total, 2);
        assert_eq!(summary.ok, 2);
        assert_eq!(summary.loss_pct, 0.0);
        let text = summary.to_string();
        assert!(text.contains("2 packets transmitted"));
        assert!(text.contains("0.0% packet loss"));
    }
}
