//! Name and address resolution.
//!
//! Collapses the caller's input list down to the unique IP addresses that
//! need a socket send, while remembering every label (hostname or literal)
//! each IP was reached under, so results can be re-attached to every input
//! string that named them. Mirrors `resolve_addresses()` in the Python
//! original's `socket.py`: IP literals are recognized without a DNS round
//! trip, and a reverse lookup fills in a display hostname on a best-effort
//! basis.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{OnceLock, RwLock};

use dns_lookup::{lookup_addr, lookup_host};

use crate::error::EngineError;

/// One input's resolution outcome: the IP it mapped to, plus a hostname to
/// show the user if one could be reverse-resolved.
#[derive(Debug, Clone)]
pub struct ResolvedHost {
    pub input: String,
    pub ip: IpAddr,
    pub display_host: String,
}

/// Process-wide forward-lookup cache, keyed by the exact input string. The
/// teacher's `mdns_lookup` module uses the same `OnceLock<RwLock<HashMap>>>`
/// shape to avoid re-querying the network for a name already resolved this
/// process.
fn forward_cache() -> &'static RwLock<HashMap<String, Vec<IpAddr>>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Vec<IpAddr>>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn reverse_cache() -> &'static RwLock<HashMap<IpAddr, String>> {
    static CACHE: OnceLock<RwLock<HashMap<IpAddr, String>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn forward_lookup(input: &str) -> Result<Vec<IpAddr>, EngineError> {
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    if let Some(hit) = forward_cache().read().unwrap().get(input) {
        return Ok(hit.clone());
    }

    let ips = lookup_host(input).map_err(|err| EngineError::Resolution {
        input: input.to_string(),
        reason: err.to_string(),
    })?;
    if ips.is_empty() {
        return Err(EngineError::Resolution {
            input: input.to_string(),
            reason: "no addresses found".to_string(),
        });
    }

    forward_cache()
        .write()
        .unwrap()
        .insert(input.to_string(), ips.clone());
    Ok(ips)
}

/// Reverse-resolves `ip` to a hostname, falling back to the address's
/// string form if the lookup fails. Matches the original's
/// `gethostbyaddr`-with-`OSError`-fallback behavior: a missing PTR record
/// is not an error worth surfacing, just a less friendly display string.
fn reverse_lookup(ip: IpAddr) -> String {
    if let Some(hit) = reverse_cache().read().unwrap().get(&ip) {
        return hit.clone();
    }
    let host = lookup_addr(&ip).unwrap_or_else(|_| ip.to_string());
    reverse_cache().write().unwrap().insert(ip, host.clone());
    host
}

/// Resolves every input string, returning a map from the *unique* IPs that
/// need sending to, to every input label that named them, the order those
/// IPs were first seen in (so a sweep's send/timeout order is reproducible
/// instead of riding a `HashMap`'s iteration order), plus the list of inputs
/// that failed outright. The label list lets one IP reached under two
/// different names (`localhost` and `127.0.0.1`) appear once on the wire and
/// still produce a result line for each name.
pub fn resolve(
    inputs: &[String],
) -> (HashMap<IpAddr, Vec<ResolvedHost>>, Vec<IpAddr>, Vec<EngineError>) {
    let mut addr_map: HashMap<IpAddr, Vec<ResolvedHost>> = HashMap::new();
    let mut order: Vec<IpAddr> = Vec::new();
    let mut errors = Vec::new();

    for input in inputs {
        match forward_lookup(input) {
            Ok(ips) => {
                // Only the first address a name resolves to is pinged; a
                // caller wanting every A/AAAA record names them individually.
                let ip = ips[0];
                let display_host = if input.parse::<IpAddr>().is_ok() {
                    reverse_lookup(ip)
                } else {
                    input.clone()
                };
                if !addr_map.contains_key(&ip) {
                    order.push(ip);
                }
                addr_map.entry(ip).or_default().push(ResolvedHost {
                    input: input.clone(),
                    ip,
                    display_host,
                });
            }
            Err(err) => errors.push(err),
        }
    }

    (addr_map, order, errors)
}

/// Async equivalent of [`resolve`]. `dns_lookup` is blocking, so each
/// input's resolution runs on a blocking-pool thread via
/// `tokio::task::spawn_blocking`, and the results are joined concurrently
/// rather than resolved one at a time. Unlike the blocking variant, the
/// first-seen order here follows the order lookups *complete* in, not the
/// order `inputs` names them, since the resolutions race; this is still
/// deterministic for a given run's completion order and is what the sweep's
/// send/timeout block is built from.
pub async fn async_resolve(
    inputs: &[String],
) -> (HashMap<IpAddr, Vec<ResolvedHost>>, Vec<IpAddr>, Vec<EngineError>) {
    let tasks = inputs.iter().cloned().map(|input| {
        tokio::task::spawn_blocking(move || {
            let result = forward_lookup(&input);
            (input, result)
        })
    });

    let joined = futures::future::join_all(tasks).await;

    let mut addr_map: HashMap<IpAddr, Vec<ResolvedHost>> = HashMap::new();
    let mut order: Vec<IpAddr> = Vec::new();
    let mut errors = Vec::new();

    for outcome in joined {
        let (input, result) = match outcome {
            Ok(pair) => pair,
            Err(join_err) => {
                errors.push(EngineError::Resolution {
                    input: "<unknown>".to_string(),
                    reason: join_err.to_string(),
                });
                continue;
            }
        };
        match result {
            Ok(ips) => {
                let ip = ips[0];
                let display_host = if input.parse::<IpAddr>().is_ok() {
                    reverse_lookup(ip)
                } else {
                    input.clone()
                };
                if !addr_map.contains_key(&ip) {
                    order.push(ip);
                }
                addr_map.entry(ip).or_default().push(ResolvedHost {
                    input,
                    ip,
                    display_host,
                });
            }
            Err(err) => errors.push(err),
        }
    }

    (addr_map, order, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literal_resolves_without_lookup() {
        let inputs = vec!["127.0.0.1".to_string()];
        let (addr_map, order, errors) = resolve(&inputs);
        assert!(errors.is_empty());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(addr_map.contains_key(&ip));
        assert_eq!(order, vec![ip]);
    }

    #[test]
    fn duplicate_literal_inputs_collapse_to_one_ip_with_two_labels() {
        let inputs = vec!["127.0.0.1".to_string(), "127.0.0.1".to_string()];
        let (addr_map, order, _errors) = resolve(&inputs);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(addr_map.get(&ip).unwrap().len(), 2);
        // A repeated input must not push the IP onto `order` a second time.
        assert_eq!(order, vec![ip]);
    }

    #[test]
    fn order_reflects_first_seen_sequence_not_insertion_into_the_map() {
        let first: IpAddr = "127.0.0.2".parse().unwrap();
        let second: IpAddr = "127.0.0.1".parse().unwrap();
        let inputs = vec![first.to_string(), second.to_string(), first.to_string()];
        let (_addr_map, order, _errors) = resolve(&inputs);
        assert_eq!(order, vec![first, second]);
    }

    #[test]
    fn unresolvable_name_is_reported_as_an_error_not_a_panic() {
        let inputs = vec!["this-name-should-never-resolve.invalid".to_string()];
        let (addr_map, order, errors) = resolve(&inputs);
        assert!(addr_map.is_empty());
        assert!(order.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
