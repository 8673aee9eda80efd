//! Command-line front end for the ping engine: argument parsing, CIDR
//! expansion, log-level gated output, and the blocking/async dispatch.
//!
//! This binary is a thin compatibility layer over the library, the way the
//! original CLI is a thin layer over `socket.py`; it owns no engine logic of
//! its own beyond rendering `Outcome`/`HostSummary` and reacting to SIGINT.

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnetwork::IpNetwork;

use awaping::stats::{AsyncStats, HostSummary, Stats};
use awaping::{asyncping, driver, EngineConfig};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A concurrent ICMP Echo ("ping") engine.
#[derive(Parser, Debug)]
#[command(name = "awaping", about = "Ping one or more hosts, networks, or CIDR ranges concurrently")]
struct Cli {
    /// Hosts, IP literals, or CIDR ranges (e.g. 192.0.2.0/30) to ping.
    #[arg(required = true)]
    addresses: Vec<String>,

    /// Seconds between the start of one sweep and the next.
    #[arg(short = 'i', long = "interval", default_value_t = 1.0)]
    interval: f64,

    /// Seconds to wait for a reply before reporting a timeout.
    #[arg(short = 'w', long = "timeout", default_value_t = 1.0)]
    timeout: f64,

    /// Number of sweeps to run; omit to run until interrupted.
    #[arg(short = 'c', long = "count")]
    count: Option<u32>,

    /// Pace sweeps by a fixed phase from the run's start instead of a fixed
    /// gap after the previous sweep finished.
    #[arg(long = "strict-interval")]
    strict_interval: bool,

    /// Minimum severity to print to stderr.
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Drive the cooperative engine instead of the blocking one.
    #[arg(long = "async")]
    r#async: bool,

    /// Print each result as a JSON object instead of the human-readable line.
    #[arg(long = "json")]
    json: bool,
}

/// Renders one outcome either as its `Display` line or as a JSON object,
/// matching the teacher's own habit of offering a machine-readable response
/// shape alongside a human one (its web API serializes the same result
/// structs it also prints to a terminal).
fn render(outcome: &driver::Outcome, json: bool) -> String {
    if json {
        serde_json::to_string(outcome).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
    } else {
        outcome.to_string()
    }
}

/// Minimal level-gated logger, printing to stderr rather than pulling in a
/// logging facade for a binary this small.
struct Logger {
    level: LogLevel,
}

impl Logger {
    fn log(&self, level: LogLevel, message: &str) {
        if level >= self.level {
            eprintln!("[{level:?}] {message}");
        }
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }
}

/// Expands any token containing a `/` as a CIDR network into every address
/// it covers, the same `subnet.iter().map(IpAddr::V4)` shape a `/24` subnet
/// enumeration uses, generalized here to both address families via
/// `ipnetwork::IpNetwork`. Tokens that don't parse as a
/// network (including plain hostnames, which never contain a `/`) pass
/// through untouched.
fn expand_targets(tokens: &[String], logger: &Logger) -> Vec<String> {
    let mut expanded = Vec::new();
    for token in tokens {
        if !token.contains('/') {
            expanded.push(token.clone());
            continue;
        }
        match token.parse::<IpNetwork>() {
            Ok(IpNetwork::V4(net)) => expanded.extend(net.iter().map(|ip| IpAddr::V4(ip).to_string())),
            Ok(IpNetwork::V6(net)) => expanded.extend(net.iter().map(|ip| IpAddr::V6(ip).to_string())),
            Err(err) => {
                logger.warn(&format!("{token}: not a valid CIDR ({err}), passing through as-is"));
                expanded.push(token.clone());
            }
        }
    }
    expanded
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logger = Logger { level: cli.log_level };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(err) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            logger.warn(&format!("failed to install SIGINT handler: {err}"));
        }
    }

    let targets = expand_targets(&cli.addresses, &logger);
    logger.debug(&format!(
        "resolved {} target token(s) to {} address(es)",
        cli.addresses.len(),
        targets.len()
    ));

    let config = EngineConfig {
        interval: Duration::from_secs_f64(cli.interval.max(0.0)),
        timeout: Some(Duration::from_secs_f64(cli.timeout.max(0.0))),
        count: cli.count,
        strict: cli.strict_interval,
        concurrency_hint: 16,
    };

    if cli.r#async {
        run_async(targets, config, interrupted, &logger, cli.json)
    } else {
        run_blocking(targets, config, interrupted, &logger, cli.json)
    }
}

fn run_blocking(
    targets: Vec<String>,
    config: EngineConfig,
    interrupted: Arc<AtomicBool>,
    logger: &Logger,
    json: bool,
) -> ExitCode {
    let stream = match driver::ping(&targets, config) {
        Ok(stream) => stream,
        Err(err) => {
            logger.log(LogLevel::Error, &format!("failed to start: {err}"));
            return ExitCode::FAILURE;
        }
    };

    let mut stats = Stats::wrap(stream);
    loop {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        match stats.next() {
            Some(outcome) => println!("{}", render(&outcome, json)),
            None => break,
        }
    }

    print_summaries(&stats.summaries());
    ExitCode::SUCCESS
}

fn run_async(
    targets: Vec<String>,
    config: EngineConfig,
    interrupted: Arc<AtomicBool>,
    logger: &Logger,
    json: bool,
) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            logger.log(LogLevel::Error, &format!("failed to start async runtime: {err}"));
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let stream = match asyncping::ping(&targets, config).await {
            Ok(stream) => stream,
            Err(err) => {
                logger.log(LogLevel::Error, &format!("failed to start: {err}"));
                return ExitCode::FAILURE;
            }
        };

        let mut stats = AsyncStats::wrap(stream);
        loop {
            if interrupted.load(Ordering::SeqCst) {
                break;
            }
            match stats.next().await {
                Some(outcome) => println!("{}", render(&outcome, json)),
                None => break,
            }
        }

        print_summaries(&stats.summaries());
        ExitCode::SUCCESS
    })
}

fn print_summaries(summaries: &[(IpAddr, HostSummary)]) {
    if summaries.is_empty() {
        return;
    }
    println!("---");
    for (ip, summary) in summaries {
        println!("{ip}: {summary}");
    }
}
