//! focusd - relay and subscriber processes for Focus Drive
//!
//! Commands:
//! - relay: read band power from a source, score it, fan out to consumers
//! - subscribe: run a game or dashboard consumer
//! - doctor: diagnose configuration and ports
//! - schema: print the wire message schema

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use focus_drive::config::{default_port, resolve, ConsumerConfig, RelayConfig};
use focus_drive::consumer::{run_consumer, ConsumerAdapter, DashboardSink, GameSink};
use focus_drive::relay::{spawn_listener, Relay, UdpTransport};
use focus_drive::session::SessionMachine;
use focus_drive::source::{create_source, SourceSpec};
use focus_drive::types::{LinkHealth, Phase, RelayMode, Role};
use focus_drive::{pipeline, wire, FocusError, FOCUS_VERSION, PRODUCER_NAME};

const DEFAULT_LOG_FILTER: &str = "focus_drive=info,focusd=info";

/// focusd - attention scores from band power, distributed over UDP
#[derive(Parser)]
#[command(name = "focusd")]
#[command(version = FOCUS_VERSION)]
#[command(about = "Score band power into attention and fan it out to game and dashboard consumers", long_about = None)]
struct Cli {
    /// Log filter, e.g. "debug" or "focus_drive=trace" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the distribution relay
    Relay {
        /// Which consumer roles to serve
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Upstream source: synthetic[:seed], stdin, file:<path>, udp:<addr>
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        game_host: Option<String>,

        #[arg(long)]
        game_port: Option<u16>,

        #[arg(long)]
        dashboard_host: Option<String>,

        #[arg(long)]
        dashboard_port: Option<u16>,

        /// Raw band-power threshold used by the score transform
        #[arg(long)]
        threshold: Option<f64>,

        /// Seconds between published scores (0 publishes every sample)
        #[arg(long)]
        update_interval: Option<f64>,

        /// Seconds without a sample before the upstream counts as disconnected
        #[arg(long)]
        timeout: Option<f64>,

        /// Address to accept consumer hello datagrams on
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Seconds an implicitly registered consumer survives without a hello
        #[arg(long)]
        liveness: Option<f64>,

        /// Derive the ready threshold from the first scores of the stream
        #[arg(long)]
        calibrate: bool,

        /// Relay configuration file (JSON); flags override it
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a consumer
    Subscribe {
        #[arg(long, value_enum, default_value = "game")]
        role: RoleArg,

        /// Host to bind the receive socket on
        #[arg(long)]
        bind: Option<String>,

        /// Port to receive on (defaults to the role's port)
        #[arg(long)]
        port: Option<u16>,

        /// Relay registration address to send hello datagrams to
        #[arg(long)]
        relay: Option<SocketAddr>,

        /// Player name recorded in finish records
        #[arg(long)]
        player: Option<String>,

        /// Append finish records as NDJSON to this file (use - for stdout)
        #[arg(long)]
        results: Option<PathBuf>,

        /// Start a new race after each finish
        #[arg(long)]
        repeat: bool,

        /// Consumer configuration file (JSON); flags override it
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and port availability
    Doctor {
        /// Relay configuration file to validate
        #[arg(long)]
        relay_config: Option<PathBuf>,

        /// Consumer configuration file to validate
        #[arg(long)]
        consumer_config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the wire message schema
    Schema {
        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Game,
    Dashboard,
    Both,
}

impl From<ModeArg> for RelayMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Game => RelayMode::Game,
            ModeArg::Dashboard => RelayMode::Dashboard,
            ModeArg::Both => RelayMode::Both,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Game,
    Dashboard,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Game => Role::Game,
            RoleArg::Dashboard => Role::Dashboard,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), FocusCliError> {
    match cli.command {
        Commands::Relay {
            mode,
            source,
            game_host,
            game_port,
            dashboard_host,
            dashboard_port,
            threshold,
            update_interval,
            timeout,
            listen,
            liveness,
            calibrate,
            config,
        } => {
            let mut relay_config = match config {
                Some(path) => RelayConfig::load_from_file(path)?,
                None => RelayConfig::default(),
            };
            if let Some(mode) = mode {
                relay_config.mode = mode.into();
            }
            if let Some(source) = source {
                relay_config.source = source;
            }
            if let Some(host) = game_host {
                relay_config.game_host = host;
            }
            if let Some(port) = game_port {
                relay_config.game_port = port;
            }
            if let Some(host) = dashboard_host {
                relay_config.dashboard_host = host;
            }
            if let Some(port) = dashboard_port {
                relay_config.dashboard_port = port;
            }
            if let Some(threshold) = threshold {
                relay_config.threshold = threshold;
            }
            if let Some(interval) = update_interval {
                relay_config.update_interval = interval;
            }
            if let Some(timeout) = timeout {
                relay_config.connection_timeout = timeout;
            }
            if listen.is_some() {
                relay_config.listen = listen;
            }
            if let Some(liveness) = liveness {
                relay_config.liveness_window = liveness;
            }
            relay_config.calibrate |= calibrate;
            cmd_relay(relay_config)
        }
        Commands::Subscribe {
            role,
            bind,
            port,
            relay,
            player,
            results,
            repeat,
            config,
        } => {
            let mut consumer_config = match config {
                Some(path) => ConsumerConfig::load_from_file(path)?,
                None => ConsumerConfig::default(),
            };
            consumer_config.role = role.into();
            if let Some(bind) = bind {
                consumer_config.bind_host = bind;
            }
            if port.is_some() {
                consumer_config.port = port;
            }
            if relay.is_some() {
                consumer_config.relay = relay;
            }
            if let Some(player) = player {
                consumer_config.session.player_id = player;
            }
            cmd_subscribe(consumer_config, results.as_deref(), repeat)
        }
        Commands::Doctor {
            relay_config,
            consumer_config,
            json,
        } => cmd_doctor(relay_config.as_deref(), consumer_config.as_deref(), json),
        Commands::Schema { json_schema } => cmd_schema(json_schema),
    }
}

/// Flag raised by Ctrl-C / SIGTERM; the run loops poll it and return cleanly
fn shutdown_on_signal() -> Result<Arc<AtomicBool>, FocusCliError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::Relaxed) {
            warn!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
        info!("interrupt received, shutting down");
    })
    .map_err(|e| FocusCliError::Signal(e.to_string()))?;
    Ok(shutdown)
}

fn cmd_relay(config: RelayConfig) -> Result<(), FocusCliError> {
    config.validate()?;
    let spec: SourceSpec = config.source.parse()?;
    let mut source = create_source(&spec)?;

    let transport = Arc::new(UdpTransport::bind("0.0.0.0:0", config.send_timeout())?);
    let mut relay = Relay::from_config(&config, transport)?;
    let shutdown = shutdown_on_signal()?;

    let listener = match config.listen {
        Some(addr) => Some(spawn_listener(
            addr,
            config.mode,
            Arc::clone(relay.registry()),
            Arc::clone(&shutdown),
        )?),
        None => None,
    };

    info!(
        instance = %relay.instance(),
        mode = ?config.mode,
        source = %spec,
        threshold = config.threshold,
        "relay started"
    );

    let outcome = pipeline::run_ingest(source.as_mut(), &mut relay, &config, &shutdown);
    shutdown.store(true, Ordering::Relaxed);
    if let Some((_, handle)) = listener {
        if handle.join().is_err() {
            warn!("registration listener panicked");
        }
    }

    let stats = outcome?;
    info!(
        samples = stats.samples,
        invalid = stats.invalid,
        published = stats.published,
        dropped = stats.dropped,
        disconnects = stats.disconnects,
        "relay stopped"
    );
    for status in relay.registry().status(std::time::Instant::now()) {
        info!(
            role = %status.role,
            endpoint = %status.address,
            sent = status.delivery.sent,
            failed = status.delivery.failed,
            dropped = status.delivery.dropped,
            "endpoint delivery"
        );
    }
    Ok(())
}

fn open_results(path: &Path) -> Result<Box<dyn Write>, FocusCliError> {
    if path.as_os_str() == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }
}

fn cmd_subscribe(
    config: ConsumerConfig,
    results: Option<&Path>,
    repeat: bool,
) -> Result<(), FocusCliError> {
    config.validate()?;
    let bind = config.bind_addr()?;
    let socket = UdpSocket::bind(bind)
        .map_err(|e| FocusError::InvalidConfig(format!("cannot bind {bind}: {e}")))?;
    let shutdown = shutdown_on_signal()?;

    match config.role {
        Role::Game => {
            let mut writer = results.map(open_results).transpose()?;
            let sink = GameSink::new(SessionMachine::new(config.session.clone()), config.auto_start);
            let mut adapter = ConsumerAdapter::new(Role::Game, sink);
            let mut last_phase = Phase::Idle;
            let mut last_health = LinkHealth::Waiting;

            run_consumer(&socket, &mut adapter, &config, &shutdown, |adapter| {
                report_health(&mut last_health, adapter.health());
                let phase = adapter.sink().session().phase();
                if phase != last_phase {
                    info!(phase = phase.as_str(), "session phase");
                    last_phase = phase;
                }

                for record in adapter.sink_mut().take_finished() {
                    info!(
                        player = %record.player_id,
                        finish_time = record.finish_time,
                        calibrated = record.session_summary.calibrated,
                        "race finished"
                    );
                    if let Some(out) = writer.as_mut() {
                        writeln!(out, "{}", serde_json::to_string(&record)?)?;
                        out.flush()?;
                    }
                    if repeat {
                        adapter.sink_mut().play_again();
                    }
                }
                adapter.sink_mut().drain_events();
                Ok(())
            })?;
        }
        Role::Dashboard => {
            let mut adapter = ConsumerAdapter::new(Role::Dashboard, DashboardSink::new(config.history_len));
            let mut last_health = LinkHealth::Waiting;
            let mut was_ready = false;

            run_consumer(&socket, &mut adapter, &config, &shutdown, |adapter| {
                report_health(&mut last_health, adapter.health());
                let ready = adapter.sink().is_ready();
                if ready != was_ready {
                    let score = adapter.sink().latest().map(|m| m.score).unwrap_or(0.0);
                    info!(ready, score, "ready flag");
                    was_ready = ready;
                }
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn report_health(last: &mut LinkHealth, health: LinkHealth) {
    if health != *last {
        match health {
            LinkHealth::Live => info!("receiving live scores"),
            LinkHealth::UpstreamLost => warn!("relay reports upstream source lost"),
            LinkHealth::Stale => warn!("no data from relay"),
            LinkHealth::Waiting => {}
        }
        *last = health;
    }
}

fn cmd_doctor(
    relay_config: Option<&Path>,
    consumer_config: Option<&Path>,
    json: bool,
) -> Result<(), FocusCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "focus_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("focus-drive version {}", FOCUS_VERSION),
    });

    checks.push(DoctorCheck {
        name: "wire_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Wire message version {}", wire::WIRE_VERSION),
    });

    let relay = match relay_config {
        Some(path) => RelayConfig::load_from_file(path).and_then(|c| c.validate().map(|_| c)),
        None => Ok(RelayConfig::default()),
    };
    match &relay {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "relay_config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Relay config valid (mode {:?}, source {}, threshold {})",
                    config.mode, config.source, config.threshold
                ),
            });
            checks.push(match config.source.parse::<SourceSpec>() {
                Ok(spec) => DoctorCheck {
                    name: "source".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Source spec {}", spec),
                },
                Err(e) => DoctorCheck {
                    name: "source".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
            });
            if let Some(listen) = config.listen {
                checks.push(bind_check("registration_port", listen));
            }
        }
        Err(e) => checks.push(DoctorCheck {
            name: "relay_config".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        }),
    }

    if let Some(path) = consumer_config {
        let consumer = ConsumerConfig::load_from_file(path).and_then(|c| c.validate().map(|_| c));
        checks.push(match consumer {
            Ok(config) => DoctorCheck {
                name: "consumer_config".to_string(),
                status: CheckStatus::Ok,
                message: format!("Consumer config valid (role {})", config.role),
            },
            Err(e) => DoctorCheck {
                name: "consumer_config".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        });
    }

    // a consumer already holding the port is fine, but worth knowing
    for role in [Role::Game, Role::Dashboard] {
        if let Ok(addr) = resolve("0.0.0.0", default_port(role)) {
            let mut check = bind_check(&format!("{}_port", role), addr);
            if matches!(check.status, CheckStatus::Error) {
                check.status = CheckStatus::Warning;
            }
            checks.push(check);
        }
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (use --source synthetic or udp:<addr>)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (--source stdin ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FOCUS_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("focusd Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(FocusCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn bind_check(name: &str, addr: SocketAddr) -> DoctorCheck {
    match UdpSocket::bind(addr) {
        Ok(_) => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: format!("{} can be bound", addr),
        },
        Err(e) => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: format!("cannot bind {}: {}", addr, e),
        },
    }
}

fn cmd_schema(json_schema: bool) -> Result<(), FocusCliError> {
    if json_schema {
        println!("{}", wire::json_schema());
    } else {
        println!("Wire message version {}", wire::WIRE_VERSION);
        println!();
        println!("One JSON object per UDP datagram, relay to consumer:");
        println!();
        println!("- v: message version");
        println!("- kind: game | dashboard");
        println!("- instance: relay instance id (UUID); a new id resets sequence tracking");
        println!("- seq: sequence number, strictly increasing per relay instance");
        println!("- ts: sample timestamp (seconds)");
        println!("- score: attention score in [0, 1]");
        println!("- ready: relay-side ready flag");
        println!("- phase: calibrating while the relay collects calibration scores");
        println!("- status: live | disconnected");
        println!("- summary (dashboard only): {{ raw_threshold, raw_power, calibrated, decision_threshold, movement_gate, calibration_remaining }}");
        println!();
        println!("Consumer to relay registration: {{\"type\":\"hello\",\"role\":\"game\"}}");
        println!();
        println!("Legacy text accepted by consumers: \"0.734\" (game), \"0.7340,1\" (dashboard)");
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum FocusCliError {
    Focus(FocusError),
    Io(io::Error),
    Json(serde_json::Error),
    Signal(String),
    DoctorFailed,
}

impl From<FocusError> for FocusCliError {
    fn from(e: FocusError) -> Self {
        FocusCliError::Focus(e)
    }
}

impl From<io::Error> for FocusCliError {
    fn from(e: io::Error) -> Self {
        FocusCliError::Io(e)
    }
}

impl From<serde_json::Error> for FocusCliError {
    fn from(e: serde_json::Error) -> Self {
        FocusCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<FocusCliError> for CliError {
    fn from(e: FocusCliError) -> Self {
        match e {
            FocusCliError::Focus(e) => {
                let hint = match &e {
                    FocusError::InvalidConfig(_) => Some("Run 'focusd doctor' to check the configuration"),
                    FocusError::SourceInit(_) => Some("Check the --source value and that the device or file exists"),
                    FocusError::Io(_) => Some("Check file paths and permissions"),
                    FocusError::Json(_) => Some("Check JSON syntax"),
                    _ => None,
                };
                CliError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            FocusCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            FocusCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            FocusCliError::Signal(message) => CliError {
                code: "SIGNAL_HANDLER".to_string(),
                message: format!("cannot install interrupt handler: {message}"),
                hint: None,
            },
            FocusCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_update_interval_is_seconds() {
        let cli = Cli::try_parse_from(["focusd", "relay", "--update-interval", "0.2"]).unwrap();
        match cli.command {
            Commands::Relay { update_interval, .. } => assert_eq!(update_interval, Some(0.2)),
            _ => panic!("expected relay command"),
        }
        assert!(Cli::try_parse_from(["focusd", "relay", "--update-rate", "0.2"]).is_err());
    }
}
