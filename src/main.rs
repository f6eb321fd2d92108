use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use scan_console::auth::AuthState;
use scan_console::config::{ConsoleConfig, DEFAULT_API_URL};
use scan_console::credential::Credential;
use scan_console::logs::{export_file_name, LevelFilter};
use scan_console::scan::{ScanMachine, ScanNotice, ScanPhase};
use scan_console::target::parse_target;
use scan_console::types::{Device, LogEntry, ScanMode, ScanParams, Settings};
use scan_console::Console;

/// Command-line front end for a remote network security scanner.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-console",
    version,
    about = "Operator console for a remote network security scanner.",
    long_about = None
)]
struct Cli {
    /// Scanner API base URL.
    #[arg(long, env = "SCANNER_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// File holding the persisted credential (defaults to the platform config dir).
    #[arg(long, env = "SCANNER_CREDENTIAL_FILE")]
    credential_file: Option<PathBuf>,

    /// Poll cadence for scan status and logs, in milliseconds.
    #[arg(long = "poll-ms", default_value_t = 2000)]
    poll_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Authenticate and remember the password.
    Login {
        #[arg(long, env = "SCANNER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the remembered password.
    Logout,
    /// Check whether the remembered password is still accepted.
    Whoami,
    /// List the scanner's network interfaces.
    Interfaces,
    /// Start a scan and follow it to completion (Ctrl+C stops it).
    Scan {
        #[arg(long)]
        interface: Option<String>,
        #[arg(long, default_value = "quick")]
        mode: ScanMode,
        /// e.g. `1-1000` or `22,80,8000-8010`.
        #[arg(long)]
        port_range: Option<String>,
        /// Single IP or CIDR.
        #[arg(long)]
        target: Option<String>,
        /// Return right after the scan is accepted.
        #[arg(long, default_value_t = false)]
        detach: bool,
    },
    /// Stop the running scan.
    Stop,
    /// Show the current scan status.
    Status,
    /// List discovered devices.
    Devices,
    /// Show one device.
    Device { ip: String },
    /// List detected vulnerabilities.
    Vulns,
    /// List saved reports.
    Reports,
    /// Show a report, or save it with --download.
    Report {
        id: String,
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// Show scanner logs.
    Logs {
        /// ALL, DEBUG, INFO, WARNING or ERROR.
        #[arg(long, default_value = "all")]
        level: LevelFilter,
        /// Keep streaming until Ctrl+C.
        #[arg(long, default_value_t = false)]
        follow: bool,
        /// Write the fetched lines to this file (or into this directory).
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Show settings, or change them with --set key=value.
    Settings {
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, String)>,
    },
    /// Change the scanner password.
    Password {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
    },
    /// Show AI classifier status.
    Ai,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConsoleConfig {
        api_url: cli.api_url.clone(),
        scan_poll_interval: Duration::from_millis(cli.poll_ms),
        log_poll_interval: Duration::from_millis(cli.poll_ms),
        ..ConsoleConfig::default()
    };
    if let Some(path) = &cli.credential_file {
        config.credential_path = path.clone();
    }
    let mut console = Console::from_config(&config)?;

    if !matches!(cli.command, Command::Login { .. } | Command::Logout) {
        require_session(&console).await?;
    }

    match cli.command {
        Command::Login { password } => {
            console
                .session
                .login(Credential::new(password))
                .await
                .map_err(|f| anyhow!("login failed: {f}"))?;
            println!("Logged in to {}", config.api_url);
        }
        Command::Logout => {
            console.session.logout();
            println!("Logged out");
        }
        Command::Whoami => println!("Authenticated against {}", config.api_url),
        Command::Interfaces => {
            let interfaces = console.gateway.interfaces().await?;
            for iface in interfaces {
                println!(
                    "{:<12} {:<16} {:<16} {:<18} {}",
                    iface.name,
                    iface.ip,
                    iface.netmask,
                    iface.mac.as_deref().unwrap_or("-"),
                    if iface.is_up { "up" } else { "down" }
                );
            }
        }
        Command::Scan {
            interface,
            mode,
            port_range,
            target,
            detach,
        } => {
            if let Some(t) = target.as_deref() {
                if let Ok(parsed) = parse_target(t) {
                    if let Some(hosts) = parsed.host_count() {
                        println!("Target {parsed}: {hosts} hosts");
                    }
                }
            }
            let params = ScanParams {
                interface,
                mode,
                port_range,
                target,
            };
            run_scan(&mut console, params, detach).await?;
        }
        Command::Stop => {
            let snapshot = console.scans.sync().await?;
            if snapshot.phase() != ScanPhase::Running {
                println!("No scan running");
            } else {
                console.scans.stop().await?;
                println!("Scan stopped");
            }
        }
        Command::Status => {
            let snapshot = console.scans.sync().await?;
            print_job(&snapshot);
        }
        Command::Devices => {
            let devices = console.gateway.devices().await?;
            print_devices_table(&devices);
        }
        Command::Device { ip } => {
            let details = console.gateway.device(&ip).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Command::Vulns => {
            let mut vulns = console.gateway.vulnerabilities().await?;
            vulns.sort_by(|a, b| b.severity.cmp(&a.severity));
            for v in vulns {
                println!(
                    "{:<16} {:<9} {:>4.1}  {:<15} {}",
                    v.cve_id,
                    format!("{:?}", v.severity).to_lowercase(),
                    v.cvss_score,
                    v.device_ip,
                    v.title
                );
            }
        }
        Command::Reports => {
            for r in console.gateway.reports().await? {
                println!(
                    "{:<24} {:<26} {:>4} devices {:>4} vulns",
                    r.id, r.timestamp, r.devices_count, r.vulnerabilities_count
                );
            }
        }
        Command::Report { id, download } => match download {
            Some(path) => {
                let bytes = console
                    .gateway
                    .download_report(&id)
                    .await
                    .ok_or_else(|| anyhow!("Failed to download report {id}"))?;
                fs::write(&path, bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Report downloaded to {}", path.display());
            }
            None => {
                let report = console.gateway.report(&id).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },
        Command::Logs {
            level,
            follow,
            export,
        } => run_logs(&mut console, level, follow, export.as_deref()).await?,
        Command::Settings { set } => {
            if set.is_empty() {
                let settings = console.gateway.settings().await?;
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                let changes = settings_from_pairs(&set)?;
                let saved = console.gateway.update_settings(&changes).await?;
                println!("Settings saved");
                println!("{}", serde_json::to_string_pretty(&saved)?);
            }
        }
        Command::Password { old, new } => {
            console
                .session
                .change_password(Credential::new(old), Credential::new(new))
                .await
                .map_err(|f| anyhow!("password change failed: {f}"))?;
            println!("Password updated");
        }
        Command::Ai => {
            let status = console.gateway.ai_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn require_session(console: &Console) -> Result<()> {
    if console.session.bootstrap().await == AuthState::Authenticated {
        return Ok(());
    }
    match console.session.snapshot().last_error {
        Some(err) => bail!("{err}"),
        None => bail!("not logged in; run `scan-console login` first"),
    }
}

async fn run_scan(console: &mut Console, params: ScanParams, detach: bool) -> Result<()> {
    if console.scans.sync().await?.phase() == ScanPhase::Running {
        bail!("a scan is already running; use `scan-console stop` or `status`");
    }
    let mode = params.mode;
    let scan_id = console.scans.start(params).await?;
    println!("Started {mode} scan ({scan_id})");
    if detach {
        return Ok(());
    }

    let mut state = console.scans.subscribe();
    loop {
        tokio::select! {
            notice = console.scan_notices.recv() => match notice {
                Some(ScanNotice::Completed { devices_found }) => {
                    println!("\nScan completed! {devices_found} devices found");
                    break;
                }
                Some(ScanNotice::StopFailed(msg)) => eprintln!("\nStop failed: {msg}"),
                Some(_) => {}
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                print_progress(&snapshot);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping scan...");
                console.scans.stop().await?;
                println!("Scan stopped");
                return Ok(());
            }
        }
    }

    let mut state = console.scans.subscribe();
    let settled = timeout(
        Duration::from_secs(15),
        state.wait_for(|m| !m.is_fetching_results()),
    )
    .await
    .is_ok_and(|waited| waited.is_ok());
    if !settled {
        eprintln!("Results not available yet; try `scan-console devices`");
    }
    match console.scans.snapshot().results() {
        Some(results) => {
            let s = &results.summary;
            println!(
                "Devices: {} ({} vulnerable), vulnerabilities: {} (critical {}, high {}, medium {}, low {}, info {})",
                s.total_devices,
                s.vulnerable_devices,
                s.total_vulnerabilities,
                s.critical_count,
                s.high_count,
                s.medium_count,
                s.low_count,
                s.info_count
            );
            print_devices_table(&results.devices);
        }
        None => println!("No results available"),
    }
    Ok(())
}

async fn run_logs(
    console: &mut Console,
    level: LevelFilter,
    follow: bool,
    export: Option<&Path>,
) -> Result<()> {
    console.logs.set_level_filter(level);
    let mut state = console.logs.subscribe();
    console.logs.start();

    timeout(Duration::from_secs(15), state.wait_for(|m| m.is_loaded()))
        .await
        .map_err(|_| anyhow!("no log data received from the scanner"))?
        .map_err(|_| anyhow!("log stream closed"))?;

    let mut printed: Vec<LogEntry> = Vec::new();
    print_fresh(&mut printed, console.logs.snapshot().entries());

    if follow {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let entries = state.borrow_and_update().entries().to_vec();
                    print_fresh(&mut printed, &entries);
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }
    console.logs.stop();

    if let Some(path) = export {
        let target = if path.is_dir() {
            path.join(export_file_name(OffsetDateTime::now_utc().date()))
        } else {
            path.to_path_buf()
        };
        fs::write(&target, console.logs.export())
            .with_context(|| format!("failed to write {}", target.display()))?;
        println!("Logs exported to {}", target.display());
    }
    Ok(())
}

/// Print entries of `next` not yet shown. The buffer is replaced on every
/// poll, so the last printed entry is used as the anchor.
fn print_fresh(printed: &mut Vec<LogEntry>, next: &[LogEntry]) {
    let start = printed
        .last()
        .and_then(|last| next.iter().rposition(|e| e == last))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    for e in &next[start..] {
        println!("[{}] [{:<7}] {}", e.timestamp, e.level, e.message);
    }
    *printed = next.to_vec();
}

fn print_progress(snapshot: &ScanMachine) {
    let job = snapshot.job();
    if !job.is_scanning {
        return;
    }
    let eta = job
        .estimated_time_remaining
        .map(|s| format!(", ~{:.0}s left", s.ceil()))
        .unwrap_or_default();
    print!(
        "\r{:>5.1}%  {:<24} {} devices{}   ",
        job.progress, job.current_phase, job.devices_found, eta
    );
    let _ = std::io::stdout().flush();
}

fn print_job(snapshot: &ScanMachine) {
    let job = snapshot.job();
    println!("scanning     : {}", job.is_scanning);
    println!("progress     : {:.1}%", job.progress);
    println!("phase        : {}", job.current_phase);
    println!("devices      : {}", job.devices_found);
    println!(
        "eta          : {}",
        job.estimated_time_remaining
            .map(|s| format!("{:.0}s", s.ceil()))
            .unwrap_or_else(|| "-".to_string())
    );
}

const HOST_COLUMN_MAX: usize = 32;

/// At most `max` characters of `s`, cut on a character boundary.
fn fit_cell(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn print_devices_table(devices: &[Device]) {
    let mut ip_w = "ip".len();
    let mut host_w = "hostname".len();
    for d in devices {
        ip_w = ip_w.max(d.ip.chars().count());
        host_w = host_w.max(
            d.hostname
                .as_deref()
                .unwrap_or("-")
                .chars()
                .count()
                .min(HOST_COLUMN_MAX),
        );
    }
    let risk_w = "critical".len();

    println!(
        "{:<ip_w$}  {:<host_w$}  {:<risk_w$}  {:>5}  {:>5}",
        "ip",
        "hostname",
        "risk",
        "ports",
        "vulns",
        ip_w = ip_w,
        host_w = host_w,
        risk_w = risk_w
    );
    println!(
        "{:-<ip_w$}  {:-<host_w$}  {:-<risk_w$}  {:-<5}  {:-<5}",
        "",
        "",
        "",
        "",
        "",
        ip_w = ip_w,
        host_w = host_w,
        risk_w = risk_w
    );
    for d in devices {
        let host = fit_cell(d.hostname.as_deref().unwrap_or("-"), HOST_COLUMN_MAX);
        println!(
            "{:<ip_w$}  {:<host_w$}  {:<risk_w$}  {:>5}  {:>5}",
            d.ip,
            host,
            format!("{:?}", d.risk_level).to_lowercase(),
            d.open_ports.len(),
            d.vulnerabilities_count,
            ip_w = ip_w,
            host_w = host_w,
            risk_w = risk_w
        );
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

/// Build a partial settings update; values are read as JSON where possible
/// (`max_threads=8`, `save_reports=false`) and as strings otherwise. Keys
/// that are not settings fields are rejected.
fn settings_from_pairs(pairs: &[(String, String)]) -> Result<Settings> {
    let mut map = serde_json::Map::new();
    for (key, raw) in pairs {
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        map.insert(key.clone(), value);
    }
    let settings: Settings = serde_json::from_value(serde_json::Value::Object(map.clone()))
        .context("invalid settings value")?;

    // Every field that survived decoding is echoed back on serialization.
    let echoed = serde_json::to_value(&settings)?;
    let unknown: Vec<&str> = map
        .keys()
        .map(String::as_str)
        .filter(|key| echoed.get(key).is_none())
        .collect();
    if !unknown.is_empty() {
        bail!("unknown or empty settings key(s): {}", unknown.join(", "));
    }
    Ok(settings)
}
