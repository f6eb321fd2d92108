use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network interface reported by the scanner host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    #[serde(default)]
    pub mac: Option<String>,
    pub is_up: bool,
}

/// How thorough a scan should be.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Quick,
    Deep,
    Comprehensive,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Quick => "quick",
            ScanMode::Deep => "deep",
            ScanMode::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(ScanMode::Quick),
            "deep" => Ok(ScanMode::Deep),
            "comprehensive" => Ok(ScanMode::Comprehensive),
            other => Err(format!("unknown scan mode: {other}")),
        }
    }
}

/// Parameters for a start-scan request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub mode: ScanMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ScanParams {
    pub fn new(interface: impl Into<String>, mode: ScanMode) -> Self {
        Self {
            interface: Some(interface.into()),
            mode,
            port_range: None,
            target: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanStarted {
    pub scan_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanStopped {
    pub stopped: bool,
}

/// Server view of the current scan job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanStatus {
    pub is_scanning: bool,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_phase: String,
    #[serde(default)]
    pub devices_found: u64,
    #[serde(default)]
    pub start_time: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub estimated_time_remaining: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanSummary {
    pub total_devices: u64,
    pub vulnerable_devices: u64,
    pub total_vulnerabilities: u64,
    pub critical_count: u64,
    pub high_count: u64,
    pub medium_count: u64,
    pub low_count: u64,
    pub info_count: u64,
}

/// Final output of a finished scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanResults {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub timestamp: String,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    pub summary: ScanSummary,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AiClassification {
    pub device_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// One discovered host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Device {
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub open_ports: Vec<PortInfo>,
    pub risk_level: Severity,
    #[serde(default)]
    pub vulnerabilities_count: u64,
    #[serde(default)]
    pub last_seen: String,
    #[serde(default)]
    pub is_anomaly: Option<bool>,
    #[serde(default)]
    pub ai_classification: Option<AiClassification>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub extra_info: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanHistoryEntry {
    pub scan_id: String,
    pub timestamp: String,
    pub ports_open: u64,
    pub vulnerabilities_found: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnomalyDetails {
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    #[serde(default)]
    pub anomaly_type: Option<String>,
    pub details: String,
}

/// Device plus everything the backend knows about it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceDetails {
    #[serde(flatten)]
    pub device: Device,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    pub scan_history: Vec<ScanHistoryEntry>,
    #[serde(default)]
    pub anomaly_details: Option<AnomalyDetails>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Vulnerability {
    pub cve_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub cvss_score: f64,
    #[serde(default)]
    pub affected_service: String,
    #[serde(default)]
    pub affected_port: u16,
    pub device_ip: String,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Full,
    Summary,
    Executive,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub id: String,
    pub timestamp: String,
    pub scan_id: String,
    pub devices_count: u64,
    pub vulnerabilities_count: u64,
    #[serde(rename = "type")]
    pub kind: ReportKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReportDetails {
    #[serde(flatten)]
    pub report: Report,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: ScanSummary,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

/// Severity of a scanner log line. Ordered from least to most severe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One scanner log line. Immutable once received.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AiStatus {
    pub model_loaded: bool,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub last_training: Option<String>,
    #[serde(default)]
    pub devices_classified: u64,
    #[serde(default)]
    pub anomalies_detected: u64,
}

/// Backend scanner settings. Every field is optional so the same type serves
/// partial updates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_scan_mode: Option<ScanMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port_range: Option<String>,
    /// Minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scan_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_reports: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PasswordUpdated {
    pub updated: bool,
}
