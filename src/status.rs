//! Host status snapshot assembled from independent concurrent probes

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Sampling window for CPU usage
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A single probe could not read its metric
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("{0} is unavailable on this host")]
    Unavailable(&'static str),

    #[error("probe failed: {0}")]
    Failed(String),
}

/// OS, architecture and uptime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub os: String,
    pub architecture: String,
    pub uptime_seconds: u64,
}

/// Raw memory figures in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CpuStatus {
    pub cores: usize,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

impl From<MemoryReading> for MemoryStatus {
    fn from(reading: MemoryReading) -> Self {
        let usage_percent = if reading.total == 0 {
            0.0
        } else {
            reading.used as f64 / reading.total as f64 * 100.0
        };

        Self {
            total_gb: to_gb(reading.total),
            used_gb: to_gb(reading.used),
            free_gb: to_gb(reading.free),
            total_bytes: reading.total,
            used_bytes: reading.used,
            free_bytes: reading.free,
            usage_percent,
        }
    }
}

fn to_gb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GB * 100.0).round() / 100.0
}

/// Point-in-time host status. Every field is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub uptime_seconds: u64,
    pub uptime_human: String,
    pub load_average: [f64; 3],
    pub cpu: CpuStatus,
    pub memory: MemoryStatus,
    pub time: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            hostname: "unknown".to_string(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            uptime_seconds: 0,
            uptime_human: format_uptime(0),
            load_average: [0.0; 3],
            cpu: CpuStatus::default(),
            memory: MemoryStatus::default(),
            time: Utc::now(),
        }
    }
}

/// Reads host metrics. Calls may block; the aggregator runs each on a
/// blocking worker.
pub trait HostProbe: Send + Sync + 'static {
    fn hostname(&self) -> Result<String, ProbeError>;

    fn host_info(&self) -> Result<HostInfo, ProbeError>;

    fn load_average(&self) -> Result<[f64; 3], ProbeError>;

    fn memory(&self) -> Result<MemoryReading, ProbeError>;

    /// CPU usage measured over `window`
    fn cpu(&self, window: Duration) -> Result<CpuStatus, ProbeError>;
}

/// [`HostProbe`] backed by `sysinfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProbe;

/// Distribution name and version, e.g. "Ubuntu 22.04"
fn describe_os(name: Option<String>, version: Option<String>) -> String {
    match (name, version) {
        (Some(name), Some(version)) if !version.is_empty() => format!("{} {}", name, version),
        (Some(name), _) => name,
        (None, _) => std::env::consts::OS.to_string(),
    }
}

impl HostProbe for SysinfoProbe {
    fn hostname(&self) -> Result<String, ProbeError> {
        System::host_name().ok_or(ProbeError::Unavailable("hostname"))
    }

    fn host_info(&self) -> Result<HostInfo, ProbeError> {
        Ok(HostInfo {
            os: describe_os(System::name(), System::os_version()),
            architecture: System::cpu_arch()
                .filter(|arch| !arch.trim().is_empty())
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            uptime_seconds: System::uptime(),
        })
    }

    fn load_average(&self) -> Result<[f64; 3], ProbeError> {
        if cfg!(windows) {
            return Ok([0.0; 3]);
        }

        let load = System::load_average();
        Ok([load.one, load.five, load.fifteen])
    }

    fn memory(&self) -> Result<MemoryReading, ProbeError> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return Err(ProbeError::Unavailable("memory"));
        }

        Ok(MemoryReading {
            total,
            used: sys.used_memory(),
            free: sys.free_memory(),
        })
    }

    fn cpu(&self, window: Duration) -> Result<CpuStatus, ProbeError> {
        let mut sys = System::new();
        sys.refresh_cpu();
        std::thread::sleep(window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        sys.refresh_cpu();

        let cores = sys.cpus().len();
        if cores == 0 {
            return Err(ProbeError::Unavailable("cpu"));
        }

        Ok(CpuStatus {
            cores,
            usage_percent: f64::from(sys.global_cpu_info().cpu_usage()),
        })
    }
}

/// Builds a fresh [`StatusSnapshot`] per call
#[derive(Clone)]
pub struct StatusAggregator {
    probe: Arc<dyn HostProbe>,
    cpu_window: Duration,
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new(Arc::new(SysinfoProbe))
    }
}

impl StatusAggregator {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self {
            probe,
            cpu_window: CPU_SAMPLE_WINDOW,
        }
    }

    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    /// Run every probe concurrently and wait for all of them.
    ///
    /// A failed probe leaves its fields at their defaults; the snapshot is
    /// always complete.
    pub async fn collect(&self) -> StatusSnapshot {
        let snapshot = Arc::new(Mutex::new(StatusSnapshot::default()));
        let mut probes = JoinSet::new();

        {
            let (probe, snapshot) = (self.probe.clone(), snapshot.clone());
            probes.spawn_blocking(move || match probe.hostname() {
                Ok(hostname) => snapshot.lock().hostname = hostname,
                Err(e) => warn!(probe = "hostname", error = %e, "Probe failed"),
            });
        }

        {
            let (probe, snapshot) = (self.probe.clone(), snapshot.clone());
            probes.spawn_blocking(move || match probe.host_info() {
                Ok(info) => {
                    let mut snapshot = snapshot.lock();
                    snapshot.os = info.os;
                    snapshot.architecture = info.architecture;
                    snapshot.uptime_seconds = info.uptime_seconds;
                    snapshot.uptime_human = format_uptime(info.uptime_seconds);
                }
                Err(e) => warn!(probe = "host_info", error = %e, "Probe failed"),
            });
        }

        {
            let (probe, snapshot) = (self.probe.clone(), snapshot.clone());
            probes.spawn_blocking(move || match probe.load_average() {
                Ok(load) => snapshot.lock().load_average = load,
                Err(e) => warn!(probe = "load_average", error = %e, "Probe failed"),
            });
        }

        {
            let (probe, snapshot) = (self.probe.clone(), snapshot.clone());
            probes.spawn_blocking(move || match probe.memory() {
                Ok(reading) => snapshot.lock().memory = reading.into(),
                Err(e) => warn!(probe = "memory", error = %e, "Probe failed"),
            });
        }

        {
            let (probe, snapshot) = (self.probe.clone(), snapshot.clone());
            let window = self.cpu_window;
            probes.spawn_blocking(move || match probe.cpu(window) {
                Ok(cpu) => snapshot.lock().cpu = cpu,
                Err(e) => warn!(probe = "cpu", error = %e, "Probe failed"),
            });
        }

        while let Some(joined) = probes.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Probe task did not complete");
            }
        }

        let mut snapshot = snapshot.lock().clone();
        snapshot.time = Utc::now();

        debug!(hostname = %snapshot.hostname, "Status snapshot collected");
        snapshot
    }
}

/// Render uptime as "N days, N hours, N minutes, N seconds", skipping zero parts
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let parts: Vec<String> = [(days, "days"), (hours, "hours"), (minutes, "minutes"), (secs, "seconds")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{} {}", value, unit))
        .collect();

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    struct FixedProbe;

    impl HostProbe for FixedProbe {
        fn hostname(&self) -> Result<String, ProbeError> {
            Ok("web-01".to_string())
        }

        fn host_info(&self) -> Result<HostInfo, ProbeError> {
            Ok(HostInfo {
                os: "linux".to_string(),
                architecture: "x86_64".to_string(),
                uptime_seconds: 90_061,
            })
        }

        fn load_average(&self) -> Result<[f64; 3], ProbeError> {
            Ok([0.5, 0.25, 0.125])
        }

        fn memory(&self) -> Result<MemoryReading, ProbeError> {
            Ok(MemoryReading {
                total: 8 * 1024 * 1024 * 1024,
                used: 2 * 1024 * 1024 * 1024,
                free: 6 * 1024 * 1024 * 1024,
            })
        }

        fn cpu(&self, _window: Duration) -> Result<CpuStatus, ProbeError> {
            Ok(CpuStatus {
                cores: 4,
                usage_percent: 12.5,
            })
        }
    }

    /// Everything fails except memory
    struct FlakyProbe;

    impl HostProbe for FlakyProbe {
        fn hostname(&self) -> Result<String, ProbeError> {
            Err(ProbeError::Unavailable("hostname"))
        }

        fn host_info(&self) -> Result<HostInfo, ProbeError> {
            Err(ProbeError::Failed("uname".to_string()))
        }

        fn load_average(&self) -> Result<[f64; 3], ProbeError> {
            Err(ProbeError::Unavailable("load average"))
        }

        fn memory(&self) -> Result<MemoryReading, ProbeError> {
            Ok(MemoryReading {
                total: 1000,
                used: 250,
                free: 750,
            })
        }

        fn cpu(&self, _window: Duration) -> Result<CpuStatus, ProbeError> {
            panic!("cpu probe crashed")
        }
    }

    #[tokio::test]
    async fn test_collect_all_probes() {
        let snapshot = StatusAggregator::new(Arc::new(FixedProbe)).collect().await;

        assert_eq!(snapshot.hostname, "web-01");
        assert_eq!(snapshot.os, "linux");
        assert_eq!(snapshot.architecture, "x86_64");
        assert_eq!(snapshot.uptime_seconds, 90_061);
        assert_eq!(snapshot.uptime_human, "1 days, 1 hours, 1 minutes, 1 seconds");
        assert_eq!(snapshot.load_average, [0.5, 0.25, 0.125]);
        assert_eq!(snapshot.cpu.cores, 4);
        assert_relative_eq!(snapshot.cpu.usage_percent, 12.5);
        assert_eq!(snapshot.memory.total_bytes, 8 * 1024 * 1024 * 1024);
        assert_relative_eq!(snapshot.memory.total_gb, 8.0);
        assert_relative_eq!(snapshot.memory.used_gb, 2.0);
        assert_relative_eq!(snapshot.memory.usage_percent, 25.0);
    }

    #[tokio::test]
    async fn test_failed_probes_fall_back_to_defaults() {
        let snapshot = StatusAggregator::new(Arc::new(FlakyProbe)).collect().await;

        assert_eq!(snapshot.hostname, "unknown");
        assert_eq!(snapshot.os, std::env::consts::OS);
        assert_eq!(snapshot.architecture, std::env::consts::ARCH);
        assert_eq!(snapshot.uptime_seconds, 0);
        assert_eq!(snapshot.uptime_human, "0 seconds");
        assert_eq!(snapshot.load_average, [0.0; 3]);
        assert_eq!(snapshot.cpu, CpuStatus::default());

        // the one probe that worked still lands
        assert_eq!(snapshot.memory.used_bytes, 250);
        assert_relative_eq!(snapshot.memory.usage_percent, 25.0);
    }

    #[test]
    fn test_memory_usage_zero_total() {
        let memory = MemoryStatus::from(MemoryReading {
            total: 0,
            used: 0,
            free: 0,
        });
        assert_eq!(memory.usage_percent, 0.0);
    }

    #[test]
    fn test_snapshot_serialization_shape() {
        let value = serde_json::to_value(StatusSnapshot::default()).unwrap();
        for key in [
            "hostname",
            "os",
            "architecture",
            "uptime_seconds",
            "uptime_human",
            "load_average",
            "cpu",
            "memory",
            "time",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["load_average"].as_array().unwrap().len(), 3);
        assert!(value["memory"].get("usage_percent").is_some());
        assert!(value["cpu"].get("cores").is_some());
    }

    #[test_case(0, "0 seconds")]
    #[test_case(59, "59 seconds")]
    #[test_case(60, "1 minutes")]
    #[test_case(3_661, "1 hours, 1 minutes, 1 seconds")]
    #[test_case(86_400, "1 days")]
    #[test_case(172_805, "2 days, 5 seconds")]
    fn test_format_uptime(seconds: u64, expected: &str) {
        assert_eq!(format_uptime(seconds), expected);
    }

    #[test_case(Some("Ubuntu"), Some("22.04"), "Ubuntu 22.04")]
    #[test_case(Some("Windows"), Some("10 Pro"), "Windows 10 Pro")]
    #[test_case(Some("Arch Linux"), None, "Arch Linux")]
    #[test_case(Some("Alpine"), Some(""), "Alpine")]
    #[test_case(None, Some("22.04"), std::env::consts::OS)]
    fn test_describe_os(name: Option<&str>, version: Option<&str>, expected: &str) {
        assert_eq!(
            describe_os(name.map(String::from), version.map(String::from)),
            expected
        );
    }

    #[test]
    fn test_sysinfo_probe_host_info() {
        let info = SysinfoProbe.host_info().unwrap();
        assert!(!info.architecture.is_empty());
        if let (Some(name), Some(version)) = (System::name(), System::os_version()) {
            if !version.is_empty() {
                assert_eq!(info.os, format!("{} {}", name, version));
            }
        }
    }

    #[tokio::test]
    async fn test_sysinfo_probe_reports_host() {
        let snapshot = StatusAggregator::default()
            .with_cpu_window(Duration::from_millis(200))
            .collect()
            .await;

        assert!(!snapshot.os.is_empty());
        assert!(snapshot.memory.total_bytes > 0);
        assert!(snapshot.cpu.cores > 0);
        assert!(snapshot.memory.usage_percent >= 0.0 && snapshot.memory.usage_percent <= 100.0);
    }
}
