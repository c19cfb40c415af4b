//! Host and GPU resource sampling plus threshold checks.
//!
//! Sampling is best effort: a missing `nvidia-smi` or unreadable
//! `/proc/meminfo` leaves the corresponding field empty and records why.
//! CPU usage is the busy share of two `/proc/stat` reads taken
//! [`CPU_SAMPLE_WINDOW`] apart.

use crate::command::run_command;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recovery_common::Alert;
use recovery_common::config::ThresholdConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

const NVIDIA_SMI_QUERY: &str =
    "--query-gpu=index,name,memory.used,memory.total,temperature.gpu,utilization.gpu";

pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub temperature_c: Option<f64>,
    pub utilization_percent: Option<f64>,
}

impl GpuSample {
    pub fn memory_percent(&self) -> Option<f64> {
        (self.memory_total_mib > 0)
            .then(|| self.memory_used_mib as f64 / self.memory_total_mib as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub gpus: Vec<GpuSample>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    /// Sampling steps that failed, with the reason.
    pub errors: Vec<String>,
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> ResourceSnapshot;
}

/// Samples the local host with `nvidia-smi`, `/proc/stat`, `/proc/meminfo` and `df`.
#[derive(Debug, Clone)]
pub struct SystemSampler {
    pub disk_path: PathBuf,
    pub timeout: Duration,
    pub cpu_window: Duration,
}

impl SystemSampler {
    pub fn new(disk_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            disk_path: disk_path.into(),
            timeout,
            cpu_window: CPU_SAMPLE_WINDOW,
        }
    }

    async fn cpu_percent(&self) -> Result<f64, String> {
        let before = read_cpu_times().await?;
        tokio::time::sleep(self.cpu_window).await;
        let after = read_cpu_times().await?;
        cpu_busy_percent(before, after).ok_or_else(|| "no CPU time elapsed".to_string())
    }
}

async fn read_cpu_times() -> Result<CpuTimes, String> {
    let text = tokio::fs::read_to_string("/proc/stat")
        .await
        .map_err(|e| e.to_string())?;
    parse_proc_stat(&text).ok_or_else(|| "missing aggregate cpu line".to_string())
}

#[async_trait]
impl ResourceSampler for SystemSampler {
    async fn sample(&self) -> ResourceSnapshot {
        let mut snapshot = ResourceSnapshot {
            taken_at: Some(Utc::now()),
            ..Default::default()
        };

        match run_command(
            "nvidia-smi",
            &[NVIDIA_SMI_QUERY, "--format=csv,noheader,nounits"],
            self.timeout,
        )
        .await
        {
            Ok(output) if output.success() => snapshot.gpus = parse_nvidia_smi_csv(&output.stdout),
            Ok(output) => snapshot
                .errors
                .push(format!("nvidia-smi: {}", output.failure_detail())),
            Err(e) => snapshot.errors.push(format!("nvidia-smi: {e}")),
        }

        match self.cpu_percent().await {
            Ok(percent) => snapshot.cpu_percent = Some(percent),
            Err(e) => snapshot.errors.push(format!("cpu: {e}")),
        }

        match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(text) => match parse_meminfo(&text) {
                Some(percent) => snapshot.memory_percent = Some(percent),
                None => snapshot.errors.push("meminfo: missing MemTotal/MemAvailable".into()),
            },
            Err(e) => snapshot.errors.push(format!("meminfo: {e}")),
        }

        let disk_path = self.disk_path.to_string_lossy();
        match run_command("df", &["-Pk", &disk_path], self.timeout).await {
            Ok(output) if output.success() => match parse_df(&output.stdout) {
                Some(percent) => snapshot.disk_percent = Some(percent),
                None => snapshot.errors.push("df: unparseable output".into()),
            },
            Ok(output) => snapshot.errors.push(format!("df: {}", output.failure_detail())),
            Err(e) => snapshot.errors.push(format!("df: {e}")),
        }

        snapshot
    }
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` rows for [`NVIDIA_SMI_QUERY`].
///
/// Rows with unparseable index or memory columns are skipped; `[N/A]`
/// temperature or utilization becomes `None`.
pub fn parse_nvidia_smi_csv(text: &str) -> Vec<GpuSample> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 6 {
                return None;
            }
            Some(GpuSample {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                memory_used_mib: fields[2].parse().ok()?,
                memory_total_mib: fields[3].parse().ok()?,
                temperature_c: fields[4].parse().ok(),
                utilization_percent: fields[5].parse().ok(),
            })
        })
        .collect()
}

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

pub fn parse_proc_stat(text: &str) -> Option<CpuTimes> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already counted in user/nice
    let total = fields.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

/// Busy share of the CPU time that elapsed between two reads.
pub fn cpu_busy_percent(before: CpuTimes, after: CpuTimes) -> Option<f64> {
    let total = after.total.checked_sub(before.total)?;
    let idle = after.idle.checked_sub(before.idle)?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(idle) as f64 / total as f64 * 100.0)
}

/// Used memory percentage from `/proc/meminfo`.
pub fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        text.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

/// Used percentage of the filesystem in `df -Pk` output.
pub fn parse_df(text: &str) -> Option<f64> {
    let line = text.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let used: u64 = fields[2].parse().ok()?;
    let available: u64 = fields[3].parse().ok()?;
    let total = used + available;
    if total == 0 {
        return None;
    }
    Some(used as f64 / total as f64 * 100.0)
}

/// Warning alerts for every value above its threshold.
pub fn threshold_alerts(
    snapshot: &ResourceSnapshot,
    response_time: Option<Duration>,
    thresholds: &ThresholdConfig,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if let Some(elapsed) = response_time {
        let secs = elapsed.as_secs_f64();
        if secs > thresholds.response_time_secs {
            alerts.push(Alert::warning(
                "API Response Time High",
                format!("Health endpoint response time: {secs:.2}s"),
            ));
        }
    }

    for gpu in &snapshot.gpus {
        if let Some(percent) = gpu.memory_percent() {
            if percent > thresholds.gpu_memory_percent {
                alerts.push(Alert::warning(
                    "GPU Memory High",
                    format!("GPU {} memory usage: {percent:.1}%", gpu.index),
                ));
            }
        }
        if let Some(temp) = gpu.temperature_c {
            if temp > thresholds.gpu_temperature_c {
                alerts.push(Alert::warning(
                    "GPU Temperature High",
                    format!("GPU {} temperature: {temp:.0}°C", gpu.index),
                ));
            }
        }
    }

    if let Some(percent) = snapshot.cpu_percent {
        if percent > thresholds.cpu_percent {
            alerts.push(Alert::warning(
                "CPU Usage High",
                format!("CPU usage: {percent:.1}%"),
            ));
        }
    }

    if let Some(percent) = snapshot.memory_percent {
        if percent > thresholds.memory_percent {
            alerts.push(Alert::warning(
                "Memory Usage High",
                format!("Memory usage: {percent:.1}%"),
            ));
        }
    }

    if let Some(percent) = snapshot.disk_percent {
        if percent > thresholds.disk_percent {
            alerts.push(Alert::warning(
                "Disk Usage High",
                format!("Disk usage: {percent:.1}%"),
            ));
        }
    }

    alerts
}

/// Warning when a test completion took longer than allowed.
pub fn generation_alert(elapsed: Duration, thresholds: &ThresholdConfig) -> Option<Alert> {
    let secs = elapsed.as_secs_f64();
    (secs > thresholds.generation_time_secs).then(|| {
        Alert::warning(
            "Generation Time High",
            format!("Generation response time: {secs:.2}s"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMI: &str = "0, NVIDIA H100 80GB HBM3, 78000, 81559, 71, 98\n\
                       1, NVIDIA H100 80GB HBM3, 1000, 81559, [N/A], [N/A]\n\
                       garbage line\n";

    const MEMINFO: &str = "MemTotal:       1000000 kB\n\
                           MemFree:         100000 kB\n\
                           MemAvailable:    250000 kB\n";

    const DF: &str = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n\
                      /dev/nvme0n1p1   100000000  90000000  10000000      90% /\n";

    #[test]
    fn parses_nvidia_smi_rows() {
        let gpus = parse_nvidia_smi_csv(SMI);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].temperature_c, Some(71.0));
        assert!(gpus[0].memory_percent().unwrap() > 95.0);
        assert_eq!(gpus[1].temperature_c, None);
        assert_eq!(gpus[1].utilization_percent, None);
    }

    #[test]
    fn parses_meminfo() {
        let percent = parse_meminfo(MEMINFO).unwrap();
        assert!((percent - 75.0).abs() < 1e-9);
        assert_eq!(parse_meminfo("MemFree: 1 kB"), None);
    }

    #[test]
    fn parses_df() {
        let percent = parse_df(DF).unwrap();
        assert!((percent - 90.0).abs() < 1e-9);
        assert_eq!(parse_df("header only"), None);
    }

    #[test]
    fn cpu_usage_from_two_stat_reads() {
        let before = parse_proc_stat(
            "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\nintr 1\n",
        )
        .unwrap();
        assert_eq!(before, CpuTimes { idle: 800, total: 1000 });
        let after = parse_proc_stat("cpu  250 0 250 750 150 0 0 0 0 0\n").unwrap();
        let percent = cpu_busy_percent(before, after).unwrap();
        assert!((percent - 75.0).abs() < 1e-9);

        assert_eq!(cpu_busy_percent(before, before), None);
        assert_eq!(parse_proc_stat("cpu0 1 2 3 4\n"), None);
    }

    #[test]
    fn slow_generation_raises_warning() {
        let thresholds = ThresholdConfig::default();
        assert!(generation_alert(Duration::from_secs(2), &thresholds).is_none());
        let alert = generation_alert(Duration::from_secs(31), &thresholds).unwrap();
        assert_eq!(alert.title, "Generation Time High");
        assert!(alert.message.contains("31.00s"));
    }

    #[test]
    fn threshold_alerts_cover_each_breach() {
        let snapshot = ResourceSnapshot {
            taken_at: None,
            gpus: parse_nvidia_smi_csv(SMI),
            cpu_percent: Some(97.0),
            memory_percent: Some(92.5),
            disk_percent: Some(90.0),
            errors: Vec::new(),
        };
        let mut thresholds = ThresholdConfig::default();
        thresholds.gpu_temperature_c = 70.0;
        let alerts = threshold_alerts(&snapshot, Some(Duration::from_secs(6)), &thresholds);
        let titles: Vec<&str> = alerts.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "API Response Time High",
                "GPU Memory High",
                "GPU Temperature High",
                "CPU Usage High",
                "Memory Usage High",
                "Disk Usage High",
            ]
        );
        assert!(alerts.iter().all(|a| a.severity == recovery_common::Severity::Warning));
        assert!(alerts[1].message.contains("GPU 0"));
    }

    #[test]
    fn no_alerts_below_thresholds() {
        let snapshot = ResourceSnapshot {
            cpu_percent: Some(35.0),
            memory_percent: Some(40.0),
            disk_percent: Some(10.0),
            ..Default::default()
        };
        let alerts = threshold_alerts(
            &snapshot,
            Some(Duration::from_millis(120)),
            &ThresholdConfig::default(),
        );
        assert!(alerts.is_empty());
    }
}
