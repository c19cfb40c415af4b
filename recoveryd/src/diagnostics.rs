//! Diagnostic bundles captured when a failure streak starts.
//!
//! A bundle is a timestamped directory under the configured diagnostics
//! root. Allocation only names the bundle and touches no disk, so the
//! controller can log the path without delaying dispatch. Collection runs in
//! the background: it creates the directory, prunes old bundles and writes
//! whatever it can.
//! Every step is bounded by the step timeout and a failed step only adds a
//! line to `errors.txt`.

use crate::command::run_command;
use crate::resources::ResourceSampler;
use crate::runtime::ServiceRuntime;
use async_trait::async_trait;
use chrono::Utc;
use recovery_common::ErrorKind;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Path of an allocated bundle directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleId(PathBuf);

impl BundleId {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for BundleId {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[async_trait]
pub trait DiagnosticsCollector: Send + Sync {
    /// Name a bundle for `kind`. Pure; never fails.
    fn allocate(&self, kind: ErrorKind) -> BundleId;

    /// Fill the bundle. Never fails; partial bundles are expected.
    async fn collect(&self, bundle: BundleId, kind: ErrorKind);
}

#[derive(Debug, Clone, Serialize)]
struct StepResult {
    name: &'static str,
    ok: bool,
    error: Option<String>,
}

/// Bundles on the local filesystem.
pub struct FsDiagnostics {
    root: PathBuf,
    step_timeout: Duration,
    keep_bundles: usize,
    log_lines: u32,
    gpu_tool: String,
    runtime: Arc<dyn ServiceRuntime>,
    sampler: Arc<dyn ResourceSampler>,
}

impl FsDiagnostics {
    pub fn new(
        root: impl Into<PathBuf>,
        step_timeout: Duration,
        keep_bundles: usize,
        log_lines: u32,
        runtime: Arc<dyn ServiceRuntime>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            root: root.into(),
            step_timeout,
            keep_bundles,
            log_lines,
            gpu_tool: "nvidia-smi".to_string(),
            runtime,
            sampler,
        }
    }

    #[cfg(test)]
    pub fn with_gpu_tool(mut self, tool: impl Into<String>) -> Self {
        self.gpu_tool = tool.into();
        self
    }

    /// Remove the oldest bundles so at most `keep_bundles` remain.
    async fn prune(&self) {
        if self.keep_bundles == 0 {
            return;
        }
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return;
        };
        let mut bundles = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                bundles.push(entry.path());
            }
        }
        if bundles.len() <= self.keep_bundles {
            return;
        }
        // Names start with a UTC timestamp, so lexical order is age order.
        bundles.sort();
        let excess = bundles.len() - self.keep_bundles;
        for old in bundles.into_iter().take(excess) {
            match tokio::fs::remove_dir_all(&old).await {
                Ok(()) => debug!("Pruned diagnostic bundle {:?}", old),
                Err(e) => warn!("Failed to prune diagnostic bundle {:?}: {}", old, e),
            }
        }
    }

    async fn step<F>(&self, name: &'static str, work: F) -> StepResult
    where
        F: Future<Output = Result<(), String>>,
    {
        let error = match tokio::time::timeout(self.step_timeout, work).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(format!("timed out after {}s", self.step_timeout.as_secs_f64())),
        };
        if let Some(e) = &error {
            debug!(step = name, error = %e, "Diagnostic step failed");
        }
        StepResult {
            name,
            ok: error.is_none(),
            error,
        }
    }
}

const PS_COLUMNS: &str = "pid,pcpu,pmem,stat,etime,args";

/// Keep the `ps` header plus rows whose command line mentions `needle`.
pub fn filter_process_rows(ps_output: &str, needle: &str) -> String {
    let needle = needle.to_ascii_lowercase();
    let mut lines = ps_output.lines();
    let mut kept: Vec<&str> = lines.next().into_iter().collect();
    kept.extend(lines.filter(|l| l.to_ascii_lowercase().contains(&needle)));
    kept.join("\n") + "\n"
}

async fn write_file(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> Result<(), String> {
    tokio::fs::write(dir.join(name), contents)
        .await
        .map_err(|e| format!("write {name}: {e}"))
}

#[async_trait]
impl DiagnosticsCollector for FsDiagnostics {
    fn allocate(&self, kind: ErrorKind) -> BundleId {
        let uuid = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            kind.as_str(),
            &uuid[..8]
        );
        BundleId(self.root.join(name))
    }

    async fn collect(&self, bundle: BundleId, kind: ErrorKind) {
        let dir = bundle.path();
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Diagnostic bundle {} unavailable: {}", bundle, e);
            return;
        }
        self.prune().await;

        let mut steps = Vec::with_capacity(5);

        steps.push(
            self.step("service-status.txt", async {
                let text = self.runtime.status_text().await.map_err(|e| e.to_string())?;
                write_file(dir, "service-status.txt", text).await
            })
            .await,
        );

        steps.push(
            self.step("service.log", async {
                let logs = self
                    .runtime
                    .recent_logs(self.log_lines)
                    .await
                    .map_err(|e| e.to_string())?;
                write_file(dir, "service.log", logs).await
            })
            .await,
        );

        steps.push(
            self.step("gpu.txt", async {
                let output = run_command(&self.gpu_tool, &[], self.step_timeout)
                    .await
                    .map_err(|e| e.to_string())?;
                write_file(dir, "gpu.txt", format!("{}{}", output.stdout, output.stderr)).await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(format!("{}: {}", self.gpu_tool, output.failure_detail()))
                }
            })
            .await,
        );

        steps.push(
            self.step("processes.txt", async {
                let output = run_command("ps", &["-eo", PS_COLUMNS], self.step_timeout)
                    .await
                    .map_err(|e| e.to_string())?;
                if !output.success() {
                    return Err(format!("ps: {}", output.failure_detail()));
                }
                write_file(dir, "processes.txt", filter_process_rows(&output.stdout, "vllm")).await
            })
            .await,
        );

        steps.push(
            self.step("resources.json", async {
                let snapshot = self.sampler.sample().await;
                let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| e.to_string())?;
                write_file(dir, "resources.json", json).await
            })
            .await,
        );

        let failures: Vec<String> = steps
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {}", s.name, e)))
            .collect();
        if !failures.is_empty() {
            if let Err(e) = write_file(dir, "errors.txt", failures.join("\n") + "\n").await {
                warn!("{}", e);
            }
        }

        let summary = json!({
            "error_kind": kind,
            "bundle": bundle,
            "collected_at": Utc::now().to_rfc3339(),
            "steps": steps,
        });
        match serde_json::to_vec_pretty(&summary) {
            Ok(bytes) => {
                if let Err(e) = write_file(dir, "summary.json", bytes).await {
                    warn!("{}", e);
                }
            }
            Err(e) => warn!("Failed to serialize diagnostic summary: {}", e),
        }

        info!(
            bundle = %bundle,
            kind = %kind,
            failed_steps = failures.len(),
            "Diagnostics collected"
        );
    }
}
