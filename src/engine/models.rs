use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::events::StatusKind;

/// One submitted program. Immutable once accepted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: String,
}

impl ExecutionRequest {
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        stdin: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            stdin: stdin.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    /// CPU quota as a percentage of one scheduling period.
    pub cpu_percent: u64,
    pub max_processes: u64,
    pub run_timeout_ms: u64,
    pub compile_timeout_ms: u64,
    pub max_output_bytes: usize,
}

impl SandboxLimits {
    pub const CPU_PERIOD_US: i64 = 100_000;

    pub fn normalized(mut self) -> Self {
        self.memory_mb = self.memory_mb.clamp(32, 8192);
        self.cpu_percent = self.cpu_percent.clamp(5, 400);
        self.max_processes = self.max_processes.clamp(1, 4096);
        self.run_timeout_ms = self.run_timeout_ms.clamp(50, 120_000);
        self.compile_timeout_ms = self.compile_timeout_ms.clamp(1_000, 300_000);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 16 * 1024 * 1024);
        self
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    pub fn cpu_quota_us(&self) -> i64 {
        Self::CPU_PERIOD_US * self.cpu_percent as i64 / 100
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu_percent: 50,
            max_processes: 64,
            run_timeout_ms: 10_000,
            compile_timeout_ms: 30_000,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Post-exit accounting. Memory and CPU are `None` when the backend could not
/// read them; wall time is always known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(rename = "memoryUsageMB")]
    pub memory_usage_mb: Option<f64>,
    #[serde(rename = "cpuUsagePercent")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(rename = "execTimeSeconds")]
    pub exec_time_seconds: f64,
}

/// Entry of the language set surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    pub id: String,
    pub display_name: String,
    pub file_extension: String,
}

/// What the engine hands to reporting once a session is over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub session_id: String,
    pub language: String,
    pub code_snippet: String,
    pub status: StatusKind,
    pub reason: Option<String>,
    pub usage: Option<ResourceUsage>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionSummary {
    pub const SNIPPET_CHARS: usize = 200;

    pub fn snippet(code: &str) -> String {
        code.chars().take(Self::SNIPPET_CHARS).collect()
    }
}
