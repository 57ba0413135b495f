use std::time::Instant;

use crate::engine::{
    events::StatusKind,
    models::ResourceUsage,
    sandbox::{SandboxBackend, SandboxHandle},
};

/// Cumulative CPU counters at one instant: time spent by the sandbox and by
/// the whole host, in the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuReading {
    pub cpu_total: u64,
    pub system_total: u64,
}

/// Samples gathered while a sandbox runs. The first and latest CPU readings
/// bracket the run; memory keeps its peak.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTracker {
    first_cpu: Option<CpuReading>,
    last_cpu: Option<CpuReading>,
    peak_memory_bytes: Option<u64>,
}

impl UsageTracker {
    pub fn observe_cpu(&mut self, reading: CpuReading) {
        if self.first_cpu.is_none() {
            self.first_cpu = Some(reading);
        }
        self.last_cpu = Some(reading);
    }

    pub fn observe_memory(&mut self, bytes: u64) {
        self.peak_memory_bytes = Some(self.peak_memory_bytes.map_or(bytes, |peak| peak.max(bytes)));
    }

    pub fn is_empty(&self) -> bool {
        self.last_cpu.is_none() && self.peak_memory_bytes.is_none()
    }

    pub fn cpu_usage_percent(&self) -> Option<f64> {
        let (first, last) = (self.first_cpu?, self.last_cpu?);
        let cpu_delta = last.cpu_total as f64 - first.cpu_total as f64;
        let system_delta = last.system_total as f64 - first.system_total as f64;
        Some(cpu_percent(cpu_delta, system_delta))
    }

    pub fn memory_usage_mb(&self) -> Option<f64> {
        self.peak_memory_bytes.map(bytes_to_mb)
    }
}

/// `(cpu_delta / system_delta) * 100`, or 0 when the host delta is not
/// positive. Never NaN or infinite.
pub fn cpu_percent(cpu_delta: f64, system_delta: f64) -> f64 {
    if !(system_delta > 0.0) || !cpu_delta.is_finite() || cpu_delta <= 0.0 {
        return 0.0;
    }
    round2(cpu_delta / system_delta * 100.0)
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn summarize(tracker: Option<&UsageTracker>, started: Instant, exited: Instant) -> ResourceUsage {
    ResourceUsage {
        memory_usage_mb: tracker.and_then(UsageTracker::memory_usage_mb),
        cpu_usage_percent: tracker.and_then(UsageTracker::cpu_usage_percent),
        exec_time_seconds: round3(exited.saturating_duration_since(started).as_secs_f64()),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Reads the sandbox's accounting after exit and before removal. A backend
/// that cannot report leaves memory and CPU empty; wall time is always set.
pub async fn collect(
    backend: &dyn SandboxBackend,
    sandbox: &SandboxHandle,
    started: Instant,
    exited: Instant,
) -> ResourceUsage {
    let tracker = backend.collect_usage(sandbox).await;
    if tracker.is_none() {
        tracing::debug!(
            session_id = %sandbox.session_id(),
            backend = backend.name(),
            "resource stats unavailable"
        );
    }
    summarize(tracker.as_ref(), started, exited)
}

/// How a finished process is reported to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub kind: StatusKind,
    pub reason: String,
}

impl Termination {
    pub fn new(kind: StatusKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Backend-specific mapping from exit codes to user-facing reasons.
pub trait ExitCodeTable: Send + Sync {
    fn describe(&self, exit_code: i64) -> Termination;
}

/// Container runtime conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerExitCodes;

impl ExitCodeTable for ContainerExitCodes {
    fn describe(&self, exit_code: i64) -> Termination {
        match exit_code {
            0 => Termination::new(StatusKind::Completed, "completed"),
            137 => Termination::new(StatusKind::Terminated, "memory limit exceeded"),
            124 => Termination::new(StatusKind::Terminated, "execution timeout"),
            139 => Termination::new(StatusKind::Error, "segmentation fault"),
            134 => Termination::new(StatusKind::Error, "aborted"),
            code => Termination::new(
                StatusKind::Error,
                format!("terminated with exit code {code}"),
            ),
        }
    }
}

/// Plain processes report signals as `128 + signo`. Without a cgroup a
/// SIGKILL is not necessarily an OOM kill, and rlimits add SIGXCPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalExitCodes;

impl ExitCodeTable for SignalExitCodes {
    fn describe(&self, exit_code: i64) -> Termination {
        const SIGNAL_BASE: i64 = 128;
        match exit_code - SIGNAL_BASE {
            signo if signo == libc::SIGKILL as i64 => {
                Termination::new(StatusKind::Terminated, "killed")
            }
            signo if signo == libc::SIGXCPU as i64 => {
                Termination::new(StatusKind::Terminated, "cpu time limit exceeded")
            }
            signo if signo == libc::SIGXFSZ as i64 => {
                Termination::new(StatusKind::Error, "file size limit exceeded")
            }
            _ => ContainerExitCodes.describe(exit_code),
        }
    }
}
