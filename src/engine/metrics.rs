use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::runner::RunnerState;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    sessions_started_total: AtomicU64,
    sessions_completed_total: AtomicU64,
    sessions_errored_total: AtomicU64,
    sessions_compile_failed_total: AtomicU64,
    sessions_timed_out_total: AtomicU64,
    sessions_cancelled_total: AtomicU64,
    provisioning_failures_total: AtomicU64,
    active_sandboxes: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished(&self, state: RunnerState) {
        let counter = match state {
            RunnerState::Completed => &self.sessions_completed_total,
            RunnerState::CompileFailed => &self.sessions_compile_failed_total,
            RunnerState::TimedOut => &self.sessions_timed_out_total,
            RunnerState::Terminated => &self.sessions_cancelled_total,
            RunnerState::RuntimeError | RunnerState::Idle | RunnerState::Compiling | RunnerState::Running => {
                &self.sessions_errored_total
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Host-side failure before or while running; counted as an error.
    pub fn session_failed(&self) {
        self.sessions_errored_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn provisioning_failed(&self) {
        self.provisioning_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandbox_acquired(&self) {
        self.active_sandboxes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandbox_released(&self) {
        let mut current = self.active_sandboxes.load(Ordering::Relaxed);
        while current > 0 {
            match self.active_sandboxes.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_sandboxes(&self) -> u64 {
        self.active_sandboxes.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE sandbox_sessions_started_total counter\n",
                "sandbox_sessions_started_total {}\n",
                "# TYPE sandbox_sessions_completed_total counter\n",
                "sandbox_sessions_completed_total {}\n",
                "# TYPE sandbox_sessions_errored_total counter\n",
                "sandbox_sessions_errored_total {}\n",
                "# TYPE sandbox_sessions_compile_failed_total counter\n",
                "sandbox_sessions_compile_failed_total {}\n",
                "# TYPE sandbox_sessions_timed_out_total counter\n",
                "sandbox_sessions_timed_out_total {}\n",
                "# TYPE sandbox_sessions_cancelled_total counter\n",
                "sandbox_sessions_cancelled_total {}\n",
                "# TYPE sandbox_provisioning_failures_total counter\n",
                "sandbox_provisioning_failures_total {}\n",
                "# TYPE sandbox_active gauge\n",
                "sandbox_active {}\n"
            ),
            self.sessions_started_total.load(Ordering::Relaxed),
            self.sessions_completed_total.load(Ordering::Relaxed),
            self.sessions_errored_total.load(Ordering::Relaxed),
            self.sessions_compile_failed_total.load(Ordering::Relaxed),
            self.sessions_timed_out_total.load(Ordering::Relaxed),
            self.sessions_cancelled_total.load(Ordering::Relaxed),
            self.provisioning_failures_total.load(Ordering::Relaxed),
            self.active_sandboxes.load(Ordering::Relaxed),
        )
    }
}
