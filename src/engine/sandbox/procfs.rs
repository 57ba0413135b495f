//! `/proc` readings for sandboxes that are plain process groups. On hosts
//! without procfs every read misses and the tracker simply stays empty.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::engine::{
    accounting::{CpuReading, UsageTracker},
    sandbox::lock,
};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Samples `pid` until it disappears or turns into a zombie. Meant to be
/// aborted once the process has been reaped.
pub(super) async fn sample_until_exit(pid: u32, tracker: Arc<Mutex<UsageTracker>>) {
    while sample_once(pid, &tracker).await {
        tokio::time::sleep(SAMPLE_INTERVAL).await;
    }
}

async fn sample_once(pid: u32, tracker: &Mutex<UsageTracker>) -> bool {
    let (stat, status, system) = tokio::join!(
        read(format!("/proc/{pid}/stat")),
        read(format!("/proc/{pid}/status")),
        read("/proc/stat".to_string()),
    );
    let Some(stat) = stat else {
        return false;
    };
    let Some(process) = parse_process_stat(&stat) else {
        return false;
    };

    let mut tracker = lock(tracker);
    if let Some(system_total) = system.as_deref().and_then(parse_system_cpu) {
        tracker.observe_cpu(CpuReading {
            cpu_total: process.cpu_ticks,
            system_total,
        });
    }
    if let Some(peak) = status.as_deref().and_then(parse_peak_rss) {
        tracker.observe_memory(peak);
    }
    process.state != 'Z'
}

async fn read(path: String) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

#[derive(Debug, PartialEq, Eq)]
struct ProcessStat {
    state: char,
    cpu_ticks: u64,
}

/// utime + stime + cutime + cstime. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_process_stat(stat: &str) -> Option<ProcessStat> {
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let cpu_ticks = fields
        .get(11..15)?
        .iter()
        .map(|field| field.parse::<u64>().ok())
        .sum::<Option<u64>>()?;
    Some(ProcessStat { state, cpu_ticks })
}

/// Total host jiffies from the aggregate `cpu` line (guest time is already
/// counted in user time).
fn parse_system_cpu(stat: &str) -> Option<u64> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    line.split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| field.parse::<u64>().ok())
        .sum()
}

fn parse_peak_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmHWM:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
