use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use crate::engine::models::SandboxLimits;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub sandbox_backend: SandboxBackendKind,
    pub sandbox_root: PathBuf,
    pub sandbox_user: String,
    pub limits: SandboxLimits,
    pub max_code_bytes: usize,
    pub max_stdin_bytes: usize,
    pub max_concurrent_sessions: usize,
    pub language_images: HashMap<String, String>,
    pub summaries_path: Option<PathBuf>,
    pub summary_history: usize,
    pub log_level: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = SandboxLimits::default();
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            sandbox_backend: env_parse("SANDBOX_BACKEND", SandboxBackendKind::Docker),
            sandbox_root: env::var("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_sandbox_root()),
            sandbox_user: env::var("SANDBOX_USER").unwrap_or_else(|_| "65534:65534".to_string()),
            limits: SandboxLimits {
                memory_mb: env_parse("SANDBOX_MEMORY_MB", defaults.memory_mb),
                cpu_percent: env_parse("SANDBOX_CPU_PERCENT", defaults.cpu_percent),
                max_processes: env_parse("SANDBOX_PIDS_LIMIT", defaults.max_processes),
                run_timeout_ms: env_parse("RUN_TIMEOUT_MS", defaults.run_timeout_ms),
                compile_timeout_ms: env_parse("COMPILE_TIMEOUT_MS", defaults.compile_timeout_ms),
                max_output_bytes: env_parse("MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            }
            .normalized(),
            max_code_bytes: env_parse("MAX_CODE_BYTES", 256_000usize),
            max_stdin_bytes: env_parse("MAX_STDIN_BYTES", 256_000usize),
            max_concurrent_sessions: env_parse("MAX_CONCURRENT_SESSIONS", 32usize).max(1),
            language_images: parse_language_images(
                &env::var("LANGUAGE_IMAGES").unwrap_or_default(),
            ),
            summaries_path: env::var("PERSIST_SUMMARIES_PATH").ok().map(PathBuf::from),
            summary_history: env_parse("SUMMARY_HISTORY", 256usize),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Configuration rooted at `sandbox_root` with default limits; the base
    /// for embedding the engine without environment variables.
    pub fn with_root(sandbox_backend: SandboxBackendKind, sandbox_root: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            sandbox_backend,
            sandbox_root,
            sandbox_user: "65534:65534".to_string(),
            limits: SandboxLimits::default(),
            max_code_bytes: 256_000,
            max_stdin_bytes: 256_000,
            max_concurrent_sessions: 32,
            language_images: HashMap::new(),
            summaries_path: None,
            summary_history: 256,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" | "container" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    env::temp_dir().join("sandbox-exec")
}

/// `python=registry/python:3.12,cpp=registry/gcc:14`
fn parse_language_images(input: &str) -> HashMap<String, String> {
    let mut images = HashMap::new();
    for raw in input.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((language, image)) = entry.split_once('=') {
            let (language, image) = (language.trim(), image.trim());
            if !language.is_empty() && !image.is_empty() {
                images.insert(language.to_ascii_lowercase(), image.to_string());
            }
        }
    }
    images
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
