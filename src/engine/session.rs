use std::{fmt, time::Instant};

use chrono::{DateTime, Utc};
use rand::RngCore;

/// Bytes of entropy behind session ids and sandbox names.
const TOKEN_BYTES: usize = 16;

/// Hex token drawn from the thread-local CSPRNG. Used wherever a name maps to
/// a live filesystem path or container, so it must not be guessable.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(random_token())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scope under which compile-phase output is published.
    pub fn compile_scope(&self) -> String {
        format!("{}-compile", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub started: Instant,
}

impl Session {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            id: SessionId::generate(),
            language: language.into(),
            created_at: Utc::now(),
            started: Instant::now(),
        }
    }
}
