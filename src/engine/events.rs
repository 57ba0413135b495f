use serde::{Deserialize, Serialize};

use crate::engine::models::ResourceUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Compiling,
    Running,
    Completed,
    Error,
    Terminated,
}

impl StatusKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compiling => "compiling",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Status {
        data: StatusKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<ResourceUsage>,
    },
    /// Fatal host-side failure; always terminal and already sanitized.
    Error {
        data: String,
    },
}

/// One unit of output or lifecycle signal. `scope` is the session id, or the
/// session's compile scope for compiler output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    #[serde(rename = "sessionId")]
    pub scope: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl OutputEvent {
    pub fn stdout(scope: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            payload: EventPayload::Stdout { data: data.into() },
        }
    }

    pub fn stderr(scope: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            payload: EventPayload::Stderr { data: data.into() },
        }
    }

    pub fn status(scope: impl Into<String>, kind: StatusKind) -> Self {
        Self {
            scope: scope.into(),
            payload: EventPayload::Status {
                data: kind,
                reason: None,
                exit_code: None,
                usage: None,
            },
        }
    }

    pub fn finished(
        scope: impl Into<String>,
        kind: StatusKind,
        reason: Option<String>,
        exit_code: Option<i64>,
        usage: Option<ResourceUsage>,
    ) -> Self {
        Self {
            scope: scope.into(),
            payload: EventPayload::Status {
                data: kind,
                reason,
                exit_code,
                usage,
            },
        }
    }

    pub fn error(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            payload: EventPayload::Error {
                data: message.into(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        match &self.payload {
            EventPayload::Status { data, .. } => data.is_terminal(),
            EventPayload::Error { .. } => true,
            EventPayload::Stdout { .. } | EventPayload::Stderr { .. } => false,
        }
    }

    pub fn status_kind(&self) -> Option<StatusKind> {
        match &self.payload {
            EventPayload::Status { data, .. } => Some(*data),
            _ => None,
        }
    }
}
