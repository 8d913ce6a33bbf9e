use std::fmt;

use serde::{Deserialize, Serialize};

/// Exception raised by a remote computation, carried back with its traceback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Exception type name, e.g. `TypeError`.
    pub kind: String,
    pub message: String,
    /// Remote call stack, outermost frame first.
    pub traceback: Vec<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.traceback.push(frame.into());
        self
    }

    pub fn formatted_traceback(&self) -> String {
        let mut out = String::from("Remote traceback (most recent call last):\n");
        for frame in &self.traceback {
            out.push_str("  ");
            out.push_str(frame);
            out.push('\n');
        }
        out.push_str(&self.to_string());
        out
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Terminal outcome of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub error: Option<RemoteError>,
}

impl TaskResult {
    pub fn succeeded(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: RemoteError) -> Self {
        Self {
            task_id: task_id.into(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
