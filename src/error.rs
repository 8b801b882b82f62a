use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Git command `{}` failed{}: {}", .command, exit_label(.exit_code), .stderr)]
    Git {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to parse ignore patterns: {0}")]
    PatternParse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {}", code),
        None => String::new(),
    }
}

impl AppError {
    /// Git failure without a subprocess exit, e.g. a timeout or a parse error
    /// on the command's output.
    pub fn git(command: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Git {
            command: command.into(),
            exit_code: None,
            stderr: message.into(),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
