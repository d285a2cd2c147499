//! Post-delivery command execution.
//!
//! The `invoke-command` template may reference file metadata:
//! `{file}` (remote name), `{path}` (local path, or the name when nothing
//! was downloaded), `{type}`, `{size}` and `{time}` (delivery time, UTC).
//! Substituted values are shell-escaped; the command runs under `sh -c`.

use crate::error::{Result, SubscriptionError};
use crate::types::{FileResult, Timestamp};
use shell_escape::escape;
use std::borrow::Cow;
use std::process::Command;
use tracing::debug;

/// A parsed invocation command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    template: String,
}

impl Invocation {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// The shell command line for `file`.
    pub fn render(&self, file: &FileResult, at: Timestamp) -> String {
        let path = file
            .local_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| file.name.clone());
        let size = file.size.map(|s| s.to_string()).unwrap_or_default();

        self.template
            .replace("{file}", &quote(&file.name))
            .replace("{path}", &quote(&path))
            .replace("{type}", &quote(&file.file_type))
            .replace("{size}", &quote(&size))
            .replace("{time}", &quote(&at.to_string()))
    }

    /// Run the command for `file`; a spawn failure or non-zero exit is an
    /// [`SubscriptionError::Invocation`].
    pub fn run(&self, file: &FileResult, at: Timestamp) -> Result<()> {
        let line = self.render(file, at);
        debug!(command = %line, file = %file.name, "running invocation command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .output()
            .map_err(|e| SubscriptionError::Invocation(format!("{line}: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SubscriptionError::Invocation(format!(
            "{line}: exited with {}{}",
            output.status,
            if stderr.trim().is_empty() {
                String::new()
            } else {
                format!(": {}", stderr.trim())
            }
        )))
    }
}

fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}
