pub mod config;
pub mod doctor;
pub mod enqueue;
pub mod migrate;

use serde_json::json;

/// Outcome of one CLI command: the process exit code plus the single
/// line printed to stdout.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self { exit_code: 0, output: render(command, "ok", None, &message.into()) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self { exit_code, output: render(command, "error", Some(error_class), &message.into()) }
    }
}

fn render(command: &str, status: &str, error_class: Option<&str>, message: &str) -> String {
    json!({
        "command": command,
        "status": status,
        "error_class": error_class,
        "message": message,
    })
    .to_string()
}
