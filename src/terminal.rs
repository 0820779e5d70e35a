//! Launching a runner inside the host terminal emulator.
//!
//! macOS only: Terminal.app and iTerm2 are driven through `osascript`.
//! Children opened this way are not our descendants, so the caller records
//! pid 0 and relies on the RPC connection for liveness. Other platforms
//! return `None` and the supervisor falls back to a background spawn.

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalApp {
    Terminal,
    ITerm2,
}

impl TerminalApp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Terminal" | "Terminal.app" => Some(TerminalApp::Terminal),
            "iTerm" | "iTerm2" => Some(TerminalApp::ITerm2),
            _ => None,
        }
    }
}

/// Open a terminal window running `command_line` in `cwd`. Returns a
/// window reference when the emulator reports one.
#[cfg(target_os = "macos")]
pub async fn open_window(
    app: TerminalApp,
    cwd: &str,
    command_line: &str,
) -> Result<Option<String>> {
    use anyhow::Context;

    let shell_line = format!("cd {} && {}", quoted(cwd), command_line);
    let script = match app {
        TerminalApp::Terminal => format!(
            "tell application \"Terminal\"\nactivate\ndo script \"{}\"\nend tell",
            escape_applescript(&shell_line)
        ),
        TerminalApp::ITerm2 => format!(
            "tell application \"iTerm2\"\ncreate window with default profile command \"{}\"\nend tell",
            escape_applescript(&shell_line)
        ),
    };

    let output = tokio::process::Command::new("osascript")
        .arg("-e")
        .arg(&script)
        .output()
        .await
        .context("failed to run osascript")?;

    if !output.status.success() {
        anyhow::bail!(
            "osascript exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let window = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if window.is_empty() { None } else { Some(window) })
}

#[cfg(not(target_os = "macos"))]
pub async fn open_window(
    _app: TerminalApp,
    _cwd: &str,
    _command_line: &str,
) -> Result<Option<String>> {
    tracing::warn!(
        target = "session_relay::terminal",
        "terminal-attached launch is macOS-only; falling back to background"
    );
    Ok(None)
}

#[allow(dead_code)]
fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[allow(dead_code)]
fn quoted(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}
