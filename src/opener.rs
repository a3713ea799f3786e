use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Opens `path` in the platform's default viewer without waiting for it.
///
/// The viewer is reaped on a background task.
pub fn open_path(path: &Path) -> Result<()> {
    let mut command = viewer_command(path);
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to open {}", path.display()))?;
    let shown = path.display().to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!(path = %shown, ?status, "log viewer failed");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(path = %shown, error = %err, "log viewer wait failed"),
        }
    });
    Ok(())
}

#[cfg(target_os = "macos")]
fn viewer_command(path: &Path) -> Command {
    let mut command = Command::new("open");
    command.arg(path);
    command
}

#[cfg(windows)]
fn viewer_command(path: &Path) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", ""]).arg(path);
    command
}

#[cfg(not(any(windows, target_os = "macos")))]
fn viewer_command(path: &Path) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(path);
    command
}
