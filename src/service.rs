//! Data structures for tracking services.
//!
//! This module defines how a registered script is launched (`LaunchPlan`), its
//! current lifecycle status (`ServiceStatus`) and the runtime record shown in the
//! service table (`ServiceState`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use thiserror::Error;

/// Stable identifier of a registered service for the lifetime of the program.
///
/// Indices shift when services are removed, ids do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u64);

/// Specification for a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    /// The path exactly as stored in the config.
    pub path: String,
    /// The log file receiving stdout and stderr.
    pub log_path: PathBuf,
}

impl ServiceSpec {
    pub fn new(id: ServiceId, path: impl Into<String>) -> Self {
        let path = path.into();
        let log_path = log_path_for(Path::new(&path));
        Self { id, path, log_path }
    }

    pub fn script(&self) -> &Path {
        Path::new(&self.path)
    }

    /// File name for compact messages.
    pub fn file_name(&self) -> String {
        self.script()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("script not found: {0}")]
    Missing(String),
    #[error(".exe services are only supported on Windows")]
    ExeUnsupported,
    #[error("invalid python command {command:?}: {reason}")]
    InvalidInterpreter { command: String, reason: String },
}

/// How a service script gets executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Services run from their own folder.
    pub cwd: PathBuf,
}

impl LaunchPlan {
    /// Builds the launch plan for `script` based on its extension.
    ///
    /// `.py` scripts run through `python` (split shell-style, so "py -3" works),
    /// `.exe` files run directly on Windows only, everything else is executed as is.
    pub fn for_script(script: &Path, python: &str) -> Result<Self, LaunchError> {
        if !script.exists() {
            return Err(LaunchError::Missing(script.display().to_string()));
        }
        let cwd = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let ext = script
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let (program, args) = match ext.as_str() {
            "py" => {
                let mut parts =
                    shell_words::split(python).map_err(|err| LaunchError::InvalidInterpreter {
                        command: python.to_string(),
                        reason: err.to_string(),
                    })?;
                if parts.is_empty() {
                    return Err(LaunchError::InvalidInterpreter {
                        command: python.to_string(),
                        reason: "empty command".to_string(),
                    });
                }
                let program = OsString::from(parts.remove(0));
                let mut args: Vec<OsString> = parts.into_iter().map(OsString::from).collect();
                args.push(script.as_os_str().to_os_string());
                (program, args)
            }
            "exe" if !cfg!(windows) => return Err(LaunchError::ExeUnsupported),
            _ => (script.as_os_str().to_os_string(), Vec::new()),
        };
        Ok(Self { program, args, cwd })
    }

    /// Shell-quoted rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.program.to_string_lossy().into_owned());
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        shell_words::join(parts)
    }
}

/// Interpreter used for `.py` services when none is configured.
pub fn default_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// The lifecycle status of a service, ignoring whether its file exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Never started in this session, or stopped before it ran.
    Stopped,
    Running,
    /// The last run ended. Signal deaths carry the negated signal number.
    Exited { code: Option<i32> },
}

/// What the service table shows for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Running,
    Stopped,
    Exited(Option<i32>),
    Missing,
}

impl DisplayStatus {
    pub fn label(&self) -> String {
        match self {
            DisplayStatus::Running => "RUNNING".to_string(),
            DisplayStatus::Stopped => "STOPPED".to_string(),
            DisplayStatus::Exited(Some(code)) => format!("EXIT({})", code),
            DisplayStatus::Exited(None) => "EXIT(?)".to_string(),
            DisplayStatus::Missing => "MISSING".to_string(),
        }
    }
}

/// Runtime state of a single service.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub spec: ServiceSpec,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    /// Whether the script existed at the last refresh.
    pub exists: bool,
    /// Modification time label from the last refresh.
    pub mtime: String,
    /// Marked for a bulk action.
    pub marked: bool,
}

impl ServiceState {
    pub fn new(spec: ServiceSpec) -> Self {
        let mut state = Self {
            spec,
            status: ServiceStatus::Stopped,
            pid: None,
            started_at: None,
            exists: false,
            mtime: String::new(),
            marked: false,
        };
        state.refresh_file_info();
        state
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }

    /// Re-reads existence and modification time of the script.
    pub fn refresh_file_info(&mut self) {
        let script = self.spec.script();
        self.exists = script.exists();
        self.mtime = mtime_label(script);
    }

    /// Missing files win over every runtime status.
    pub fn display_status(&self) -> DisplayStatus {
        if !self.exists {
            return DisplayStatus::Missing;
        }
        match self.status {
            ServiceStatus::Running => DisplayStatus::Running,
            ServiceStatus::Exited { code } => DisplayStatus::Exited(code),
            ServiceStatus::Stopped => DisplayStatus::Stopped,
        }
    }

    pub fn pid_label(&self) -> String {
        match (self.is_running(), self.pid) {
            (true, Some(pid)) => pid.to_string(),
            _ => String::new(),
        }
    }

    pub fn uptime_label(&self) -> String {
        match (self.is_running(), self.started_at) {
            (true, Some(at)) => format_uptime(at.elapsed()),
            _ => String::new(),
        }
    }
}

/// Turns user input into the absolute path stored in the config.
///
/// Surrounding quotes (as pasted from file managers) are dropped. The file
/// must exist.
pub fn normalize_script_path(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed);
    if unquoted.is_empty() {
        anyhow::bail!("no path given");
    }
    let path = std::path::absolute(unquoted)
        .with_context(|| format!("failed to resolve {}", unquoted))?;
    if !path.is_file() {
        anyhow::bail!("no such file: {}", path.display());
    }
    Ok(path.to_string_lossy().into_owned())
}

/// The log file next to a script: same stem, `.log` extension.
pub fn log_path_for(script: &Path) -> PathBuf {
    script.with_extension("log")
}

/// Local modification time as `YYYY-mm-dd HH:MM:SS`, or `N/A`.
pub fn mtime_label(path: &Path) -> String {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => chrono::DateTime::<chrono::Local>::from(modified)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => "N/A".to_string(),
    }
}

pub fn format_uptime(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (minutes, seconds) = (secs / 60, secs % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
