//! Service execution and management.
//!
//! This module contains the `ServiceManager`, which is responsible for spawning,
//! stopping and monitoring service processes. Output goes straight into each
//! service's log file; lifecycle changes are reported on the event channel.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::events::{Event, ServiceSignal};
use crate::service::{LaunchPlan, ServiceId, ServiceSpec};

/// Manages the lifecycle of service processes.
pub struct ServiceManager {
    services: Vec<ManagedService>,
    event_tx: mpsc::UnboundedSender<Event>,
    stop: StopConfig,
    python: String,
}

struct ManagedService {
    spec: ServiceSpec,
    child: Option<Child>,
    shutdown_deadline: Option<tokio::time::Instant>,
}

/// Timeouts of the terminate-then-kill sequence.
#[derive(Debug, Clone, Copy)]
pub struct StopConfig {
    grace_ms: u64,
    timeout_ms: u64,
    shutdown_ms: u64,
}

impl StopConfig {
    pub fn new(grace_ms: u64, timeout_ms: u64, shutdown_ms: u64) -> Self {
        Self {
            grace_ms,
            timeout_ms,
            shutdown_ms,
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

impl ServiceManager {
    pub fn new(
        specs: Vec<ServiceSpec>,
        python: impl Into<String>,
        event_tx: mpsc::UnboundedSender<Event>,
        stop: StopConfig,
    ) -> Self {
        let services = specs.into_iter().map(ManagedService::new).collect();
        Self {
            services,
            event_tx,
            stop,
            python: python.into(),
        }
    }

    pub fn add(&mut self, spec: ServiceSpec) {
        self.services.push(ManagedService::new(spec));
    }

    /// Force-stops the service if needed and forgets it.
    pub async fn remove(&mut self, id: ServiceId) -> Result<()> {
        self.stop_service(id, true).await?;
        self.services.retain(|s| s.spec.id != id);
        Ok(())
    }

    pub fn is_running(&self, id: ServiceId) -> bool {
        self.get(id).map(|s| s.child.is_some()).unwrap_or(false)
    }

    pub fn any_running(&self) -> bool {
        self.services.iter().any(|s| s.child.is_some())
    }

    /// Starts a service unless it is already running.
    ///
    /// The log file gets a `=== START <time> ===` banner and then receives both
    /// stdout and stderr. The process runs from the script's folder in its own
    /// process group.
    pub async fn start_service(&mut self, id: ServiceId) -> Result<()> {
        let Some(spec) = self.get(id).map(|s| s.spec.clone()) else {
            return Ok(());
        };
        if self.is_running(id) {
            return Ok(());
        }

        let plan = LaunchPlan::for_script(spec.script(), &self.python)?;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .with_context(|| format!("failed to open log {}", spec.log_path.display()))?;
        write!(
            log,
            "\n=== START {} ===\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )
        .and_then(|_| log.flush())
        .with_context(|| format!("failed to write log {}", spec.log_path.display()))?;
        let stderr_log = log
            .try_clone()
            .with_context(|| format!("failed to share log {}", spec.log_path.display()))?;

        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .current_dir(&plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", plan.display()))?;
        let pid = child.id().unwrap_or(0);
        tracing::info!(service = %spec.path, pid, cmd = %plan.display(), "service started");

        if let Some(service) = self.get_mut(id) {
            service.child = Some(child);
            service.shutdown_deadline = None;
        }
        let _ = self.event_tx.send(Event::ServiceStarted { id, pid });
        Ok(())
    }

    /// Stops a running service.
    ///
    /// Sends a terminate request to the process group. A forced stop escalates
    /// to a kill after the grace period. Either way the process gets at most the
    /// stop timeout to exit before it is killed.
    pub async fn stop_service(&mut self, id: ServiceId, force: bool) -> Result<()> {
        let Some(mut child) = self.get_mut(id).and_then(|s| {
            s.shutdown_deadline = None;
            s.child.take()
        }) else {
            return Ok(());
        };
        let pid = child.id();

        // Windows has no polite signal worth waiting on for a forced stop.
        let polite = !(cfg!(windows) && force);
        if polite {
            if let Some(pid) = pid {
                self.send_signal(id, pid, ServiceSignal::Term);
            }
        }
        if force || cfg!(windows) {
            let grace = if polite { self.stop.grace() } else { Duration::ZERO };
            if wait_for_exit(&mut child, grace).await?.is_none() {
                self.kill(id, &mut child);
            }
        }

        let status = match wait_for_exit(&mut child, self.stop.timeout()).await {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                self.kill(id, &mut child);
                child.wait().await.map_err(anyhow::Error::from)
            }
            Err(err) => Err(err),
        };
        match status {
            Ok(status) => self.report_exit(id, &status),
            Err(err) => {
                let _ = self
                    .event_tx
                    .send(Event::ServiceFailed {
                        id,
                        error: err.to_string(),
                    });
            }
        }
        Ok(())
    }

    pub async fn restart_service(&mut self, id: ServiceId) -> Result<()> {
        self.stop_service(id, true).await?;
        self.start_service(id).await
    }

    /// Starts every service in `ids`, returning the failures.
    ///
    /// One failure does not prevent the remaining services from starting.
    pub async fn start_many(&mut self, ids: &[ServiceId]) -> Vec<(ServiceId, anyhow::Error)> {
        let mut failures = Vec::new();
        for &id in ids {
            if let Err(err) = self.start_service(id).await {
                tracing::warn!(service = ?self.path_of(id), error = %err, "start failed");
                failures.push((id, err));
            }
        }
        failures
    }

    pub async fn restart_many(&mut self, ids: &[ServiceId]) -> Vec<(ServiceId, anyhow::Error)> {
        let mut failures = Vec::new();
        for &id in ids {
            if let Err(err) = self.restart_service(id).await {
                tracing::warn!(service = ?self.path_of(id), error = %err, "restart failed");
                failures.push((id, err));
            }
        }
        failures
    }

    pub async fn stop_many(&mut self, ids: &[ServiceId], force: bool) {
        for &id in ids {
            if let Err(err) = self.stop_service(id, force).await {
                tracing::warn!(service = ?self.path_of(id), error = %err, "stop failed");
            }
        }
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.iter().map(|s| s.spec.id).collect()
    }

    /// Reports services that exited on their own and advances pending shutdowns.
    pub async fn poll_exits(&mut self) {
        let mut exited = Vec::new();
        for service in self.services.iter_mut() {
            let Some(child) = service.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    service.child = None;
                    service.shutdown_deadline = None;
                    exited.push((service.spec.id, Ok(status)));
                }
                Ok(None) => {}
                Err(err) => {
                    service.child = None;
                    service.shutdown_deadline = None;
                    exited.push((service.spec.id, Err(err)));
                }
            }
        }
        for (id, result) in exited {
            match result {
                Ok(status) => self.report_exit(id, &status),
                Err(err) => {
                    let _ = self
                        .event_tx
                        .send(Event::ServiceFailed {
                            id,
                            error: err.to_string(),
                        });
                }
            }
        }
        self.poll_shutdowns().await;
    }

    /// Asks every running service to terminate without waiting for it.
    ///
    /// `poll_exits` kills whatever is still alive once the shutdown timeout
    /// has passed.
    pub async fn begin_shutdown_all(&mut self) {
        let deadline = tokio::time::Instant::now() + self.stop.shutdown();
        let mut targets = Vec::new();
        for service in self.services.iter_mut() {
            if service.shutdown_deadline.is_some() {
                continue;
            }
            if let Some(pid) = service.child.as_ref().and_then(|c| c.id()) {
                service.shutdown_deadline = Some(deadline);
                targets.push((service.spec.id, pid));
            }
        }
        for (id, pid) in targets {
            self.send_signal(id, pid, ServiceSignal::Term);
        }
    }

    async fn poll_shutdowns(&mut self) {
        let now = tokio::time::Instant::now();
        let mut overdue = Vec::new();
        for service in self.services.iter_mut() {
            if service.child.is_none() {
                service.shutdown_deadline = None;
                continue;
            }
            if service.shutdown_deadline.map(|d| now >= d).unwrap_or(false) {
                service.shutdown_deadline = None;
                if let Some(child) = service.child.take() {
                    overdue.push((service.spec.id, child));
                }
            }
        }

        for (id, mut child) in overdue {
            self.kill(id, &mut child);
            match wait_for_exit(&mut child, Duration::from_millis(500)).await {
                Ok(Some(status)) => self.report_exit(id, &status),
                Ok(None) => match child.wait().await {
                    Ok(status) => self.report_exit(id, &status),
                    Err(err) => {
                        let _ = self
                            .event_tx
                            .send(Event::ServiceFailed { id, error: err.to_string() });
                    }
                },
                Err(err) => {
                    let _ = self
                        .event_tx
                        .send(Event::ServiceFailed { id, error: err.to_string() });
                }
            }
        }
    }

    /// Force-stops everything that is still running.
    pub async fn shutdown_all(&mut self) {
        let ids = self.ids();
        self.stop_many(&ids, true).await;
    }

    fn get(&self, id: ServiceId) -> Option<&ManagedService> {
        self.services.iter().find(|s| s.spec.id == id)
    }

    fn get_mut(&mut self, id: ServiceId) -> Option<&mut ManagedService> {
        self.services.iter_mut().find(|s| s.spec.id == id)
    }

    fn path_of(&self, id: ServiceId) -> Option<&str> {
        self.get(id).map(|s| s.spec.path.as_str())
    }

    fn report_exit(&self, id: ServiceId, status: &ExitStatus) {
        let code = exit_code(status);
        tracing::info!(service = ?self.path_of(id), code = ?code, "service exited");
        let _ = self.event_tx.send(Event::ServiceExited { id, code });
    }

    fn kill(&self, id: ServiceId, child: &mut Child) {
        if let Some(pid) = child.id() {
            self.send_signal(id, pid, ServiceSignal::Kill);
        }
        let _ = child.start_kill();
    }

    fn send_signal(&self, id: ServiceId, pid: u32, signal: ServiceSignal) {
        tracing::debug!(service = ?self.path_of(id), pid, signal = signal.label(), "sending signal");
        let _ = self
            .event_tx
            .send(Event::ServiceSignaled { id, signal });
        send_os_signal(pid, signal);
    }
}

impl ManagedService {
    fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            child: None,
            shutdown_deadline: None,
        }
    }
}

/// Exit code of a finished process; signal deaths map to the negated signal.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|sig| -sig))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ServiceSignal) {
    unsafe {
        let sig = match signal {
            ServiceSignal::Term => libc::SIGTERM,
            ServiceSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ServiceSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Kill goes through Child::start_kill; only the console event is sent here.
    if signal == ServiceSignal::Term {
        unsafe {
            let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_os_signal(_pid: u32, _signal: ServiceSignal) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(child.try_wait()?);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;

    // Scripts run through `sh` via the interpreter slot, so tests never exec a
    // file they just wrote (ETXTBSY under parallel test threads).
    fn sh_service(dir: &Path, id: u64, name: &str, body: &str) -> ServiceSpec {
        let path = dir.join(format!("{}.py", name));
        std::fs::write(&path, body).unwrap();
        ServiceSpec::new(ServiceId(id), path.to_string_lossy().into_owned())
    }

    fn manager(specs: Vec<ServiceSpec>) -> (ServiceManager, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = StopConfig::new(200, 2_000, 300);
        (ServiceManager::new(specs, "sh", tx, stop), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn exit_of(events: &[Event], id: ServiceId) -> Option<Option<i32>> {
        events.iter().find_map(|event| match event {
            Event::ServiceExited { id: got, code } if *got == id => Some(*code),
            _ => None,
        })
    }

    async fn wait_exit(
        manager: &mut ServiceManager,
        rx: &mut UnboundedReceiver<Event>,
        id: ServiceId,
    ) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            manager.poll_exits().await;
            if let Some(code) = exit_of(&drain(rx), id) {
                return code;
            }
            assert!(Instant::now() < deadline, "service never exited");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn start_appends_banner_and_captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 1, "echo", "echo out\necho err 1>&2\nexit 3\n");
        let log_path = spec.log_path.clone();
        std::fs::write(&log_path, "previous run\n").unwrap();
        let (mut manager, mut rx) = manager(vec![spec]);

        manager.start_service(ServiceId(1)).await.unwrap();
        assert_eq!(wait_exit(&mut manager, &mut rx, ServiceId(1)).await, Some(3));

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.starts_with("previous run\n\n=== START "));
        assert!(log.contains("out\n"));
        assert!(log.contains("err\n"));
        assert!(!manager.is_running(ServiceId(1)));
    }

    #[tokio::test]
    async fn services_run_in_their_own_folder() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 1, "where", "pwd > where.txt\n");
        let (mut manager, mut rx) = manager(vec![spec]);
        manager.start_service(ServiceId(1)).await.unwrap();
        assert_eq!(wait_exit(&mut manager, &mut rx, ServiceId(1)).await, Some(0));
        let recorded = std::fs::read_to_string(dir.path().join("where.txt")).unwrap();
        assert_eq!(
            Path::new(recorded.trim()).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn starting_twice_keeps_the_first_process() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 1, "sleeper", "exec sleep 30\n");
        let (mut manager, mut rx) = manager(vec![spec]);
        manager.start_service(ServiceId(1)).await.unwrap();
        manager.start_service(ServiceId(1)).await.unwrap();
        let started = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::ServiceStarted { .. }))
            .count();
        assert_eq!(started, 1);
        manager.shutdown_all().await;
        assert!(!manager.any_running());
    }

    #[tokio::test]
    async fn missing_script_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ServiceSpec::new(
            ServiceId(1),
            dir.path().join("gone.py").to_string_lossy().into_owned(),
        );
        let (mut manager, _rx) = manager(vec![spec]);
        let err = manager.start_service(ServiceId(1)).await.unwrap_err();
        assert!(err.to_string().contains("script not found"));
        assert!(!dir.path().join("gone.log").exists());
    }

    #[tokio::test]
    async fn stop_terminates_politely() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 1, "sleeper", "exec sleep 30\n");
        let (mut manager, mut rx) = manager(vec![spec]);
        manager.start_service(ServiceId(1)).await.unwrap();
        manager.stop_service(ServiceId(1), false).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(exit_of(&events, ServiceId(1)), Some(Some(-libc::SIGTERM)));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ServiceSignaled { signal: ServiceSignal::Term, .. }
        )));
    }

    #[tokio::test]
    async fn forced_stop_kills_services_that_ignore_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(
            dir.path(),
            1,
            "stubborn",
            "trap '' TERM\nwhile true; do sleep 0.05; done\n",
        );
        let (mut manager, mut rx) = manager(vec![spec]);
        manager.start_service(ServiceId(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        manager.stop_service(ServiceId(1), true).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        let events = drain(&mut rx);
        assert_eq!(exit_of(&events, ServiceId(1)), Some(Some(-libc::SIGKILL)));
        assert!(!manager.is_running(ServiceId(1)));
    }

    #[tokio::test]
    async fn stopping_an_idle_service_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 1, "idle", "exit 0\n");
        let (mut manager, mut rx) = manager(vec![spec]);
        manager.stop_service(ServiceId(1), true).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn restart_spawns_a_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 1, "sleeper", "exec sleep 30\n");
        let log_path = spec.log_path.clone();
        let (mut manager, mut rx) = manager(vec![spec]);
        manager.start_service(ServiceId(1)).await.unwrap();
        manager.restart_service(ServiceId(1)).await.unwrap();
        let pids: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::ServiceStarted { pid, .. } => Some(pid),
                _ => None,
            })
            .collect();
        assert_eq!(pids.len(), 2);
        assert_ne!(pids[0], pids[1]);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.matches("=== START").count(), 2);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn start_many_reports_failures_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ServiceSpec::new(
            ServiceId(1),
            dir.path().join("gone.py").to_string_lossy().into_owned(),
        );
        let ok = sh_service(dir.path(), 2, "ok", "exec sleep 30\n");
        let (mut manager, _rx) = manager(vec![missing, ok]);
        let failures = manager.start_many(&[ServiceId(1), ServiceId(2)]).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ServiceId(1));
        assert!(manager.is_running(ServiceId(2)));
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn shutdown_escalates_after_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let polite = sh_service(dir.path(), 1, "polite", "exec sleep 30\n");
        let stubborn = sh_service(
            dir.path(),
            2,
            "stubborn",
            "trap '' TERM\nwhile true; do sleep 0.05; done\n",
        );
        let (mut manager, mut rx) = manager(vec![polite, stubborn]);
        manager.start_service(ServiceId(1)).await.unwrap();
        manager.start_service(ServiceId(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.begin_shutdown_all().await;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while manager.any_running() {
            assert!(Instant::now() < deadline, "shutdown did not finish");
            manager.poll_exits().await;
            events.extend(drain(&mut rx));
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        events.extend(drain(&mut rx));
        assert_eq!(exit_of(&events, ServiceId(1)), Some(Some(-libc::SIGTERM)));
        assert_eq!(exit_of(&events, ServiceId(2)), Some(Some(-libc::SIGKILL)));
    }

    #[tokio::test]
    async fn bulk_lifecycle_does_not_wait_for_the_event_reader() {
        let dir = tempfile::tempdir().unwrap();
        let script = sh_service(dir.path(), 0, "sleeper", "exec sleep 30\n");
        let specs: Vec<ServiceSpec> = (1..=300)
            .map(|id| ServiceSpec::new(ServiceId(id), script.path.clone()))
            .collect();
        let (mut manager, mut rx) = manager(specs);
        let ids = manager.ids();

        let started = tokio::time::timeout(Duration::from_secs(30), manager.start_many(&ids)).await;
        let failures = started.expect("start_many stalled with nobody reading events");
        assert!(failures.is_empty());
        tokio::time::timeout(Duration::from_secs(60), manager.shutdown_all())
            .await
            .expect("shutdown_all stalled with nobody reading events");
        assert!(!manager.any_running());

        let events = drain(&mut rx);
        let starts = events
            .iter()
            .filter(|e| matches!(e, Event::ServiceStarted { .. }))
            .count();
        let exits = events
            .iter()
            .filter(|e| matches!(e, Event::ServiceExited { .. }))
            .count();
        assert_eq!(starts, 300);
        assert_eq!(exits, 300);
    }

    #[tokio::test]
    async fn remove_stops_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh_service(dir.path(), 7, "sleeper", "exec sleep 30\n");
        let (mut manager, _rx) = manager(vec![spec]);
        manager.start_service(ServiceId(7)).await.unwrap();
        manager.remove(ServiceId(7)).await.unwrap();
        assert!(manager.ids().is_empty());
        assert!(!manager.any_running());
    }
}
