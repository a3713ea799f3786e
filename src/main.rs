//! svcrack: a service launcher with a TUI.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads the service registry, and either runs the interactive front end, the
//! headless `up` mode, or one of the registry-editing subcommands.

mod app;
mod config;
mod events;
mod opener;
mod output;
mod registry;
mod runner;
mod service;
mod tui;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand, ValueEnum};
use crossterm::event::KeyEventKind;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::app::{App, AppAction};
use crate::config::{ServicesConfig, Settings};
use crate::events::Event;
use crate::registry::RegistryError;
use crate::runner::{ServiceManager, StopConfig};
use crate::service::{mtime_label, ServiceId, ServiceSpec};

/// File the TUI writes its own diagnostics to, next to the config file.
const TOOL_LOG_FILE: &str = "svcrack.log";
const TICK_RATE: Duration = Duration::from_millis(150);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "svcrack",
    version,
    about = "Start, stop and group local service scripts",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the services config file (default: ./services_config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Interpreter command for .py services (e.g. "python3" or "py -3").
    #[arg(long, global = true)]
    python: Option<String>,
    /// File refresh interval in milliseconds.
    #[arg(long, global = true)]
    refresh_ms: Option<u64>,
    /// Max log lines kept for the log pane.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Use plain ASCII instead of Unicode symbols.
    #[arg(long, global = true)]
    no_symbols: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the interactive front end (default).
    Ui,
    /// Print registered services with their state and groups.
    List,
    /// Register one or more scripts.
    Add {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Unregister one or more scripts.
    Remove {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Manage named groups.
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },
    /// Start groups without the UI and stop them on Ctrl-C.
    Up {
        /// Groups to start (default: the autostart groups).
        groups: Vec<String>,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum GroupCommand {
    /// Save (or overwrite) a group.
    Save {
        name: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Delete a group.
    Delete { name: String },
    /// Turn autostart on or off for a group.
    Autostart { name: String, state: Toggle },
    /// Print all groups.
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config::resolve_config_path(cli.config.as_deref());
    let command = cli.command.clone().unwrap_or(Commands::Ui);
    let interactive = matches!(command, Commands::Ui);
    let _log_guard = init_tracing(&config_path, interactive)?;

    match command {
        Commands::Ui => {
            let config = config::load_or_create(&config_path);
            let settings = RunSettings::from_cli(&cli, &config.settings);
            run_tui(config_path, config, settings).await
        }
        Commands::Up { groups } => {
            let config = config::load_or_create(&config_path);
            let settings = RunSettings::from_cli(&cli, &config.settings);
            run_headless(&config, &groups, &settings).await
        }
        other => {
            for line in run_command(&config_path, &other)? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

/// Runs a non-interactive subcommand. Only edits write the config back.
fn run_command(config_path: &Path, command: &Commands) -> Result<Vec<String>> {
    match command {
        Commands::List => Ok(list_lines(&load_existing(config_path)?)),
        Commands::Group {
            action: GroupCommand::List,
        } => Ok(group_list_lines(&load_existing(config_path)?)),
        edit => {
            let mut config = load_existing(config_path)?;
            let messages = apply_edit(&mut config, edit)?;
            config::save_config(config_path, &config)?;
            Ok(messages)
        }
    }
}

fn init_tracing(config_path: &Path, to_file: bool) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_env("SVCRACK_LOG").unwrap_or_else(|_| EnvFilter::new("svcrack=info"));
    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    // The terminal belongs to the TUI, so diagnostics go to a file.
    let log_path = config_path.with_file_name(TOOL_LOG_FILE);
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

// Editing subcommands must not replace a damaged file with an empty one.
fn load_existing(path: &Path) -> Result<ServicesConfig> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(ServicesConfig::default())
    }
}

async fn run_tui(config_path: PathBuf, config: ServicesConfig, settings: RunSettings) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut app = App::new(config, config_path, settings.max_lines, settings.use_symbols);
    let mut manager = ServiceManager::new(
        app.specs(),
        settings.python.clone(),
        event_tx.clone(),
        settings.stop_config(),
    );
    tracing::info!(
        services = app.services.len(),
        groups = app.config.groups.len(),
        python = %settings.python,
        "starting ui"
    );

    let mut terminal = tui::init_terminal()?;
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());
    spawn_autostart_timer(event_tx.clone(), Duration::from_millis(settings.autostart_delay_ms));

    let mut ticker = tokio::time::interval(TICK_RATE);
    let mut refresh = tokio::time::interval(Duration::from_millis(settings.refresh_ms.max(100)));
    let mut result = Ok(());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::ServiceStarted { id, pid } => app.on_service_started(id, pid),
                    Event::ServiceExited { id, code } => app.on_service_exited(id, code),
                    Event::ServiceFailed { id, error } => app.on_service_failed(id, &error),
                    Event::ServiceSignaled { id, signal } => {
                        if !app.shutting_down {
                            let message = format!("{} sent to {}", signal.label(), app.name_of(id));
                            app.set_status_message(message);
                        }
                    }
                    Event::Autostart => handle_autostart(&mut app, &mut manager).await,
                    Event::Shutdown => begin_quit(&mut app, &mut manager).await,
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, &mut manager).await;
                    }
                    Event::Mouse(mouse) => {
                        let action = app.handle_mouse(mouse);
                        handle_app_action(action, &mut app, &mut manager).await;
                    }
                    Event::Resize => {}
                }
            }
            _ = ticker.tick() => {
                manager.poll_exits().await;
                app.poll_log();
            }
            _ = refresh.tick() => {
                if app.auto_refresh {
                    app.refresh_files();
                }
            }
        }

        if app.shutting_down && !manager.any_running() {
            app.should_quit = true;
        }
        if let Err(err) = tui::draw(&mut app, &mut terminal) {
            result = Err(err.into());
            break;
        }
        if app.should_quit {
            break;
        }
    }

    manager.shutdown_all().await;
    tui::restore_terminal(terminal)?;
    tracing::info!("ui closed");
    result
}

async fn run_headless(config: &ServicesConfig, groups: &[String], settings: &RunSettings) -> Result<()> {
    let targets = headless_targets(config, groups)?;
    if targets.is_empty() {
        bail!("nothing to start: name a group or enable autostart for one");
    }
    let specs: Vec<ServiceSpec> = targets
        .into_iter()
        .enumerate()
        .map(|(index, path)| ServiceSpec::new(ServiceId(index as u64 + 1), path))
        .collect();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut manager = ServiceManager::new(
        specs,
        settings.python.clone(),
        event_tx.clone(),
        settings.stop_config(),
    );
    spawn_signal_listener(event_tx.clone());

    let ids = manager.ids();
    let failures = manager.start_many(&ids).await;
    if failures.len() == ids.len() {
        for (_, err) in &failures {
            tracing::error!(error = %err, "start failed");
        }
        bail!("no service could be started");
    }

    let mut ticker = tokio::time::interval(TICK_RATE);
    let mut shutting_down = false;
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::ServiceFailed { id, error } => {
                        tracing::error!(id = id.0, error = %error, "service failed");
                    }
                    Event::Shutdown => {
                        if !shutting_down {
                            shutting_down = true;
                            tracing::info!("stopping services");
                            manager.begin_shutdown_all().await;
                        }
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => manager.poll_exits().await,
        }
        if shutting_down && !manager.any_running() {
            break;
        }
    }

    manager.shutdown_all().await;
    Ok(())
}

/// Registered members of the named groups (or of the autostart groups), in
/// order and without repeats.
fn headless_targets(config: &ServicesConfig, groups: &[String]) -> Result<Vec<String>> {
    if groups.is_empty() {
        return Ok(config.autostart_targets());
    }
    let mut targets: Vec<String> = Vec::new();
    for group in groups {
        let Some(members) = config.group_members(group) else {
            bail!(RegistryError::UnknownGroup(group.clone()));
        };
        for path in members {
            if config.contains_service(path) && !targets.contains(path) {
                targets.push(path.clone());
            }
        }
    }
    Ok(targets)
}

fn list_lines(config: &ServicesConfig) -> Vec<String> {
    if config.services.is_empty() {
        return vec!["No services registered.".to_string()];
    }
    config
        .services
        .iter()
        .map(|path| {
            let script = Path::new(path);
            let state = if script.is_file() { "PRESENT" } else { "MISSING" };
            let groups = config.groups_of(path);
            let groups = if groups.is_empty() {
                String::new()
            } else {
                format!("  [{}]", groups.join(", "))
            };
            format!("{:<8} {:<19}  {}{}", state, mtime_label(script), path, groups)
        })
        .collect()
}

fn group_list_lines(config: &ServicesConfig) -> Vec<String> {
    let mut lines = Vec::new();
    for name in config.group_names() {
        let flag = if config.is_autostart(&name) { " (autostart)" } else { "" };
        lines.push(format!("{}{}:", name, flag));
        for path in config.group_members(&name).unwrap_or_default() {
            lines.push(format!("  {}", path));
        }
    }
    if lines.is_empty() {
        lines.push("No groups.".to_string());
    }
    lines
}

fn apply_edit(config: &mut ServicesConfig, command: &Commands) -> Result<Vec<String>> {
    let mut messages = Vec::new();
    match command {
        Commands::Add { paths } => {
            for raw in paths {
                let path = service::normalize_script_path(raw)?;
                match config.add_service(&path) {
                    Ok(()) => messages.push(format!("added {}", path)),
                    Err(RegistryError::AlreadyAdded(path)) => {
                        messages.push(format!("already added: {}", path))
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Commands::Remove { paths } => {
            for raw in paths {
                let path = registered_path(config, raw)
                    .ok_or_else(|| RegistryError::UnknownService(raw.clone()))?;
                config.remove_service(&path)?;
                messages.push(format!("removed {}", path));
            }
        }
        Commands::Group { action } => match action {
            GroupCommand::Save { name, paths } => {
                let mut members = Vec::new();
                for raw in paths {
                    let path = registered_path(config, raw)
                        .ok_or_else(|| RegistryError::UnknownService(raw.clone()))?;
                    members.push(path);
                }
                let name = config.save_group(name, members)?;
                messages.push(format!("saved group {}", name));
            }
            GroupCommand::Delete { name } => {
                config.delete_group(name)?;
                messages.push(format!("deleted group {}", name));
            }
            GroupCommand::Autostart { name, state } => {
                config.set_autostart(name, *state == Toggle::On)?;
                let label = if *state == Toggle::On { "on" } else { "off" };
                messages.push(format!("autostart {} for {}", label, name));
            }
            GroupCommand::List => messages = group_list_lines(config),
        },
        Commands::Ui | Commands::List | Commands::Up { .. } => {}
    }
    Ok(messages)
}

/// Matches a user-supplied path against the registry, as given or made absolute.
fn registered_path(config: &ServicesConfig, raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('"');
    if config.contains_service(trimmed) {
        return Some(trimmed.to_string());
    }
    let absolute = std::path::absolute(trimmed).ok()?;
    let absolute = absolute.to_string_lossy().into_owned();
    config.contains_service(&absolute).then_some(absolute)
}

fn spawn_input_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let sent = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) if key.kind != KeyEventKind::Release => {
                    tx.send(Event::Key(key))
                }
                Ok(crossterm::event::Event::Mouse(mouse)) => tx.send(Event::Mouse(mouse)),
                Ok(crossterm::event::Event::Resize(_, _)) => tx.send(Event::Resize),
                _ => Ok(()),
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                if tx.send(Event::Shutdown).is_err() {
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Event::Shutdown).is_err() {
                    break;
                }
            }
        }
    });
}

fn spawn_autostart_timer(tx: mpsc::UnboundedSender<Event>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(Event::Autostart);
    });
}

/// Starts the registered, stopped members of every autostart group.
async fn handle_autostart(app: &mut App, manager: &mut ServiceManager) {
    if app.shutting_down {
        return;
    }
    let ids = app.autostart_targets();
    if ids.is_empty() {
        return;
    }
    tracing::info!(count = ids.len(), "autostart");
    let failures = manager.start_many(&ids).await;
    report_start(app, ids.len(), failures);
}

async fn begin_quit(app: &mut App, manager: &mut ServiceManager) {
    if app.shutting_down {
        return;
    }
    if !manager.any_running() {
        app.should_quit = true;
        return;
    }
    app.shutting_down = true;
    app.set_status_persistent("Stopping services...");
    tracing::info!("stopping services before exit");
    manager.begin_shutdown_all().await;
}

fn report_start(app: &mut App, requested: usize, failures: Vec<(ServiceId, anyhow::Error)>) {
    match failures.first() {
        None => app.set_status_message(format!("Started {}", plural(requested, "service"))),
        Some((id, err)) => {
            let first = format!("{}: {:#}", app.name_of(*id), err);
            let message = if failures.len() == 1 {
                format!("Start failed for {}", first)
            } else {
                format!("{} failed to start ({} ...)", plural(failures.len(), "service"), first)
            };
            app.set_status_error(message);
        }
    }
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

async fn handle_app_action(action: AppAction, app: &mut App, manager: &mut ServiceManager) {
    match action {
        AppAction::Quit => begin_quit(app, manager).await,
        AppAction::Added(spec) => manager.add(spec),
        AppAction::Remove(id) => {
            let name = app.name_of(id);
            if let Err(err) = manager.remove(id).await {
                app.set_status_error(format!("Remove failed for {}: {:#}", name, err));
                return;
            }
            match app.unregister_service(id) {
                Ok(()) => app.set_status_message(format!("Removed {}", name)),
                Err(err) => app.set_status_error(err.to_string()),
            }
        }
        AppAction::Start(ids) => {
            let failures = manager.start_many(&ids).await;
            report_start(app, ids.len(), failures);
        }
        AppAction::Stop(ids) => {
            manager.stop_many(&ids, true).await;
            app.set_status_message(format!("Stopped {}", plural(ids.len(), "service")));
        }
        AppAction::Restart(ids) => {
            let failures = manager.restart_many(&ids).await;
            if failures.is_empty() {
                app.set_status_message(format!("Restarted {}", plural(ids.len(), "service")));
            } else {
                report_start(app, ids.len(), failures);
            }
        }
        AppAction::StartAll => {
            let ids = manager.ids();
            let failures = manager.start_many(&ids).await;
            report_start(app, ids.len(), failures);
        }
        AppAction::StopAll => {
            let ids = manager.ids();
            manager.stop_many(&ids, true).await;
            app.set_status_message("Stopped all services");
        }
        AppAction::StartGroup(group) => {
            let ids = app.startable_members(&group);
            if ids.is_empty() {
                app.set_status_warning(format!("Nothing to start in {}", group));
                return;
            }
            tracing::info!(group = %group, count = ids.len(), "starting group");
            let failures = manager.start_many(&ids).await;
            report_start(app, ids.len(), failures);
        }
        AppAction::OpenLog(id) => {
            let Some(path) = app.service(id).map(|s| s.spec.log_path.clone()) else {
                return;
            };
            if !path.exists() {
                app.set_status_warning("No log yet.");
                return;
            }
            if let Err(err) = opener::open_path(&path) {
                app.set_status_error(format!("{:#}", err));
            }
        }
        AppAction::None => {}
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunSettings {
    python: String,
    refresh_ms: u64,
    max_lines: usize,
    use_symbols: bool,
    stop_grace_ms: u64,
    stop_timeout_ms: u64,
    shutdown_timeout_ms: u64,
    autostart_delay_ms: u64,
}

impl RunSettings {
    fn from_cli(cli: &Cli, settings: &Settings) -> Self {
        const DEFAULT_REFRESH_MS: u64 = 2000;
        const DEFAULT_MAX_LINES: usize = 10_000;
        const DEFAULT_STOP_GRACE_MS: u64 = 800;
        const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;
        const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 4000;
        const DEFAULT_AUTOSTART_DELAY_MS: u64 = 800;
        let python = cli
            .python
            .clone()
            .or_else(|| settings.python.clone())
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| service::default_python().to_string());
        let use_symbols = if cli.no_symbols {
            false
        } else {
            settings.symbols.unwrap_or(true)
        };
        Self {
            python,
            refresh_ms: cli
                .refresh_ms
                .or(settings.refresh_ms)
                .unwrap_or(DEFAULT_REFRESH_MS),
            max_lines: cli
                .max_lines
                .or(settings.max_lines)
                .unwrap_or(DEFAULT_MAX_LINES),
            use_symbols,
            stop_grace_ms: settings.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
            stop_timeout_ms: settings.stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            shutdown_timeout_ms: settings
                .shutdown_timeout_ms
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            autostart_delay_ms: settings
                .autostart_delay_ms
                .unwrap_or(DEFAULT_AUTOSTART_DELAY_MS),
        }
    }

    fn stop_config(&self) -> StopConfig {
        StopConfig::new(
            self.stop_grace_ms,
            self.stop_timeout_ms,
            self.shutdown_timeout_ms,
        )
    }
}
