//! Application state and UI logic.
//!
//! This module holds the core `App` struct: the service table, the persisted
//! registry, the current group, the log pane and the prompt buffers. It also
//! defines how user input is translated into application actions.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};

use crate::config::{save_config, ServicesConfig};
use crate::output::LogTail;
use crate::registry::RegistryError;
use crate::service::{ServiceId, ServiceSpec, ServiceState, ServiceStatus};

/// Modes of user input interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    /// Standard navigation mode.
    Normal,
    /// Typing the path of a service to add.
    AddPath,
    /// Typing the name for a new group.
    GroupName,
    /// Waiting for y/n before removing a running service.
    ConfirmRemove(ServiceId),
    /// Waiting for y/n before deleting a group.
    ConfirmDeleteGroup(String),
}

/// Actions that need the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    None,
    /// Stop everything and exit.
    Quit,
    /// A service was registered and needs a runtime slot.
    Added(ServiceSpec),
    /// Force-stop and forget a service.
    Remove(ServiceId),
    Start(Vec<ServiceId>),
    /// Force-stop the given services.
    Stop(Vec<ServiceId>),
    Restart(Vec<ServiceId>),
    StartAll,
    StopAll,
    /// Start the members of a group that are not running.
    StartGroup(String),
    OpenLog(ServiceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Screen rectangle of the service table body, for mouse hit-testing.
#[derive(Debug, Clone, Copy)]
pub struct TableViewport {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    /// Registered services in config order.
    pub services: Vec<ServiceState>,
    /// Index of the cursor row.
    pub selected: usize,
    pub input_mode: InputMode,
    /// Prompt buffer.
    pub input: String,
    /// The persisted registry.
    pub config: ServicesConfig,
    pub config_path: PathBuf,
    /// Group shown in the groups bar.
    pub current_group: Option<String>,
    /// Whether file info is refreshed periodically.
    pub auto_refresh: bool,
    /// Tail of the selected service's log.
    pub log: LogTail,
    pub log_scroll: usize,
    pub log_follow: bool,
    pub log_view_height: usize,
    /// First visible table row, as rendered.
    pub table_offset: usize,
    pub use_symbols: bool,
    pub show_help: bool,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    /// Set once the quit sequence has begun.
    pub shutting_down: bool,
    table_viewport: Option<TableViewport>,
    next_id: u64,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(
        config: ServicesConfig,
        config_path: PathBuf,
        max_lines: usize,
        use_symbols: bool,
    ) -> Self {
        let mut app = Self {
            services: Vec::new(),
            selected: 0,
            input_mode: InputMode::Normal,
            input: String::new(),
            current_group: config.group_names().into_iter().next(),
            config,
            config_path,
            auto_refresh: true,
            log: LogTail::new(max_lines),
            log_scroll: 0,
            log_follow: true,
            log_view_height: 0,
            table_offset: 0,
            use_symbols,
            show_help: false,
            should_quit: false,
            shutting_down: false,
            table_viewport: None,
            next_id: 0,
            status_message: None,
        };
        let paths = app.config.services.clone();
        for path in paths {
            let spec = app.next_spec(path);
            app.services.push(ServiceState::new(spec));
        }
        app.attach_selected_log();
        app
    }

    pub fn specs(&self) -> Vec<ServiceSpec> {
        self.services.iter().map(|s| s.spec.clone()).collect()
    }

    pub fn selected_service(&self) -> Option<&ServiceState> {
        self.services.get(self.selected)
    }

    pub fn service(&self, id: ServiceId) -> Option<&ServiceState> {
        self.services.iter().find(|s| s.spec.id == id)
    }

    fn service_mut(&mut self, id: ServiceId) -> Option<&mut ServiceState> {
        self.services.iter_mut().find(|s| s.spec.id == id)
    }

    pub fn id_for_path(&self, path: &str) -> Option<ServiceId> {
        self.services
            .iter()
            .find(|s| s.spec.path == path)
            .map(|s| s.spec.id)
    }

    pub fn name_of(&self, id: ServiceId) -> String {
        self.service(id)
            .map(|s| s.spec.file_name())
            .unwrap_or_else(|| "service".to_string())
    }

    /// Marked services in table order, or the cursor row when nothing is marked.
    pub fn targets(&self) -> Vec<ServiceId> {
        let marked: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|s| s.marked)
            .map(|s| s.spec.id)
            .collect();
        if !marked.is_empty() {
            return marked;
        }
        self.selected_service().map(|s| vec![s.spec.id]).unwrap_or_default()
    }

    pub fn first_target(&self) -> Option<ServiceId> {
        self.targets().into_iter().next()
    }

    pub fn on_service_started(&mut self, id: ServiceId, pid: u32) {
        if let Some(service) = self.service_mut(id) {
            service.status = ServiceStatus::Running;
            service.pid = Some(pid);
            service.started_at = Some(Instant::now());
        }
    }

    pub fn on_service_exited(&mut self, id: ServiceId, code: Option<i32>) {
        if let Some(service) = self.service_mut(id) {
            service.status = ServiceStatus::Exited { code };
            service.pid = None;
            service.started_at = None;
        }
    }

    pub fn on_service_failed(&mut self, id: ServiceId, error: &str) {
        self.on_service_exited(id, None);
        let name = self.name_of(id);
        self.set_status_error(format!("{}: {}", name, error));
    }

    /// Registers a service path, persists the config and returns the new spec.
    pub fn register_service(&mut self, path: String) -> Result<ServiceSpec, RegistryError> {
        self.config.add_service(&path)?;
        let spec = self.next_spec(path);
        self.services.push(ServiceState::new(spec.clone()));
        self.persist();
        Ok(spec)
    }

    /// Forgets a service everywhere: table, groups and autostart.
    pub fn unregister_service(&mut self, id: ServiceId) -> Result<(), RegistryError> {
        let Some(index) = self.services.iter().position(|s| s.spec.id == id) else {
            return Ok(());
        };
        let path = self.services[index].spec.path.clone();
        self.config.remove_service(&path)?;
        self.services.remove(index);
        if self.selected >= self.services.len() {
            self.selected = self.services.len().saturating_sub(1);
        }
        self.sync_current_group();
        self.attach_selected_log();
        self.persist();
        Ok(())
    }

    /// Saves the current targets as group `name` and makes it current.
    pub fn save_selection_as_group(&mut self, name: &str) -> Result<String, RegistryError> {
        let paths: Vec<String> = self
            .targets()
            .into_iter()
            .filter_map(|id| self.service(id).map(|s| s.spec.path.clone()))
            .collect();
        let name = self.config.save_group(name, paths)?;
        self.current_group = Some(name.clone());
        self.persist();
        Ok(name)
    }

    pub fn delete_group(&mut self, name: &str) -> Result<(), RegistryError> {
        self.config.delete_group(name)?;
        self.sync_current_group();
        self.persist();
        Ok(())
    }

    /// Flips the autostart flag of the current group.
    pub fn toggle_autostart(&mut self) -> Result<bool, RegistryError> {
        let Some(group) = self.current_group.clone() else {
            return Ok(false);
        };
        let enabled = !self.config.is_autostart(&group);
        self.config.set_autostart(&group, enabled)?;
        self.persist();
        Ok(enabled)
    }

    pub fn cycle_group(&mut self, forward: bool) {
        let names = self.config.group_names();
        if names.is_empty() {
            self.current_group = None;
            return;
        }
        let position = self
            .current_group
            .as_ref()
            .and_then(|g| names.iter().position(|n| n == g));
        let next = match (position, forward) {
            (None, _) => 0,
            (Some(i), true) => (i + 1) % names.len(),
            (Some(0), false) => names.len() - 1,
            (Some(i), false) => i - 1,
        };
        self.current_group = Some(names[next].clone());
    }

    /// Registered, stopped members of a group.
    pub fn startable_members(&self, group: &str) -> Vec<ServiceId> {
        self.config
            .group_members(group)
            .unwrap_or_default()
            .iter()
            .filter_map(|path| self.id_for_path(path))
            .filter(|id| self.service(*id).map(|s| !s.is_running()).unwrap_or(false))
            .collect()
    }

    /// Registered, stopped services of all autostart groups.
    pub fn autostart_targets(&self) -> Vec<ServiceId> {
        self.config
            .autostart_targets()
            .iter()
            .filter_map(|path| self.id_for_path(path))
            .filter(|id| self.service(*id).map(|s| !s.is_running()).unwrap_or(false))
            .collect()
    }

    /// Re-reads existence and modification time of every script.
    pub fn refresh_files(&mut self) {
        for service in &mut self.services {
            service.refresh_file_info();
        }
    }

    /// Writes the config, reporting failures in the status bar.
    pub fn persist(&mut self) -> bool {
        match save_config(&self.config_path, &self.config) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(path = %self.config_path.display(), error = ?err, "save failed");
                self.set_status_error(format!("Save error: {:#}", err));
                false
            }
        }
    }

    pub fn status_line(&self) -> String {
        format!(
            "Services: {}  |  Groups: {}",
            self.services.len(),
            self.config.groups.len()
        )
    }

    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> AppAction {
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                if let Some(index) = self.table_row_at(mouse.row, mouse.column) {
                    self.select(index);
                }
            }
            MouseEventKind::ScrollDown => self.scroll_down(3),
            MouseEventKind::ScrollUp => self.scroll_up(3),
            _ => {}
        }
        AppAction::None
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if self.shutting_down {
            return AppAction::None;
        }
        match self.input_mode.clone() {
            InputMode::Normal => self.handle_normal_input(key),
            InputMode::AddPath => self.handle_add_input(key),
            InputMode::GroupName => self.handle_group_name_input(key),
            InputMode::ConfirmRemove(id) => {
                self.input_mode = InputMode::Normal;
                if is_yes(key) {
                    AppAction::Remove(id)
                } else {
                    AppAction::None
                }
            }
            InputMode::ConfirmDeleteGroup(group) => {
                self.input_mode = InputMode::Normal;
                if is_yes(key) {
                    match self.delete_group(&group) {
                        Ok(()) => self.set_status_message(format!("Deleted group {}", group)),
                        Err(err) => self.set_status_error(err.to_string()),
                    }
                }
                AppAction::None
            }
        }
    }

    fn handle_add_input(&mut self, key: KeyEvent) -> AppAction {
        let Some(submitted) = self.edit_prompt(key) else {
            return AppAction::None;
        };
        if submitted.trim().is_empty() {
            return AppAction::None;
        }
        let path = match crate::service::normalize_script_path(&submitted) {
            Ok(path) => path,
            Err(err) => {
                self.set_status_error(format!("{:#}", err));
                return AppAction::None;
            }
        };
        match self.register_service(path) {
            Ok(spec) => {
                self.set_status_message(format!("Added {}", spec.file_name()));
                AppAction::Added(spec)
            }
            Err(RegistryError::AlreadyAdded(_)) => {
                self.set_status_warning("Already added.");
                AppAction::None
            }
            Err(err) => {
                self.set_status_error(err.to_string());
                AppAction::None
            }
        }
    }

    fn handle_group_name_input(&mut self, key: KeyEvent) -> AppAction {
        let Some(submitted) = self.edit_prompt(key) else {
            return AppAction::None;
        };
        if submitted.trim().is_empty() {
            return AppAction::None;
        }
        match self.save_selection_as_group(&submitted) {
            Ok(name) => self.set_status_message(format!("Saved group {}", name)),
            Err(err) => self.set_status_error(err.to_string()),
        }
        AppAction::None
    }

    // Shared line editing for prompts. Returns the text once Enter is pressed.
    fn edit_prompt(&mut self, key: KeyEvent) -> Option<String> {
        match key.code {
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.input.clear();
                None
            }
            KeyCode::Enter => {
                self.input_mode = InputMode::Normal;
                Some(std::mem::take(&mut self.input))
            }
            KeyCode::Backspace => {
                self.input.pop();
                None
            }
            KeyCode::Char(c) => {
                if !key.modifiers.contains(KeyModifiers::CONTROL) {
                    self.input.push(c);
                }
                None
            }
            _ => None,
        }
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Char('q') => AppAction::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                AppAction::Quit
            }
            KeyCode::Up => {
                if self.selected > 0 {
                    self.select(self.selected - 1);
                }
                AppAction::None
            }
            KeyCode::Down => {
                if self.selected + 1 < self.services.len() {
                    self.select(self.selected + 1);
                }
                AppAction::None
            }
            KeyCode::Tab => {
                if !self.services.is_empty() {
                    self.select((self.selected + 1) % self.services.len());
                }
                AppAction::None
            }
            KeyCode::Char(' ') => {
                if let Some(service) = self.services.get_mut(self.selected) {
                    service.marked = !service.marked;
                }
                AppAction::None
            }
            KeyCode::Esc => {
                for service in &mut self.services {
                    service.marked = false;
                }
                self.show_help = false;
                AppAction::None
            }
            KeyCode::Enter | KeyCode::Char('s') => self.with_targets(AppAction::Start),
            KeyCode::Char('x') => self.with_targets(AppAction::Stop),
            KeyCode::Char('r') => self.with_targets(AppAction::Restart),
            KeyCode::Char('S') => AppAction::StartAll,
            KeyCode::Char('X') => AppAction::StopAll,
            KeyCode::Char('a') => {
                self.input_mode = InputMode::AddPath;
                self.input.clear();
                AppAction::None
            }
            KeyCode::Char('d') => {
                let Some(id) = self.first_target() else {
                    return AppAction::None;
                };
                if self.service(id).map(|s| s.is_running()).unwrap_or(false) {
                    self.input_mode = InputMode::ConfirmRemove(id);
                    AppAction::None
                } else {
                    AppAction::Remove(id)
                }
            }
            KeyCode::Char('o') => match self.first_target() {
                Some(id) => AppAction::OpenLog(id),
                None => AppAction::None,
            },
            KeyCode::Char('R') => {
                self.refresh_files();
                self.set_status_message("Refreshed");
                AppAction::None
            }
            KeyCode::Char('p') => {
                self.auto_refresh = !self.auto_refresh;
                self.set_status_message(format!(
                    "Auto refresh {}",
                    if self.auto_refresh { "on" } else { "off" }
                ));
                AppAction::None
            }
            KeyCode::Char(']') => {
                self.cycle_group(true);
                AppAction::None
            }
            KeyCode::Char('[') => {
                self.cycle_group(false);
                AppAction::None
            }
            KeyCode::Char('g') => match self.current_group.clone() {
                Some(group) => AppAction::StartGroup(group),
                None => {
                    self.set_status_warning("No group selected.");
                    AppAction::None
                }
            },
            KeyCode::Char('c') => {
                if self.targets().is_empty() {
                    self.set_status_warning("Select one or more services first.");
                } else {
                    self.input_mode = InputMode::GroupName;
                    self.input.clear();
                }
                AppAction::None
            }
            KeyCode::Char('D') => {
                if let Some(group) = self.current_group.clone() {
                    self.input_mode = InputMode::ConfirmDeleteGroup(group);
                }
                AppAction::None
            }
            KeyCode::Char('u') => {
                match self.toggle_autostart() {
                    Ok(enabled) => {
                        if let Some(group) = &self.current_group {
                            let message = format!(
                                "Autostart {} for {}",
                                if enabled { "on" } else { "off" },
                                group
                            );
                            self.set_status_message(message);
                        }
                    }
                    Err(err) => self.set_status_error(err.to_string()),
                }
                AppAction::None
            }
            KeyCode::Char('f') => {
                self.log_follow = !self.log_follow;
                if self.log_follow {
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = !self.show_help;
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.log_scroll = 0;
                self.log_follow = false;
                AppAction::None
            }
            KeyCode::End => {
                self.log_follow = true;
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn with_targets(&self, action: fn(Vec<ServiceId>) -> AppAction) -> AppAction {
        let targets = self.targets();
        if targets.is_empty() {
            AppAction::None
        } else {
            action(targets)
        }
    }

    fn select(&mut self, index: usize) {
        if index >= self.services.len() || index == self.selected {
            return;
        }
        self.selected = index;
        self.attach_selected_log();
    }

    /// Points the log pane at the selected service's log file.
    pub fn attach_selected_log(&mut self) {
        let path = self.selected_service().map(|s| s.spec.log_path.clone());
        self.log.attach(path.as_deref());
        self.log_follow = true;
        self.ensure_follow();
    }

    /// Picks up new log output.
    pub fn poll_log(&mut self) {
        if self.log.poll() > 0 && self.log_follow {
            self.ensure_follow();
        }
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let max_scroll = self.max_log_scroll();
        let current = if self.log_follow { max_scroll } else { self.log_scroll };
        self.log_scroll = current.saturating_sub(amount).min(max_scroll);
        self.log_follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_log_scroll();
        let current = if self.log_follow { max_scroll } else { self.log_scroll };
        let next = (current + amount).min(max_scroll);
        self.log_scroll = next;
        self.log_follow = next == max_scroll;
    }

    pub fn ensure_follow(&mut self) {
        self.log_scroll = self.max_log_scroll();
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let max_scroll = self.max_log_scroll();
        if self.log_follow {
            self.log_scroll = max_scroll;
        } else {
            self.log_scroll = self.log_scroll.min(max_scroll);
        }
    }

    fn max_log_scroll(&self) -> usize {
        self.log.lines().len().saturating_sub(self.log_view_height.max(1))
    }

    pub fn set_table_viewport(&mut self, viewport: TableViewport) {
        self.table_viewport = Some(viewport);
    }

    fn table_row_at(&self, row: u16, col: u16) -> Option<usize> {
        let viewport = self.table_viewport?;
        if row < viewport.y || row >= viewport.y + viewport.height {
            return None;
        }
        if col < viewport.x || col >= viewport.x + viewport.width {
            return None;
        }
        let index = (row - viewport.y) as usize + self.table_offset;
        (index < self.services.len()).then_some(index)
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(Duration::from_secs(4)));
    }

    pub fn set_status_error(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Error, Some(Duration::from_secs(8)));
    }

    pub fn set_status_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }

    fn next_spec(&mut self, path: String) -> ServiceSpec {
        self.next_id += 1;
        ServiceSpec::new(ServiceId(self.next_id), path)
    }

    fn sync_current_group(&mut self) {
        let still_exists = self
            .current_group
            .as_ref()
            .map(|g| self.config.groups.contains_key(g))
            .unwrap_or(false);
        if !still_exists {
            self.current_group = self.config.group_names().into_iter().next();
        }
    }
}

fn is_yes(key: KeyEvent) -> bool {
    matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use std::path::Path;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            app.handle_key(key(KeyCode::Char(c)));
        }
    }

    fn make_app(dir: &Path, scripts: &[&str]) -> App {
        let mut config = ServicesConfig::default();
        for name in scripts {
            let path = dir.join(name);
            std::fs::write(&path, "").unwrap();
            config.add_service(&path.to_string_lossy()).unwrap();
        }
        App::new(config, dir.join("services_config.json"), 100, false)
    }

    #[test]
    fn targets_prefer_marks_over_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py", "b.py", "c.py"]);
        assert_eq!(app.targets(), vec![app.services[0].spec.id]);
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Char(' ')));
        app.handle_key(key(KeyCode::Up));
        app.handle_key(key(KeyCode::Up));
        app.handle_key(key(KeyCode::Char(' ')));
        let ids = vec![app.services[0].spec.id, app.services[2].spec.id];
        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), AppAction::Start(ids));
        app.handle_key(key(KeyCode::Esc));
        assert_eq!(app.targets(), vec![app.services[0].spec.id]);
    }

    #[test]
    fn add_prompt_registers_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &[]);
        let script = dir.path().join("new.py");
        std::fs::write(&script, "").unwrap();

        app.handle_key(key(KeyCode::Char('a')));
        assert_eq!(app.input_mode, InputMode::AddPath);
        type_text(&mut app, &script.to_string_lossy());
        let action = app.handle_key(key(KeyCode::Enter));
        assert!(matches!(action, AppAction::Added(ref spec) if spec.path == script.to_string_lossy()));
        assert_eq!(app.services.len(), 1);

        let saved = load_config(&app.config_path).unwrap();
        assert_eq!(saved.services, vec![script.to_string_lossy().into_owned()]);

        app.handle_key(key(KeyCode::Char('a')));
        type_text(&mut app, &script.to_string_lossy());
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::None);
        assert_eq!(app.status_message().unwrap().0, "Already added.");
    }

    #[test]
    fn removing_a_running_service_asks_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py"]);
        let id = app.services[0].spec.id;
        assert_eq!(app.handle_key(key(KeyCode::Char('d'))), AppAction::Remove(id));

        app.on_service_started(id, 42);
        assert_eq!(app.handle_key(key(KeyCode::Char('d'))), AppAction::None);
        assert_eq!(app.input_mode, InputMode::ConfirmRemove(id));
        assert_eq!(app.handle_key(key(KeyCode::Char('n'))), AppAction::None);
        app.handle_key(key(KeyCode::Char('d')));
        assert_eq!(app.handle_key(key(KeyCode::Char('y'))), AppAction::Remove(id));
    }

    #[test]
    fn unregister_prunes_groups_and_moves_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py", "b.py"]);
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Char('c')));
        type_text(&mut app, "solo");
        app.handle_key(key(KeyCode::Enter));
        assert_eq!(app.current_group.as_deref(), Some("solo"));

        let id = app.services[1].spec.id;
        app.unregister_service(id).unwrap();
        assert_eq!(app.services.len(), 1);
        assert_eq!(app.selected, 0);
        assert!(app.config.groups.is_empty());
        assert!(app.current_group.is_none());
    }

    #[test]
    fn group_workflow_round_trips_through_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py", "b.py"]);
        app.handle_key(key(KeyCode::Char(' ')));
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Char(' ')));
        app.handle_key(key(KeyCode::Char('c')));
        type_text(&mut app, "web");
        app.handle_key(key(KeyCode::Enter));
        app.handle_key(key(KeyCode::Char('u')));

        let saved = load_config(&app.config_path).unwrap();
        assert_eq!(saved.groups["web"].len(), 2);
        assert_eq!(saved.autostart_groups, vec!["web"]);
        assert_eq!(app.autostart_targets().len(), 2);

        let first = app.services[0].spec.id;
        app.on_service_started(first, 7);
        assert_eq!(
            app.handle_key(key(KeyCode::Char('g'))),
            AppAction::StartGroup("web".into())
        );
        assert_eq!(app.startable_members("web"), vec![app.services[1].spec.id]);

        app.handle_key(key(KeyCode::Char('D')));
        app.handle_key(key(KeyCode::Char('y')));
        let saved = load_config(&app.config_path).unwrap();
        assert!(saved.groups.is_empty());
        assert!(saved.autostart_groups.is_empty());
    }

    #[test]
    fn cycle_group_wraps_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py"]);
        let path = app.services[0].spec.path.clone();
        for name in ["a", "b", "c"] {
            app.config.save_group(name, vec![path.clone()]).unwrap();
        }
        app.current_group = Some("a".into());
        app.cycle_group(false);
        assert_eq!(app.current_group.as_deref(), Some("c"));
        app.cycle_group(true);
        assert_eq!(app.current_group.as_deref(), Some("a"));
    }

    #[test]
    fn exit_and_failure_update_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py"]);
        let id = app.services[0].spec.id;
        app.on_service_started(id, 99);
        assert_eq!(app.services[0].pid_label(), "99");
        app.on_service_exited(id, Some(-15));
        assert_eq!(app.services[0].display_status().label(), "EXIT(-15)");
        app.on_service_failed(id, "boom");
        assert_eq!(app.status_message().unwrap().1, StatusLevel::Error);
    }

    #[test]
    fn log_pane_follows_selected_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py", "b.py"]);
        std::fs::write(dir.path().join("b.log"), "one\ntwo\nthree\n").unwrap();
        app.set_log_view_height(2);
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.log.lines().len(), 3);
        assert_eq!(app.log_scroll, 1);
        app.scroll_up(1);
        assert!(!app.log_follow);
        assert_eq!(app.log_scroll, 0);
        app.handle_key(key(KeyCode::End));
        assert!(app.log_follow);
        assert_eq!(app.log_scroll, 1);
    }

    #[test]
    fn mouse_click_selects_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &["a.py", "b.py"]);
        app.set_table_viewport(TableViewport {
            x: 0,
            y: 3,
            width: 80,
            height: 10,
        });
        let click = MouseEvent {
            kind: MouseEventKind::Down(MouseButton::Left),
            column: 5,
            row: 4,
            modifiers: KeyModifiers::NONE,
        };
        app.handle_mouse(click);
        assert_eq!(app.selected, 1);
    }

    #[test]
    fn save_group_without_services_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app(dir.path(), &[]);
        app.handle_key(key(KeyCode::Char('c')));
        assert_eq!(app.input_mode, InputMode::Normal);
        assert_eq!(
            app.status_message().unwrap().0,
            "Select one or more services first."
        );
    }
}
