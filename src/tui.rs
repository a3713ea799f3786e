//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the application state using `ratatui`.

use std::io::{self, Stdout};

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Cell, Clear, Paragraph, Row, Table, TableState};
use ratatui::Terminal;

use crate::app::{App, InputMode, StatusLevel, TableViewport};
use crate::output::sanitize_text;
use crate::service::{DisplayStatus, ServiceState};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Amber used for services that exited.
const EXIT_COLOR: Color = Color::Rgb(255, 179, 71);

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    let title = window_title(app);
    execute!(terminal.backend_mut(), SetTitle(title))?;
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Percentage(45),
                Constraint::Min(5),
                Constraint::Length(4),
            ])
            .split(area);
        let border_style = Style::default().fg(Color::DarkGray);

        let groups = Paragraph::new(groups_line(app)).block(
            Block::default()
                .title("Groups")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(groups, vertical[0]);

        let table_block = Block::default()
            .title("Services")
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style);
        let table_inner = table_block.inner(vertical[1]);
        // Rows start below the header line.
        app.set_table_viewport(TableViewport {
            x: table_inner.x,
            y: table_inner.y.saturating_add(1),
            width: table_inner.width,
            height: table_inner.height.saturating_sub(1),
        });

        let path_width = (table_inner.width as usize).saturating_sub(4 + 10 + 8 + 10 + 21 + 5);
        let rows: Vec<Row> = app
            .services
            .iter()
            .map(|service| service_row(service, app.use_symbols, path_width))
            .collect();
        let header = Row::new(["", "STATUS", "PID", "UPTIME", "MTIME", "PATH"])
            .style(Style::default().fg(Color::DarkGray).add_modifier(Modifier::BOLD));
        let widths = [
            Constraint::Length(3),
            Constraint::Length(10),
            Constraint::Length(8),
            Constraint::Length(10),
            Constraint::Length(21),
            Constraint::Min(10),
        ];
        let table = Table::new(rows, widths)
            .header(header)
            .block(table_block)
            .highlight_style(Style::default().bg(Color::Rgb(40, 44, 52)).add_modifier(Modifier::BOLD))
            .highlight_symbol(if app.use_symbols { "▶ " } else { "> " });
        let mut state = TableState::default().with_offset(app.table_offset);
        if !app.services.is_empty() {
            state.select(Some(app.selected.min(app.services.len() - 1)));
        }
        frame.render_stateful_widget(table, vertical[1], &mut state);
        app.table_offset = state.offset();

        if app.services.is_empty() {
            let empty = Paragraph::new("No services registered. Press a to add one.")
                .style(Style::default().fg(Color::DarkGray));
            frame.render_widget(empty, table_inner);
        }

        let log_block = Block::default()
            .title(log_title(app))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style);
        let log_area = log_block.inner(vertical[2]);
        app.set_log_view_height(log_area.height as usize);
        let (log_lines, total) = render_log_lines(app, log_area.height as usize, log_area.width as usize);
        frame.render_widget(Paragraph::new(log_lines).block(log_block), vertical[2]);
        if total == 0 {
            let empty = Paragraph::new("No output yet")
                .style(Style::default().fg(Color::DarkGray));
            frame.render_widget(empty, log_area);
        }

        let (help_line, help_style) = help_line(app);
        let status = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(Span::styled(help_line, help_style)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(status, vertical[3]);

        if app.show_help {
            let popup_area = centered_rect(60, 70, area);
            let help_block = Paragraph::new(HELP_TEXT.join("\n"))
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help_block, popup_area);
        }
    })?;
    Ok(())
}

const HELP_TEXT: &[&str] = &[
    "Services:",
    "  Up/Down    Move cursor",
    "  Space      Mark / unmark",
    "  Esc        Clear marks",
    "  a          Add service",
    "  d          Remove service",
    "  s / Enter  Start",
    "  x          Stop",
    "  r          Restart",
    "  S / X      Start all / Stop all",
    "  o          Open log file",
    "  R          Refresh now",
    "  p          Toggle auto refresh",
    "",
    "Groups:",
    "  [ / ]      Previous / next group",
    "  g          Start group",
    "  c          Save marked as group",
    "  D          Delete group",
    "  u          Toggle autostart",
    "",
    "Log:",
    "  PageUp/Dn  Scroll",
    "  Home/End   Top / follow",
    "  f          Toggle follow",
    "",
    "  ?          Toggle this help",
    "  q          Quit (stops all services)",
];

fn service_row(service: &ServiceState, use_symbols: bool, path_width: usize) -> Row<'static> {
    let status = service.display_status();
    let mark = match (service.marked, use_symbols) {
        (true, true) => "●",
        (true, false) => "*",
        (false, _) => "",
    };
    Row::new(vec![
        Cell::from(mark).style(Style::default().fg(Color::Cyan)),
        Cell::from(status.label()).style(status_style(status)),
        Cell::from(service.pid_label()),
        Cell::from(service.uptime_label()),
        Cell::from(service.mtime.clone()).style(Style::default().fg(Color::Gray)),
        Cell::from(truncate_left(&service.spec.path, path_width)),
    ])
}

fn groups_line(app: &App) -> Line<'static> {
    let names = app.config.group_names();
    if names.is_empty() {
        return Line::from(Span::styled(
            "No groups. Mark services and press c to save one.",
            Style::default().fg(Color::DarkGray),
        ));
    }
    let mut spans = Vec::new();
    for name in names {
        let current = app.current_group.as_deref() == Some(name.as_str());
        let autostart = app.config.is_autostart(&name);
        let label = if autostart {
            format!(" {} [auto] ", name)
        } else {
            format!(" {} ", name)
        };
        let style = if current {
            Style::default().fg(Color::Black).bg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        spans.push(Span::styled(label, style));
        spans.push(Span::raw(" "));
    }
    Line::from(spans)
}

fn help_line(app: &App) -> (String, Style) {
    let dim = Style::default().fg(Color::DarkGray);
    match &app.input_mode {
        InputMode::AddPath => {
            return (format!("Add service path: {}  (Enter add, Esc cancel)", app.input), Style::default());
        }
        InputMode::GroupName => {
            return (format!("Group name: {}  (Enter save, Esc cancel)", app.input), Style::default());
        }
        InputMode::ConfirmRemove(id) => {
            return (
                format!("{} is running. Stop and remove it? (y/n)", app.name_of(*id)),
                Style::default().fg(Color::Yellow),
            );
        }
        InputMode::ConfirmDeleteGroup(group) => {
            return (
                format!("Delete group {}? (y/n)", group),
                Style::default().fg(Color::Yellow),
            );
        }
        InputMode::Normal => {}
    }
    if let Some((text, level)) = app.status_message() {
        let style = match level {
            StatusLevel::Info => Style::default().fg(Color::Green),
            StatusLevel::Warning => Style::default().fg(Color::Yellow),
            StatusLevel::Error => Style::default().fg(Color::Red),
        };
        return (text.to_string(), style);
    }
    let arrows = if app.use_symbols { "↑/↓" } else { "Up/Down" };
    let refresh = if app.auto_refresh { "on" } else { "off" };
    (
        format!(
            "{} select | Space mark | s start | x stop | r restart | a add | d remove | g group | o log | p refresh ({}) | ? help | q quit",
            arrows, refresh
        ),
        dim,
    )
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn window_title(app: &App) -> String {
    match app.selected_service() {
        Some(service) => format!("svcrack · {}", service.spec.file_name()),
        None => "svcrack".to_string(),
    }
}

fn log_title(app: &App) -> String {
    let Some(service) = app.selected_service() else {
        return "Log".to_string();
    };
    let Some(path) = app.log.path() else {
        return "Log".to_string();
    };
    let follow = if app.log_follow { "" } else { " [paused]" };
    format!(
        "Log - {} ({}){}",
        path.display(),
        service.display_status().label().to_lowercase(),
        follow
    )
}

fn render_log_lines(app: &App, height: usize, width: usize) -> (Text<'static>, usize) {
    let total = app.log.lines().len();
    if height == 0 || total == 0 {
        return (Text::default(), total);
    }
    let start = if app.log_follow {
        total.saturating_sub(height)
    } else {
        app.log_scroll.min(total.saturating_sub(height))
    };
    let lines = app
        .log
        .lines()
        .iter()
        .skip(start)
        .take(height)
        .map(|raw| {
            let plain = strip_carriage(&sanitize_text(raw));
            if plain.starts_with("=== START ") {
                Line::from(Span::styled(
                    truncate(&plain, width.saturating_sub(1)),
                    Style::default().fg(Color::Cyan),
                ))
            } else {
                Line::from(Span::raw(truncate(&plain, width.saturating_sub(1))))
            }
        })
        .collect::<Vec<_>>();
    (Text::from(lines), total)
}

fn status_style(status: DisplayStatus) -> Style {
    match status {
        DisplayStatus::Running => Style::default().fg(Color::Green),
        DisplayStatus::Stopped => Style::default().fg(Color::Gray),
        DisplayStatus::Exited(_) => Style::default().fg(EXIT_COLOR),
        DisplayStatus::Missing => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

/// Shortens from the left so the file name stays visible.
fn truncate_left(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if max == 0 || count <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(1);
    let mut out = String::from("~");
    out.extend(text.chars().skip(count - keep));
    out
}

fn strip_carriage(text: &str) -> String {
    text.rsplit('\r').next().unwrap_or("").to_string()
}
