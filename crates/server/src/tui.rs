use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Row, Table};

use packline::{ClientId, ClientInfo, EntryState};

use crate::server::ServerStats;

const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

pub struct TuiState {
    log: VecDeque<(LogLevel, String)>,
    selected: usize,
    pending_kick: Option<ClientId>,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            log: VecDeque::new(),
            selected: 0,
            pending_kick: None,
        }
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message.into());
    }

    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Warn, message.into());
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Error, message.into());
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        if self.log.len() >= MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((level, message));
    }

    pub fn select_next(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + 1) % count;
        }
    }

    pub fn select_prev(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + count - 1) % count;
        }
    }

    pub fn request_kick(&mut self, clients: &[ClientInfo]) {
        if let Some(client) = clients.get(self.selected) {
            self.pending_kick = Some(client.id);
        }
    }

    pub fn take_pending_kick(&mut self) -> Option<ClientId> {
        self.pending_kick.take()
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &ServerStats, clients: &[ClientInfo]) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(10),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_capacity(frame, chunks[1], stats);
    render_clients(frame, chunks[2], state, clients);
    render_log(frame, chunks[3], state);
    render_help(frame, chunks[4]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let title = format!(" Packline Relay - Uptime: {} ", format_duration(stats.uptime_secs));

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Tick: {}  |  Sent: {}  |  Received: {}",
        stats.tick,
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received)
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_capacity(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(" Capacity ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ratio = if stats.max_clients == 0 {
        1.0
    } else {
        stats.client_count as f64 / stats.max_clients as f64
    };
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{} clients", stats.client_count, stats.max_clients));

    frame.render_widget(gauge, area);
}

fn render_clients(frame: &mut Frame, area: Rect, state: &TuiState, clients: &[ClientInfo]) {
    let block = Block::default()
        .title(" Clients ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let header = Row::new(vec!["ID", "Address", "State", "Ping", "RTT", "Up", "Down", "Loss"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = clients.iter().enumerate().map(|(index, client)| {
        let link = &client.link;
        let loss = link.packet_loss_percent();
        let style = if index == state.selected {
            Style::default().fg(Color::Black).bg(Color::Yellow)
        } else if loss > 5.0 {
            Style::default().fg(Color::Red)
        } else {
            Style::default().fg(Color::White)
        };

        Row::new(vec![
            client.id.to_string(),
            client.addr.to_string(),
            state_label(client.state, client.heartbeat_retry),
            format!("{}ms", client.ping.as_millis()),
            format!("{:.1}ms", link.rtt_ms),
            format!("{}/s", format_bytes(link.sent_bandwidth as u64)),
            format!("{}/s", format_bytes(link.received_bandwidth as u64)),
            format!("{:.1}%", loss),
        ])
        .style(style)
    });

    let widths = [
        Constraint::Length(4),
        Constraint::Length(22),
        Constraint::Length(12),
        Constraint::Length(8),
        Constraint::Length(9),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(7),
    ];

    let table = Table::new(rows, widths).header(header).block(block);
    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Events ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .log
        .iter()
        .skip(state.log.len().saturating_sub(visible))
        .map(|(level, message)| {
            let color = match level {
                LogLevel::Info => Color::White,
                LogLevel::Warn => Color::Yellow,
                LogLevel::Error => Color::Red,
            };
            Line::from(Span::styled(message.as_str(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("q/ESC quit  |  Up/Down select  |  k kick selected client")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn state_label(state: EntryState, retry: u16) -> String {
    match state {
        EntryState::Connected => "connected".to_string(),
        EntryState::HeartbeatAcked => "alive".to_string(),
        EntryState::HeartbeatWaiting => format!("waiting ({})", retry),
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
