mod config;
mod events;
mod relay;
mod server;
mod tui;

use std::io;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use config::RelayConfig;
use events::ServerEvent;
use packline::{AckConfig, LossSimulation, ServerConfig};
use server::RelayServer;
use tui::TuiState;

#[derive(Parser)]
#[command(name = "packline-server")]
#[command(about = "Text relay over the packline transport")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = packline::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 4)]
    max_clients: usize,

    #[arg(long, default_value_t = 1000, help = "Heartbeat interval in ms")]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 10, help = "Client timeout in seconds")]
    timeout_secs: u64,

    #[arg(long)]
    headless: bool,

    #[arg(long, default_value_t = 0.0, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let heartbeat_interval = Duration::from_millis(args.heartbeat_ms);
    let ack = AckConfig::default();
    let config = RelayConfig {
        tick_rate: args.tick_rate,
        network: ServerConfig {
            bind_addr: args.bind,
            port: args.port,
            max_clients: args.max_clients,
            heartbeat_interval,
            client_timeout: Duration::from_secs(args.timeout_secs),
            // acks ride on heartbeats, keep loss detection behind them
            ack: AckConfig {
                loss_timeout: ack.loss_timeout.max(heartbeat_interval * 3),
                ..ack
            },
            loss: LossSimulation::new(args.loss_percent),
            ..Default::default()
        },
    };

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut server = RelayServer::new(config)
        .with_context(|| format!("failed to start server on {}:{}", args.bind, args.port))?;

    if args.headless {
        log::info!("Server started on {:?}", server.local_addr());
        server.run();
        log::info!("Server shutting down");
    } else {
        run_with_tui(&mut server)?;
    }

    Ok(())
}

fn run_with_tui(server: &mut RelayServer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new();

    if let Some(addr) = server.local_addr() {
        tui_state.log_info(format!("Server started on {}", addr));
    }

    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            match event {
                ServerEvent::ClientConnected { client_id, addr } => {
                    tui_state.log_info(format!("Client {} connected from {}", client_id, addr));
                }
                ServerEvent::ClientDisconnected { client_id, reason } => {
                    tui_state.log_info(format!("Client {} {}", client_id, reason.as_str()));
                }
                ServerEvent::Message { client_id, body } => {
                    tui_state.log_info(format!("<{}> {}", client_id, body));
                }
                ServerEvent::Error { message } => {
                    tui_state.log_error(message);
                }
            }
        }

        if let Some(client_id) = tui_state.take_pending_kick() {
            tui_state.log_warn(format!("Kicking client {}", client_id));
            server.kick_client(client_id);
        }

        if event::poll(Duration::from_millis(1))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let clients = server.client_infos();
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            running.store(false, Ordering::SeqCst);
                        }
                        KeyCode::Up => tui_state.select_prev(clients.len()),
                        KeyCode::Down => tui_state.select_next(clients.len()),
                        KeyCode::Char('k') | KeyCode::Char('K') => tui_state.request_kick(&clients),
                        _ => {}
                    }
                }
            }
        }

        let stats = server.stats();
        let clients = server.client_infos();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &stats, &clients);
        })?;
    }

    server.shutdown_connections();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
