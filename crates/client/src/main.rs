mod chat;

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use chat::{Command, Printer};
use packline::{ClientConfig, ClientSession, LossSimulation, TextMessage};

#[derive(Parser)]
#[command(name = "packline-client")]
#[command(about = "Sends stdin lines through a packline relay server")]
struct Args {
    #[arg(
        short,
        long,
        default_value_t = SocketAddr::from(([127, 0, 0, 1], packline::DEFAULT_PORT)),
        help = "Server address to connect to"
    )]
    server: SocketAddr,

    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    #[arg(long, default_value_t = 5, help = "Connect timeout in seconds")]
    connect_timeout: u64,

    #[arg(long, default_value_t = 3, help = "Resends for each lost line")]
    retries: u8,

    #[arg(long, default_value_t = 0.0, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ClientConfig {
        server_addr: args.server,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        loss: LossSimulation::new(args.loss_percent),
        ..Default::default()
    };

    let (closed_tx, closed) = mpsc::channel();
    let mut session = ClientSession::with_handler(config, Printer::stdout(closed_tx));
    session
        .connect()
        .with_context(|| format!("could not connect to {}", args.server))?;

    let lines = spawn_stdin_reader();
    let tick = Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64);
    let mut last_tick = Instant::now();

    loop {
        for line in lines.try_iter() {
            match Command::parse(&line) {
                Some(Command::Say(body)) => {
                    let packet = TextMessage::new(None, body).to_packet()?;
                    if let Err(e) = session.send(&packet, true, args.retries) {
                        log::warn!("Send failed: {}", e);
                    }
                }
                Some(Command::Stats) => print_stats(&session),
                Some(Command::Quit) => {
                    session.disconnect();
                }
                None => {}
            }
        }

        let now = Instant::now();
        session.update(now - last_tick);
        last_tick = now;

        if closed.try_recv().is_ok() || !session.is_connected() {
            break;
        }
        thread::sleep(tick);
    }

    Ok(())
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_stats(session: &ClientSession) {
    let stats = session.stats();
    println!(
        "* rtt {:.1}ms | sent {} acked {} lost {} ({:.1}%) | up {:.0}B/s down {:.0}B/s | pending resends {}",
        stats.rtt_ms,
        stats.packets_sent,
        stats.packets_acked,
        stats.packets_lost,
        stats.packet_loss_percent(),
        stats.sent_bandwidth,
        stats.received_bandwidth,
        session.pending_resends()
    );
}
