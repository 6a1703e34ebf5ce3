use std::io::{self, Write};
use std::sync::mpsc;

use packline::{ClientHandler, ClientId, ClientSession, DisconnectReason, Packet, TextMessage};

/// What the user typed, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Stats,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "" => None,
            "/quit" | "/q" => Some(Command::Quit),
            "/stats" => Some(Command::Stats),
            _ => Some(Command::Say(line.to_string())),
        }
    }
}

/// Prints relayed text and reports teardown.
pub struct Printer<W: Write + Send> {
    out: W,
    closed: mpsc::Sender<DisconnectReason>,
}

impl<W: Write + Send> Printer<W> {
    pub fn new(out: W, closed: mpsc::Sender<DisconnectReason>) -> Self {
        Self { out, closed }
    }
}

impl Printer<io::Stdout> {
    pub fn stdout(closed: mpsc::Sender<DisconnectReason>) -> Self {
        Self::new(io::stdout(), closed)
    }
}

impl<W: Write + Send> ClientHandler for Printer<W> {
    fn on_packet(&mut self, _session: &mut ClientSession, packet: &Packet) {
        match TextMessage::from_packet(packet) {
            Ok(message) => {
                let sender = message
                    .sender
                    .map_or_else(|| "server".to_string(), |id| id.to_string());
                let _ = writeln!(self.out, "<{}> {}", sender, message.body);
            }
            Err(e) => log::debug!("Ignoring packet: {}", e),
        }
    }

    fn on_connect(&mut self, id: ClientId) {
        let _ = writeln!(self.out, "* connected as client {}", id);
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        let _ = writeln!(self.out, "* disconnected ({:?})", reason);
        let _ = self.closed.send(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  "), None);
        assert_eq!(Command::parse("/q"), Some(Command::Quit));
        assert_eq!(Command::parse("/stats\n"), Some(Command::Stats));
        assert_eq!(
            Command::parse(" bring the tractor \n"),
            Some(Command::Say("bring the tractor".to_string()))
        );
    }

    #[test]
    fn test_printer_reports_disconnect() {
        let (tx, rx) = mpsc::channel();
        let mut printer = Printer::new(Vec::new(), tx);
        printer.on_connect(ClientId(2));
        printer.on_disconnect(DisconnectReason::TimedOut);

        assert_eq!(rx.try_recv().unwrap(), DisconnectReason::TimedOut);
        let text = String::from_utf8(printer.out).unwrap();
        assert_eq!(text, "* connected as client 2\n* disconnected (TimedOut)\n");
    }
}
