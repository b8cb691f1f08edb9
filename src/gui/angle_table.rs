use crate::angle_store::{human_elapsed, AngleCell, GroupRow, Staleness};
use crate::frame_codec::{BridgeStatus, CanMode, Command, Line as WireLine};
use crate::gui::error::GuiError;
use crate::session::{ConnectionSession, SessionEvent, Transport};
use crate::tp2::GROUP_COUNT;
use crate::transmitter::TransmitJob;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::{
    collections::VecDeque,
    io,
    sync::mpsc::Receiver,
    time::{Duration, Instant},
};

/// Lines of traffic kept for display.
const TRAFFIC_LINES: usize = 200;

/// What the table screen shows between two redraws.
#[derive(Debug, Clone)]
pub struct TableApp {
    rows: Vec<GroupRow>,
    traffic: VecDeque<String>,
    status: String,
    auto_send: bool,
    transmitting: bool,
}

impl TableApp {
    /// A screen showing `rows` and no traffic yet.
    pub fn new(rows: Vec<GroupRow>) -> Self {
        Self {
            rows,
            traffic: VecDeque::new(),
            status: "connected".to_owned(),
            auto_send: false,
            transmitting: false,
        }
    }

    /// Folds a session event into the traffic pane and status line.
    pub fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Received(WireLine::Frame(frame)) => {
                self.push(format!(
                    "RX {:03X} [{}] {}",
                    frame.id(),
                    frame
                        .declared_len()
                        .map_or_else(|| "?".to_owned(), |len| len.to_string()),
                    frame.payload_tokens().join(" ")
                ));
            }
            SessionEvent::Received(WireLine::PlainText(text)) => {
                if let Some(BridgeStatus::AutoSend(on)) = BridgeStatus::classify(&text) {
                    self.auto_send = on;
                }
                self.push(format!("<< {text}"));
            }
            SessionEvent::Sent(command) => self.push(format!(">> {command}")),
            SessionEvent::TransmissionStopped(error) => {
                self.transmitting = false;
                self.status = match error {
                    Some(e) => format!("transmission stopped: {e}"),
                    None => "transmission stopped".to_owned(),
                };
            }
            SessionEvent::Error(e) => {
                self.push(format!("!! {e}"));
                self.status = format!("link down: {e}");
            }
            // The table and the Sent lines already show these
            SessionEvent::Angle(_) | SessionEvent::Emitted { .. } => {}
        }
    }

    fn push(&mut self, line: String) {
        if self.traffic.len() == TRAFFIC_LINES {
            self.traffic.pop_front();
        }
        self.traffic.push_back(line);
    }
}

/// Shows the live angle table for `session` until the operator presses
/// `q`. `job` is what `t` starts and stops.
pub fn angle_table<T: Transport>(
    session: &mut ConnectionSession<T>,
    events: &Receiver<SessionEvent>,
    job: Option<TransmitJob>,
) -> Result<(), GuiError> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let tick_rate = Duration::from_millis(100);
    let res = run_app(&mut terminal, session, events, job.as_ref(), tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res
}

fn run_app<B: Backend, T: Transport>(
    terminal: &mut Terminal<B>,
    session: &mut ConnectionSession<T>,
    events: &Receiver<SessionEvent>,
    job: Option<&TransmitJob>,
    tick_rate: Duration,
) -> Result<(), GuiError> {
    let mut app = TableApp::new(session.snapshot());
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, &app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        code => handle_key(&mut app, code, session, job),
                    }
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            while let Ok(event) = events.try_recv() {
                app.on_event(event);
            }
            app.rows = session.snapshot();
            app.transmitting = session.is_transmitting();
            last_tick = Instant::now();
        }
    }

    session.stop_transmission()?;
    Ok(())
}

fn handle_key<T: Transport>(
    app: &mut TableApp,
    code: KeyCode,
    session: &mut ConnectionSession<T>,
    job: Option<&TransmitJob>,
) {
    let outcome = match code {
        KeyCode::Char('n') => session.set_mode(CanMode::Normal).map(|_| "mode NORMAL requested"),
        KeyCode::Char('l') => session.set_mode(CanMode::Loopback).map(|_| "mode LOOPBACK requested"),
        KeyCode::Char('a') => session
            .send(Command::AutoSend(!app.auto_send))
            .map(|_| "auto send toggle requested"),
        KeyCode::Char('t') => match job {
            _ if session.is_transmitting() => session.stop_transmission().map(|_| "transmission stopped"),
            Some(job) => session.start_transmission(job.clone()).map(|_| "transmitting"),
            None => Ok("no transmission configured"),
        },
        KeyCode::Char('c') => {
            app.traffic.clear();
            Ok("traffic cleared")
        }
        _ => return,
    };
    app.status = match outcome {
        Ok(msg) => msg.to_owned(),
        Err(e) => e.to_string(),
    };
}

fn staleness_style(staleness: Staleness) -> Style {
    match staleness {
        Staleness::Fresh => Style::default().fg(Color::Green),
        Staleness::Stale => Style::default().fg(Color::Yellow),
        Staleness::Never => Style::default().fg(Color::DarkGray),
    }
}

fn cell_text(cell: &AngleCell) -> String {
    match &cell.value {
        Some(value) => format!("{value:>4} ({})", cell.elapsed_text()),
        None => "-".to_owned(),
    }
}

fn angle_rows(rows: &[GroupRow]) -> Table<'static> {
    let header = Row::new(["Group", "Roll", "Pitch", "Orientation", "Any"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let body = rows.iter().map(|row| {
        let mut cells = vec![Cell::from(format!("{} (0x{:03X})", row.group, row.group.can_id()))
            .style(staleness_style(row.staleness))];
        cells.extend(
            row.cells
                .iter()
                .map(|c| Cell::from(cell_text(c)).style(staleness_style(c.staleness))),
        );
        cells.push(Cell::from(
            row.since_any
                .map(human_elapsed)
                .unwrap_or_else(|| "never".to_owned()),
        ));
        Row::new(cells)
    });
    let widths = [
        Constraint::Length(10),
        Constraint::Length(16),
        Constraint::Length(16),
        Constraint::Length(16),
        Constraint::Length(10),
    ];
    Table::new(body, widths)
        .header(header)
        .block(Block::default().title(" TP2 Angles ").borders(Borders::ALL))
}

fn ui(f: &mut Frame, app: &TableApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(GROUP_COUNT as u16 + 3),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(f.size());

    f.render_widget(angle_rows(&app.rows), chunks[0]);

    let traffic: Vec<ListItem> = app
        .traffic
        .iter()
        .rev()
        .map(|l| ListItem::new(l.as_str()))
        .collect();
    f.render_widget(
        List::new(traffic).block(Block::default().title(" Traffic ").borders(Borders::ALL)),
        chunks[1],
    );

    let status = format!(
        " {} | auto {} | tx {} | q quit  n normal  l loopback  a auto  t transmit  c clear",
        app.status,
        if app.auto_send { "on" } else { "off" },
        if app.transmitting { "on" } else { "off" },
    );
    f.render_widget(Paragraph::new(status), chunks[2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angle_store::AngleStore;
    use crate::frame_codec::{decode_line, CanFrame};
    use crate::tp2::{AngleMagnitude, AngleUpdate, GroupId};
    use ratatui::backend::TestBackend;

    fn screen(app: &TableApp) -> String {
        let mut terminal = Terminal::new(TestBackend::new(110, 30)).unwrap();
        terminal.draw(|f| ui(f, app)).unwrap();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|c| c.symbol())
            .collect()
    }

    #[test]
    fn traffic_lines() {
        let mut app = TableApp::new(AngleStore::default().snapshot(Instant::now()));
        app.on_event(SessionEvent::Received(decode_line("CAN_RX_100_4_52_2D_33_34")));
        app.on_event(SessionEvent::Received(decode_line("AUTO_SEND_ON")));
        app.on_event(SessionEvent::Sent(Command::Send(
            CanFrame::new(0x123, &[0x01, 0xAB]).unwrap(),
        )));

        assert_eq!(
            Vec::from(app.traffic.clone()),
            [
                "RX 100 [4] 52 2D 33 34",
                "<< AUTO_SEND_ON",
                ">> SEND_123_01_ab",
            ]
        );
        assert!(app.auto_send);
    }

    #[test]
    fn traffic_is_bounded() {
        let mut app = TableApp::new(vec![]);
        for i in 0..TRAFFIC_LINES + 10 {
            app.on_event(SessionEvent::Received(WireLine::PlainText(i.to_string())));
        }
        assert_eq!(app.traffic.len(), TRAFFIC_LINES);
        assert_eq!(app.traffic.front().map(String::as_str), Some("<< 10"));
    }

    #[test]
    fn link_loss_shows_in_status() {
        let mut app = TableApp::new(vec![]);
        app.transmitting = true;
        app.on_event(SessionEvent::Error("read error: broken pipe".to_owned()));
        app.on_event(SessionEvent::TransmissionStopped(Some("channel is closed".to_owned())));
        assert!(!app.transmitting);
        assert_eq!(app.status, "transmission stopped: channel is closed");
        assert_eq!(app.traffic.back().map(String::as_str), Some("!! read error: broken pipe"));
    }

    #[test]
    fn table_renders_values() {
        let now = Instant::now();
        let mut store = AngleStore::default();
        store.apply(&AngleUpdate {
            group: GroupId::new(5).unwrap(),
            magnitude: AngleMagnitude::Pitch,
            value: "-34".to_owned(),
            observed_at: now,
        });
        let app = TableApp::new(store.snapshot(now));

        let text = screen(&app);
        assert!(text.contains("Orientation"));
        assert!(text.contains("5 (0x105)"));
        assert!(text.contains(" -34 (0s)"));
        assert!(text.contains("never"));
    }
}
