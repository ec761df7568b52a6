//! Persistent terminal view of the retained messages.
//!
//! The [`ViewPresenter`] half lives on the claim tasks and only replaces the
//! latest frame in a watch channel. The [`TerminalView`] half owns the
//! terminal on its own thread and redraws whenever the frame changes.

use std::io;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossterm::{
    cursor::Show,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{entry_text, Presenter};
use crate::consumer::RecordMetadata;
use crate::shutdown::Shutdown;

/// How often the view thread checks for keys and shutdown.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct ViewFrame {
    pub messages: Vec<String>,
    pub metadata: RecordMetadata,
    pub received: u64,
    pub updated: Option<DateTime<Local>>,
}

pub struct ViewPresenter {
    frames: watch::Sender<ViewFrame>,
}

impl ViewPresenter {
    /// Creates the presenter and the view that will draw its frames.
    pub fn new(topic: &str, capacity: usize) -> (Self, TerminalView) {
        let (frames, receiver) = watch::channel(ViewFrame::default());
        let view = TerminalView {
            frames: receiver,
            topic: topic.to_string(),
            capacity,
        };
        (Self { frames }, view)
    }
}

impl Presenter for ViewPresenter {
    fn render(&self, snapshot: &[Vec<u8>], metadata: &RecordMetadata) {
        // Latest frame wins; never waits for the view thread.
        self.frames.send_modify(|frame| {
            frame.messages = snapshot.iter().map(|entry| entry_text(entry).into_owned()).collect();
            frame.metadata = metadata.clone();
            frame.received += 1;
            frame.updated = Some(Local::now());
        });
    }
}

/// Raw mode and the alternate screen, restored when dropped.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        // From here on a failure still leaves raw mode through the guard.
        let guard = TerminalGuard;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!(error = %e, "failed to leave raw mode");
        }
        if let Err(e) = execute!(io::stdout(), LeaveAlternateScreen, Show) {
            warn!(error = %e, "failed to leave the alternate screen");
        }
    }
}

pub struct TerminalView {
    frames: watch::Receiver<ViewFrame>,
    topic: String,
    capacity: usize,
}

impl TerminalView {
    /// Takes over the terminal on a dedicated thread. The view triggers
    /// `shutdown` whenever it stops, whether the user quit or the terminal
    /// could not be used; triggering `shutdown` elsewhere closes the view.
    pub fn spawn(self, shutdown: Shutdown) -> io::Result<thread::JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name("terminal-view".to_string())
            .spawn(move || self.run(shutdown))
    }

    fn run(self, shutdown: Shutdown) -> io::Result<()> {
        self.run_with(&shutdown, || {
            let guard = TerminalGuard::enter()?;
            let terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
            Ok((terminal, guard))
        })
    }

    /// Runs the view on whatever terminal `setup` provides. `G` is held until
    /// the event loop ends and restores the terminal when dropped.
    fn run_with<B, G, F>(mut self, shutdown: &Shutdown, setup: F) -> io::Result<()>
    where
        B: Backend,
        F: FnOnce() -> io::Result<(Terminal<B>, G)>,
    {
        let result = setup().and_then(|(mut terminal, _guard)| {
            info!("terminal view started");
            self.event_loop(&mut terminal, shutdown)
        });
        if let Err(e) = &result {
            warn!(error = %e, "terminal view stopped with an error");
        }
        // Nothing shows the records once the view is gone.
        shutdown.trigger();
        result
    }

    fn event_loop<B: Backend>(&mut self, terminal: &mut Terminal<B>, shutdown: &Shutdown) -> io::Result<()> {
        let mut dirty = true;
        while !shutdown.is_triggered() {
            if dirty || self.frames.has_changed().unwrap_or(false) {
                let frame = self.frames.borrow_and_update().clone();
                terminal.draw(|f| draw(f, &self.topic, self.capacity, &frame))?;
                dirty = false;
            }

            if event::poll(TICK)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
                        if quit {
                            shutdown.trigger();
                        }
                    }
                    Event::Resize(_, _) => dirty = true,
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Draws one frame: the message list on top, a one-line status bar below.
pub fn draw(f: &mut Frame, topic: &str, capacity: usize, frame: &ViewFrame) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(f.area());

    let mut lines: Vec<Line> = Vec::with_capacity(capacity * 2);
    if frame.messages.is_empty() {
        lines.push(Line::from(Span::styled(
            "waiting for messages...",
            Style::default().fg(Color::DarkGray),
        )));
    }
    for (n, message) in frame.messages.iter().enumerate() {
        lines.push(Line::from(vec![
            Span::styled(format!("{:>2}. ", n + 1), Style::default().fg(Color::Cyan)),
            Span::raw(message.clone()),
        ]));
        lines.push(Line::default());
    }

    let messages = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" {topic} - last {capacity} "))
                .title_style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(messages, chunks[0]);

    let updated = frame
        .updated
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let status = Line::from(vec![
        Span::styled(
            format!(" broker {} ", frame.metadata.broker_ip.as_deref().unwrap_or("?")),
            Style::default().fg(Color::Black).bg(Color::Cyan),
        ),
        Span::raw(format!(
            " partition {} offset {} | {} received | updated {} | q to quit",
            frame.metadata.partition, frame.metadata.offset, frame.received, updated
        )),
    ]);
    f.render_widget(Paragraph::new(status), chunks[1]);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use ratatui::backend::TestBackend;

    struct Restored(Arc<AtomicBool>);

    impl Drop for Restored {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn buffer_text(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        buffer.content().iter().map(|cell| cell.symbol()).collect()
    }

    #[test]
    fn presenter_replaces_frame() {
        let (presenter, view) = ViewPresenter::new("random-jokes", 3);
        let metadata = RecordMetadata {
            partition: 1,
            offset: 9,
            ..Default::default()
        };
        presenter.render(&[b"a".to_vec()], &metadata);
        presenter.render(&[b"a".to_vec(), vec![0xff, b'b']], &metadata);

        let frame = view.frames.borrow().clone();
        assert_eq!(frame.messages, vec!["a", "\u{fffd}b"]);
        assert_eq!(frame.received, 2);
        assert_eq!(frame.metadata.offset, 9);
        assert!(frame.updated.is_some());
    }

    #[test]
    fn draws_messages_and_status() {
        let mut terminal = Terminal::new(TestBackend::new(80, 12)).expect("failed to create terminal");
        let frame = ViewFrame {
            messages: vec!["Chuck Norris counted to infinity".to_string()],
            metadata: RecordMetadata {
                broker_ip: Some("10.1.1.1".to_string()),
                topic: "random-jokes".to_string(),
                partition: 0,
                offset: 3,
                ..Default::default()
            },
            received: 4,
            updated: None,
        };
        terminal
            .draw(|f| draw(f, "random-jokes", 3, &frame))
            .expect("failed to draw");

        let text = buffer_text(&terminal);
        assert!(text.contains("random-jokes - last 3"));
        assert!(text.contains("Chuck Norris counted to infinity"));
        assert!(text.contains("broker 10.1.1.1"));
        assert!(text.contains("4 received"));
    }

    #[test]
    fn draws_placeholder_when_empty() {
        let mut terminal = Terminal::new(TestBackend::new(60, 6)).expect("failed to create terminal");
        terminal
            .draw(|f| draw(f, "random-jokes", 3, &ViewFrame::default()))
            .expect("failed to draw");
        assert!(buffer_text(&terminal).contains("waiting for messages"));
    }

    #[test]
    fn setup_failure_triggers_shutdown() {
        let (_presenter, view) = ViewPresenter::new("random-jokes", 3);
        let shutdown = Shutdown::new();

        let result = view.run_with::<TestBackend, (), _>(&shutdown, || {
            Err(io::Error::other("not a terminal"))
        });

        assert_eq!(result.unwrap_err().to_string(), "not a terminal");
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn terminal_is_restored_when_the_view_stops() {
        let (_presenter, view) = ViewPresenter::new("random-jokes", 3);
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let restored = Arc::new(AtomicBool::new(false));

        let guard = Restored(restored.clone());
        view.run_with(&shutdown, move || Ok((Terminal::new(TestBackend::new(40, 6))?, guard)))
            .unwrap();

        assert!(restored.load(Ordering::SeqCst));
        assert!(shutdown.is_triggered());
    }
}
