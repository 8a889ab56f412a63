use std::time::{Duration, Instant};

use chat::Output;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use rand::Rng;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame, Terminal,
};

use crate::chat::{im_channel::EventRx, worker::JobRunner, Session};

pub mod chat;
pub mod portrait;

/// Upper bound on the sleep between frames, so the cursor and spinners animate.
const FRAME: Duration = Duration::from_millis(50);
const PORTRAIT_WIDTH: u16 = 34;
const STATIC: [char; 6] = [' ', '.', '·', ':', '∙', '˙'];

/// The flickering line shown before anyone answers.
fn signal_line(width: u16) -> Line<'static> {
    let mut rng = rand::thread_rng();
    let label = " 信号微弱 ";
    let noise_len = (width as usize).saturating_sub(10) / 2;
    let mut noise = || -> String {
        (0..noise_len)
            .map(|_| STATIC[rng.gen_range(0..STATIC.len())])
            .collect()
    };
    let (left, right) = (noise(), noise());
    Line::from(vec![
        Span::styled(left, Style::new().fg(Color::DarkGray)),
        Span::styled(label, Style::new().fg(Color::Green)),
        Span::styled(right, Style::new().fg(Color::DarkGray)),
    ])
}

pub struct App {
    pub chat: chat::ChatComponent,
    pub portrait: portrait::PortraitComponent,
    session: Session,
    rx: EventRx,
    runner: Box<dyn JobRunner>,
}

impl App {
    pub fn new(session: Session, rx: EventRx, runner: Box<dyn JobRunner>) -> Self {
        Self {
            chat: chat::ChatComponent::new(),
            portrait: portrait::PortraitComponent::new(),
            session,
            rx,
            runner,
        }
    }

    pub fn render(&mut self, f: &mut Frame) {
        let horizontal = Layout::horizontal([Constraint::Length(PORTRAIT_WIDTH), Constraint::Min(20)]);
        let [portrait_area, right_area] = horizontal.areas(f.size());

        let vertical = Layout::vertical([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(1),
        ]);
        let [signal_area, main_area, help_area] = vertical.areas(right_area);

        self.portrait.render(&self.session, f, portrait_area);
        if self.session.signal_visible() {
            self.render_signal(f, signal_area);
        }
        self.chat.render(&self.session, f, main_area);

        let help_message = Paragraph::new("help: [Enter send] [Alt+Enter newline] [Esc+Esc quit]")
            .style(Style::new().fg(Color::DarkGray));
        f.render_widget(help_message, help_area);
    }

    fn render_signal(&self, f: &mut Frame, area: Rect) {
        f.render_widget(
            Paragraph::new(signal_line(area.width)).alignment(Alignment::Center),
            area,
        );
    }

    /// Applies everything the workers reported since the last frame.
    fn drain_events(&mut self) {
        for event in self.rx.try_iter().collect::<Vec<_>>() {
            if let Some(job) = self.session.handle(event) {
                self.runner.run(job);
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        self.session
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(FRAME)
            .min(FRAME)
    }

    pub fn run_loop(mut self) -> anyhow::Result<()> {
        // setup terminal
        enable_raw_mode()?;
        let mut stdout = std::io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let mut main_loop = || -> anyhow::Result<()> {
            loop {
                self.drain_events();
                self.session.tick(Instant::now());
                terminal.draw(|f| self.render(f))?;

                if !event::poll(self.poll_timeout())? {
                    continue;
                }
                match self.chat.handler_input(event::read()?, self.session.is_busy()) {
                    Output::Exit => break,
                    Output::Submit(text) => {
                        if let Some(job) = self.session.submit(&text) {
                            self.runner.run(job);
                        }
                    }
                    Output::Normal => {}
                }
            }
            self.session.shutdown();
            Ok(())
        };

        let r = main_loop();

        // restore terminal
        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;
        r
    }
}
