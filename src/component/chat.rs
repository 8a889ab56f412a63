use std::time::Instant;

use crossterm::event::{Event, KeyCode, KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use ratatui::layout::Position;
use ratatui::style::{Color, Modifier, Style, Stylize};
use ratatui::{
    layout::{Constraint, Layout, Rect},
    text::{Line, Span, Text},
    widgets::{Block, Paragraph},
    Frame,
};
use tui_textarea::TextArea;

use crate::chat::{
    transcript::{Message, MessageKind, Sender, Transcript},
    ConversationState, Session,
};

const CURSOR: char = '▌';
const BLINK_MS: u128 = 500;

/// Splits `text` into display lines no wider than `max_len` cells.
/// Non-ASCII characters count as two cells.
pub fn wrap_width(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(2);
    let mut lines = vec![];
    let mut s = String::with_capacity(max_len);
    let mut len = 0;
    for c in text.chars() {
        if c == '\n' {
            lines.push(std::mem::take(&mut s));
            len = 0;
            continue;
        }
        let w = if c.is_ascii() { 1 } else { 2 };
        if len + w > max_len && !s.is_empty() {
            lines.push(std::mem::take(&mut s));
            len = 0;
        }
        s.push(c);
        len += w;
    }
    lines.push(s);
    lines
}

pub struct MessagesComponent {
    cursor: (u16, u16),
    last_mouse_event: MouseEvent,
    lock_on_bottom: bool,
    seen_revision: u64,
    area: Rect,
    active: bool,
}

impl MessagesComponent {
    pub fn new() -> Self {
        Self {
            cursor: (0, 0),
            lock_on_bottom: true,
            seen_revision: 0,
            active: true,
            area: Rect::default(),
            last_mouse_event: MouseEvent {
                row: 0,
                column: 0,
                kind: MouseEventKind::Moved,
                modifiers: KeyModifiers::empty(),
            },
        }
    }

    fn update_active(&mut self, event: MouseEvent) {
        if event.kind == MouseEventKind::Down(MouseButton::Left) {
            self.active = self.area.contains(Position::new(event.column, event.row))
        }
        if event.kind == MouseEventKind::Drag(MouseButton::Left) && self.active {
            self.move_scoll(event);
        }
        self.last_mouse_event = event;
    }

    fn header(message: &Message, npc_name: &str) -> Line<'static> {
        let (who, style) = match message.sender {
            Sender::User => ("你".to_string(), Style::new().fg(Color::Yellow).bold()),
            Sender::Npc => (npc_name.to_string(), Style::new().fg(Color::Cyan).bold()),
        };
        Line::from(vec![
            Span::styled(who, style),
            Span::styled(
                format!("  {}", message.at.format("%H:%M")),
                Style::new().fg(Color::DarkGray),
            ),
        ])
    }

    fn body_style(message: &Message) -> Style {
        match (message.kind, message.sender) {
            (MessageKind::Placeholder, _) => Style::new()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
            (MessageKind::Failure, _) => Style::new().fg(Color::Red),
            (MessageKind::Speech, Sender::User) => Style::new().fg(Color::White),
            (MessageKind::Speech, Sender::Npc) => Style::new().fg(Color::LightCyan),
        }
    }

    pub fn render(
        &mut self,
        transcript: &Transcript,
        npc_name: &str,
        blink_on: bool,
        frame: &mut Frame,
        area: Rect,
    ) {
        self.area = area;
        if transcript.revision() != self.seen_revision {
            self.seen_revision = transcript.revision();
            self.lock_on_bottom = true;
        }

        let max_len = area.width.saturating_sub(2) as usize;
        let mut text = Text::default();
        if transcript.is_empty() {
            text.extend([Line::styled(
                "（植物的叶片微微发亮，像在等什么人开口。）",
                Style::new().fg(Color::DarkGray),
            )]);
        }
        for message in transcript.messages() {
            text.extend([Self::header(message, npc_name)]);

            let style = Self::body_style(message);
            let mut body = message.text.clone();
            if message.streaming {
                body.push(if blink_on { CURSOR } else { ' ' });
            }
            for line in wrap_width(&body, max_len) {
                text.extend([Line::styled(line, style)]);
            }
            text.extend([Line::raw("")]);
        }

        let line_n = text.lines.len();
        let max_line = area.height.saturating_sub(2) as usize;
        if line_n > max_line {
            let max_cursor = line_n - max_line;
            if self.cursor.0 >= max_cursor as u16 {
                self.lock_on_bottom = true;
            }

            if self.lock_on_bottom {
                self.cursor.0 = max_cursor as u16;
            }
        } else {
            self.cursor.0 = 0;
        }

        let paragraph = Paragraph::new(text)
            .block(Block::bordered().title("通讯").gray())
            .scroll(self.cursor);
        frame.render_widget(paragraph, area);
    }

    pub fn move_scoll(&mut self, event: MouseEvent) {
        let (delta_y, delta_x) = (
            event.row as i16 - self.last_mouse_event.row as i16,
            event.column as i16 - self.last_mouse_event.column as i16,
        );
        if delta_x != 0 {
            self.cursor.1 = (self.cursor.1 as i16 - delta_x).max(0) as u16;
        }
        if delta_y != 0 {
            self.cursor.0 = (self.cursor.0 as i16 - delta_y).max(0) as u16;
            self.lock_on_bottom = false;
        }
    }

    pub fn handle_mouse(&mut self, event: MouseEvent) {
        match event.kind {
            MouseEventKind::ScrollDown => {
                self.cursor.0 += 3;
            }
            MouseEventKind::ScrollUp => {
                self.cursor.0 = self.cursor.0.max(3) - 3;
                self.lock_on_bottom = false;
            }
            _ => {}
        }
        self.update_active(event);
    }
}

pub struct ChatComponent {
    pub messages: MessagesComponent,
    input: TextArea<'static>,
    exit_n: u8,
    started: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Output {
    Exit,
    Submit(String),
    Normal,
}

impl ChatComponent {
    pub fn new() -> Self {
        Self {
            messages: MessagesComponent::new(),
            input: Self::new_textarea(),
            exit_n: 0,
            started: Instant::now(),
        }
    }

    fn new_textarea() -> TextArea<'static> {
        let mut textarea = TextArea::default();
        textarea.set_cursor_line_style(Style::default());
        textarea
    }

    fn blink_on(&self) -> bool {
        (self.started.elapsed().as_millis() / BLINK_MS) % 2 == 0
    }

    pub fn render(&mut self, session: &Session, frame: &mut Frame, area: Rect) {
        let vertical = Layout::vertical([Constraint::Min(5), Constraint::Length(3)]);
        let [messages_area, input_area] = vertical.areas(area);

        let npc_name = session.profile().map(|p| p.name.as_str()).unwrap_or("？？？");
        self.messages
            .render(session.transcript(), npc_name, self.blink_on(), frame, messages_area);

        let (title, style) = if session.is_busy() {
            ("对方正在回应……", Style::new().fg(Color::DarkGray))
        } else {
            match session.state() {
                ConversationState::AwaitingFirstContact => {
                    ("触碰植物，说点什么 [Enter]", Style::new().fg(Color::Green))
                }
                ConversationState::InDialogue => ("回复 [Enter]", Style::new().fg(Color::White)),
            }
        };
        self.input.set_style(style);
        self.input.set_block(Block::bordered().title(title).gray());
        frame.render_widget(&self.input, input_area);
    }

    fn submit_message(&mut self) -> Output {
        if self.input.lines().iter().all(|l| l.trim().is_empty()) {
            return Output::Normal;
        }
        let mut new_textarea = Self::new_textarea();
        std::mem::swap(&mut self.input, &mut new_textarea);
        let lines = new_textarea.into_lines();
        let message = lines.join("\n");

        self.messages.lock_on_bottom = true;
        Output::Submit(message)
    }

    /// `busy` disables editing and submission.
    pub fn handler_input(&mut self, event: Event, busy: bool) -> Output {
        let is_key = matches!(&event, Event::Key(..));

        match event {
            Event::Key(input) if input.kind != KeyEventKind::Press => {}
            Event::Key(input) if input.code == KeyCode::Esc => {
                self.exit_n += 2;
                if self.exit_n >= 3 {
                    return Output::Exit;
                }
            }
            Event::Key(input)
                if input.code == KeyCode::Char('c')
                    && input.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                return Output::Exit;
            }
            Event::Key(_) if busy => {}
            Event::Key(input)
                if input.code == KeyCode::Enter && input.modifiers.contains(KeyModifiers::ALT) =>
            {
                self.input.insert_newline();
            }
            Event::Key(input) if input.code == KeyCode::Enter => {
                let output = self.submit_message();
                if output != Output::Normal {
                    self.exit_n = 0;
                    return output;
                }
            }
            Event::Key(input) => {
                self.input.input(input);
            }
            Event::Paste(text) if !busy => {
                self.input.insert_str(text);
            }
            Event::Mouse(event) => {
                self.messages.handle_mouse(event);
            }
            _ => {}
        }

        if is_key {
            self.exit_n = self.exit_n.max(1) - 1;
        }
        Output::Normal
    }
}
