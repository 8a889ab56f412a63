//! Character-by-character rendering.
//!
//! The renderer owns a queue of characters that have been produced but not yet
//! shown. Producers push whole strings or stream fragments; the UI loop calls
//! [`TypingRenderer::tick`] and at most one character lands per tick, once the
//! pause chosen for the previous character has elapsed.

use std::{collections::VecDeque, time::Instant};

use rand::Rng;

use super::transcript::{Sender, Transcript};
use crate::delay::DelayModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// Nothing is being rendered.
    Idle,
    /// Rendering, but nothing changed on this tick.
    Waiting,
    Wrote(char),
    /// The cursor was removed; the message is complete.
    Finished,
}

#[derive(Debug, Default)]
pub struct TypingRenderer {
    pending: VecDeque<char>,
    next_at: Option<Instant>,
    active: bool,
    source_closed: bool,
}

impl TypingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Opens a new streaming message with a cursor.
    pub fn start(&mut self, transcript: &mut Transcript, sender: Sender) {
        self.pending.clear();
        self.next_at = None;
        self.active = true;
        self.source_closed = false;
        transcript.begin_streaming(sender);
    }

    pub fn push_fragment(&mut self, fragment: &str) {
        if self.active && !self.source_closed {
            self.pending.extend(fragment.chars());
        }
    }

    /// No more fragments will come; finish once the queue drains.
    pub fn close(&mut self) {
        self.source_closed = true;
    }

    /// Renders a complete string.
    pub fn render_text(&mut self, transcript: &mut Transcript, sender: Sender, text: &str) {
        self.start(transcript, sender);
        self.push_fragment(text);
        self.close();
    }

    /// When the next tick has something to do. `None` while idle or while
    /// waiting for the producer.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.active || (self.pending.is_empty() && !self.source_closed) {
            return None;
        }
        Some(self.next_at.unwrap_or_else(Instant::now))
    }

    pub fn tick<R: Rng>(
        &mut self,
        now: Instant,
        delays: &mut DelayModel<R>,
        transcript: &mut Transcript,
    ) -> RenderStatus {
        if !self.active {
            return RenderStatus::Idle;
        }
        if matches!(self.next_at, Some(at) if now < at) {
            return RenderStatus::Waiting;
        }

        match self.pending.pop_front() {
            Some(c) => {
                transcript.append_char(c);
                self.next_at = Some(now + delays.typing_delay(c));
                RenderStatus::Wrote(c)
            }
            None if self.source_closed => {
                self.finish(transcript);
                RenderStatus::Finished
            }
            None => RenderStatus::Waiting,
        }
    }

    /// Drops whatever is still queued and removes the cursor.
    pub fn abandon(&mut self, transcript: &mut Transcript) {
        if self.active {
            log::debug!("abandoning render with {} pending chars", self.pending.len());
            self.finish(transcript);
        }
    }

    fn finish(&mut self, transcript: &mut Transcript) {
        self.pending.clear();
        self.next_at = None;
        self.active = false;
        self.source_closed = false;
        transcript.finish_streaming();
    }
}
