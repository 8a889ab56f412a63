use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Npc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Speech,
    /// Transient "awaiting response" line, removed once the answer is known.
    Placeholder,
    /// Fixed apology shown after a failed call.
    Failure,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub sender: Sender,
    pub kind: MessageKind,
    pub text: String,
    pub streaming: bool,
    pub at: DateTime<Local>,
}

/// The visible chat history. Append-only, except for the placeholder and the
/// single message currently being typed.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    next_id: u64,
    revision: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Bumped on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn push_message(&mut self, sender: Sender, kind: MessageKind, text: String, streaming: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(Message {
            id,
            sender,
            kind,
            text,
            streaming,
            at: Local::now(),
        });
        self.revision += 1;
        id
    }

    pub fn push(&mut self, sender: Sender, kind: MessageKind, text: impl Into<String>) -> u64 {
        self.push_message(sender, kind, text.into(), false)
    }

    /// Only placeholders may be taken back out of the transcript.
    pub fn remove_placeholder(&mut self, id: u64) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|m| !(m.id == id && m.kind == MessageKind::Placeholder));
        let removed = self.messages.len() != before;
        if removed {
            self.revision += 1;
        }
        removed
    }

    pub fn begin_streaming(&mut self, sender: Sender) -> u64 {
        self.finish_streaming();
        self.push_message(sender, MessageKind::Speech, String::new(), true)
    }

    #[cfg(test)]
    pub fn streaming(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.streaming)
    }

    /// Appends to the message being typed. Returns false when nothing is streaming.
    pub fn append_char(&mut self, c: char) -> bool {
        match self.messages.iter_mut().rev().find(|m| m.streaming) {
            Some(message) => {
                message.text.push(c);
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    pub fn finish_streaming(&mut self) {
        let mut changed = false;
        for message in self.messages.iter_mut().filter(|m| m.streaming) {
            message.streaming = false;
            changed = true;
        }
        if changed {
            self.revision += 1;
        }
    }

    #[cfg(test)]
    pub fn count_kind(&self, kind: MessageKind) -> usize {
        self.messages.iter().filter(|m| m.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_placeholders_are_removable() {
        let mut transcript = Transcript::new();
        let user = transcript.push(Sender::User, MessageKind::Speech, "hi");
        let wait = transcript.push(Sender::Npc, MessageKind::Placeholder, "...");
        assert!(!transcript.remove_placeholder(user));
        assert!(transcript.remove_placeholder(wait));
        assert!(!transcript.remove_placeholder(wait));
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn streaming_appends_to_the_open_message() {
        let mut transcript = Transcript::new();
        assert!(!transcript.append_char('x'));
        transcript.begin_streaming(Sender::Npc);
        let rev = transcript.revision();
        assert!(transcript.append_char('o'));
        assert!(transcript.append_char('k'));
        assert!(transcript.revision() > rev);
        assert_eq!(transcript.streaming().map(|m| m.text.as_str()), Some("ok"));

        transcript.finish_streaming();
        assert!(transcript.streaming().is_none());
        assert_eq!(transcript.last().unwrap().text, "ok");
        assert!(!transcript.append_char('!'));
    }

    #[test]
    fn ids_are_unique_after_removal() {
        let mut transcript = Transcript::new();
        let a = transcript.push(Sender::Npc, MessageKind::Placeholder, "...");
        transcript.remove_placeholder(a);
        let b = transcript.push(Sender::User, MessageKind::Speech, "again");
        assert_ne!(a, b);
    }
}
