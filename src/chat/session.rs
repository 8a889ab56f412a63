//! The conversation as a whole: state machine, busy guard and the sequencing of
//! the three external calls.
//!
//! Everything here runs on the UI thread. External calls leave as [`Job`]s and
//! come back as [`WorkerEvent`]s; the session never blocks.

use std::{sync::Arc, time::Instant};

use image::RgbaImage;

use super::{
    im_channel::WorkerEvent,
    transcript::{MessageKind, Sender, Transcript},
    typing::{RenderStatus, TypingRenderer},
    worker::Job,
};
use crate::{
    delay::DelayModel,
    sys::{
        llm::{Backends, ChatBackend, ChatConfig, ChatSession, LlmError},
        prompt::PromptBook,
        NpcProfile,
    },
};

pub const PLACEHOLDER_TEXT: &str = "……（信号正沿着植物的根系传过去）";
pub const CONTACT_FAILED_TEXT: &str = "……信号在根须间消散了。植物安静下来，也许可以再试一次。";
pub const TURN_FAILED_TEXT: &str = "……（连接短暂中断，对方似乎没有听清。）";
pub const PORTRAIT_FAILED_CAPTION: &str = "影像无法穿越维度";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    AwaitingFirstContact,
    InDialogue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortraitState {
    Placeholder,
    Loading,
    Ready(RgbaImage),
    Failed { caption: &'static str },
}

/// What the busy flag is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Contact,
    FirstMessage,
    Turn { ended: bool, failed: bool },
}

pub struct Session {
    state: ConversationState,
    busy: bool,
    pending: Pending,
    placeholder: Option<u64>,

    profile: Option<NpcProfile>,
    chat: Option<Arc<dyn ChatSession>>,

    transcript: Transcript,
    renderer: TypingRenderer,
    delays: DelayModel,

    portrait: PortraitState,
    signal_visible: bool,

    prompts: PromptBook,
    chats: Arc<dyn ChatBackend>,
    chat_model: String,
}

impl Session {
    pub fn new(backends: &Backends, prompts: PromptBook, delays: DelayModel) -> Self {
        Self {
            state: ConversationState::AwaitingFirstContact,
            busy: false,
            pending: Pending::None,
            placeholder: None,
            profile: None,
            chat: None,
            transcript: Transcript::new(),
            renderer: TypingRenderer::new(),
            delays,
            portrait: PortraitState::Placeholder,
            signal_visible: true,
            prompts,
            chats: backends.chats.clone(),
            chat_model: backends.chat_model.clone(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn profile(&self) -> Option<&NpcProfile> {
        self.profile.as_ref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn portrait(&self) -> &PortraitState {
        &self.portrait
    }

    pub fn signal_visible(&self) -> bool {
        self.signal_visible
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.renderer.next_deadline()
    }

    /// Handles one user submission. Returns the job to run, if any.
    ///
    /// Submissions while busy are dropped without a trace; the input box is
    /// already disabled then.
    pub fn submit(&mut self, input: &str) -> Option<Job> {
        let input = input.trim();
        if self.busy {
            log::debug!("busy, submission ignored");
            return None;
        }
        if input.is_empty() {
            return None;
        }

        self.transcript.push(Sender::User, MessageKind::Speech, input);
        self.busy = true;

        match self.state {
            ConversationState::AwaitingFirstContact => self.establish_contact(input),
            ConversationState::InDialogue => self.continue_dialogue(input),
        }
    }

    fn establish_contact(&mut self, input: &str) -> Option<Job> {
        self.placeholder = Some(self.transcript.push(
            Sender::Npc,
            MessageKind::Placeholder,
            PLACEHOLDER_TEXT,
        ));

        match self.prompts.profile_prompt(input) {
            Ok(prompt) => {
                self.pending = Pending::Contact;
                Some(Job::Contact { prompt })
            }
            Err(e) => {
                self.contact_failed(&e);
                None
            }
        }
    }

    fn continue_dialogue(&mut self, input: &str) -> Option<Job> {
        let Some(session) = self.chat.clone() else {
            log::error!("in dialogue without a chat session");
            self.busy = false;
            return None;
        };
        let thinking = self.delays.thinking_delay(input.chars().count());
        log::debug!("thinking for {thinking:?}");
        self.pending = Pending::Turn {
            ended: false,
            failed: false,
        };
        Some(Job::Turn {
            session,
            input: input.to_string(),
            thinking,
        })
    }

    pub fn handle(&mut self, event: WorkerEvent) -> Option<Job> {
        match event {
            WorkerEvent::ProfileReady(profile) => self.on_profile(profile),
            WorkerEvent::ProfileFailed(e) => {
                if self.pending == Pending::Contact {
                    self.contact_failed(&e);
                }
                None
            }
            WorkerEvent::Chunk(text) => {
                self.on_chunk(&text);
                None
            }
            WorkerEvent::TurnEnded => {
                self.on_turn_end(false);
                None
            }
            WorkerEvent::TurnFailed(e) => {
                log::warn!("turn failed: {e}");
                self.on_turn_end(true);
                None
            }
            WorkerEvent::PortraitReady(image) => {
                log::info!("portrait {}x{}", image.width(), image.height());
                self.portrait = PortraitState::Ready(image);
                None
            }
            WorkerEvent::PortraitFailed(e) => {
                log::warn!("portrait unavailable: {e}");
                self.portrait = PortraitState::Failed {
                    caption: PORTRAIT_FAILED_CAPTION,
                };
                None
            }
        }
    }

    fn clear_placeholder(&mut self) {
        if let Some(id) = self.placeholder.take() {
            self.transcript.remove_placeholder(id);
        }
    }

    fn contact_failed(&mut self, e: &LlmError) {
        log::warn!("contact failed: {e}");
        self.clear_placeholder();
        self.transcript
            .push(Sender::Npc, MessageKind::Failure, CONTACT_FAILED_TEXT);
        self.pending = Pending::None;
        self.busy = false;
    }

    fn open_chat(&self, profile: &NpcProfile) -> Result<(Arc<dyn ChatSession>, String), LlmError> {
        let system_instruction = self.prompts.system_instruction(profile)?;
        let portrait_prompt = self.prompts.portrait_prompt(profile)?;
        let chat = self.chats.create(ChatConfig {
            model: self.chat_model.clone(),
            system_instruction,
        })?;
        Ok((chat, portrait_prompt))
    }

    fn on_profile(&mut self, profile: NpcProfile) -> Option<Job> {
        if self.pending != Pending::Contact || self.state != ConversationState::AwaitingFirstContact {
            log::warn!("unexpected profile `{}` ignored", profile.name);
            return None;
        }

        let (chat, portrait_prompt) = match self.open_chat(&profile) {
            Ok(opened) => opened,
            Err(e) => {
                self.contact_failed(&e);
                return None;
            }
        };

        self.clear_placeholder();
        self.chat = Some(chat);
        self.state = ConversationState::InDialogue;
        self.signal_visible = false;
        self.portrait = PortraitState::Loading;
        if profile.first_message.trim().is_empty() {
            log::warn!("`{}` has nothing to say yet", profile.name);
            self.pending = Pending::None;
            self.busy = false;
        } else {
            self.pending = Pending::FirstMessage;
            self.renderer
                .render_text(&mut self.transcript, Sender::Npc, &profile.first_message);
        }
        self.profile = Some(profile);
        log::info!("state -> {:?}", self.state);

        Some(Job::Portrait {
            prompt: portrait_prompt,
        })
    }

    fn on_chunk(&mut self, text: &str) {
        if !matches!(self.pending, Pending::Turn { ended: false, .. }) {
            log::warn!("stray chunk ignored");
            return;
        }
        if !self.renderer.is_active() {
            self.renderer.start(&mut self.transcript, Sender::Npc);
        }
        self.renderer.push_fragment(text);
    }

    fn on_turn_end(&mut self, failed: bool) {
        if !matches!(self.pending, Pending::Turn { ended: false, .. }) {
            return;
        }
        if self.renderer.is_active() {
            // busy clears once the rest of the reply has been typed out
            self.renderer.close();
            self.pending = Pending::Turn {
                ended: true,
                failed,
            };
        } else {
            self.finish_turn(failed);
        }
    }

    fn finish_turn(&mut self, failed: bool) {
        if failed {
            self.transcript
                .push(Sender::Npc, MessageKind::Failure, TURN_FAILED_TEXT);
        }
        self.pending = Pending::None;
        self.busy = false;
    }

    /// Advances the typing animation. Returns true when the transcript changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self
            .renderer
            .tick(now, &mut self.delays, &mut self.transcript)
        {
            RenderStatus::Idle | RenderStatus::Waiting => false,
            RenderStatus::Wrote(_) => true,
            RenderStatus::Finished => {
                match self.pending {
                    Pending::FirstMessage => {
                        self.pending = Pending::None;
                        self.busy = false;
                    }
                    Pending::Turn { failed, .. } => self.finish_turn(failed),
                    Pending::None | Pending::Contact => {}
                }
                true
            }
        }
    }

    /// Stops any render in progress. Called on the way out.
    pub fn shutdown(&mut self) {
        self.renderer.abandon(&mut self.transcript);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        chat::{
            im_channel::{self, EventRx},
            worker::{InlineRunner, JobRunner, Worker},
        },
        delay::DelayParameters,
        sys::llm::{ChatChunk, ChatStream, Portrait, PortraitGenerator, ProfileGenerator},
    };

    fn profile() -> NpcProfile {
        NpcProfile {
            name: "Vess".to_string(),
            personality: "curious, blunt".to_string(),
            backstory: "a glass-blower in a city of wind".to_string(),
            current_activity: "cooling a lens".to_string(),
            image_prompt: "a glass-blower with soot on her hands".to_string(),
            first_message: "谁在说话？".to_string(),
        }
    }

    #[derive(Default)]
    struct Counters {
        profile_calls: AtomicUsize,
        chats_created: AtomicUsize,
        sends: AtomicUsize,
        portraits: AtomicUsize,
    }

    struct MockBackend {
        counters: Arc<Counters>,
        profile: NpcProfile,
        prompts: Mutex<Vec<String>>,
        instructions: Mutex<Vec<String>>,
        fail_profile: bool,
        fail_portrait: bool,
        reply: Vec<&'static str>,
        break_after: Option<usize>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                counters: Arc::default(),
                profile: profile(),
                prompts: Mutex::default(),
                instructions: Mutex::default(),
                fail_profile: false,
                fail_portrait: false,
                reply: vec!["嗯，", "我听见了。"],
                break_after: None,
            }
        }
    }

    impl ProfileGenerator for MockBackend {
        fn generate_profile(&self, prompt: &str) -> Result<NpcProfile, LlmError> {
            self.counters.profile_calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail_profile {
                Err(LlmError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            } else {
                Ok(self.profile.clone())
            }
        }
    }

    struct MockChat {
        counters: Arc<Counters>,
        reply: Vec<&'static str>,
        break_after: Option<usize>,
    }

    impl ChatSession for MockChat {
        fn send_message_stream(&self, _text: &str) -> Result<ChatStream<'_>, LlmError> {
            self.counters.sends.fetch_add(1, Ordering::SeqCst);
            let mut items: Vec<Result<ChatChunk, LlmError>> = self
                .reply
                .iter()
                .map(|t| Ok(ChatChunk { text: t.to_string() }))
                .collect();
            if let Some(n) = self.break_after {
                items.truncate(n);
                items.push(Err(LlmError::Empty("stream cut".to_string())));
            }
            Ok(Box::new(items.into_iter()))
        }
    }

    impl ChatBackend for MockBackend {
        fn create(&self, config: ChatConfig) -> Result<Arc<dyn ChatSession>, LlmError> {
            self.counters.chats_created.fetch_add(1, Ordering::SeqCst);
            self.instructions
                .lock()
                .unwrap()
                .push(config.system_instruction);
            Ok(Arc::new(MockChat {
                counters: self.counters.clone(),
                reply: self.reply.clone(),
                break_after: self.break_after,
            }))
        }
    }

    impl PortraitGenerator for MockBackend {
        fn generate_portrait(&self, _prompt: &str) -> Result<Portrait, LlmError> {
            self.counters.portraits.fetch_add(1, Ordering::SeqCst);
            if self.fail_portrait {
                return Err(LlmError::Empty("filtered".to_string()));
            }
            let mut bytes = vec![];
            image::DynamicImage::ImageRgba8(RgbaImage::new(3, 4))
                .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
                .unwrap();
            Ok(Portrait {
                mime_type: "image/png".to_string(),
                bytes,
            })
        }
    }

    struct Harness {
        session: Session,
        runner: InlineRunner,
        rx: EventRx,
        backend: Arc<MockBackend>,
        now: Instant,
    }

    impl Harness {
        fn new(backend: MockBackend) -> Self {
            let instant = DelayParameters {
                thinking_base_ms: 0.0,
                thinking_per_char_ms: 0.0,
                thinking_spread_ms: 0.0,
                thinking_cap_ms: 0.0,
                ..Default::default()
            };
            Self::with_delays(backend, instant)
        }

        fn with_delays(backend: MockBackend, params: DelayParameters) -> Self {
            let backend = Arc::new(backend);
            let backends = Backends {
                profiles: backend.clone(),
                chats: backend.clone(),
                portraits: backend.clone(),
                chat_model: "test-model".to_string(),
            };
            let (tx, rx) = im_channel::channel();
            Self {
                session: Session::new(
                    &backends,
                    PromptBook::new().unwrap(),
                    DelayModel::with_seed(params, 99),
                ),
                runner: InlineRunner {
                    worker: Worker::new(&backends, tx),
                },
                rx,
                backend,
                now: Instant::now(),
            }
        }

        fn counters(&self) -> &Counters {
            &self.backend.counters
        }

        /// Submits and runs the resulting job plus anything it triggers.
        fn submit(&mut self, text: &str) -> bool {
            match self.session.submit(text) {
                Some(job) => {
                    self.runner.run(job);
                    self.pump();
                    true
                }
                None => false,
            }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                if let Some(job) = self.session.handle(event) {
                    self.runner.run(job);
                }
            }
        }

        fn tick(&mut self) -> bool {
            self.now += Duration::from_secs(1);
            self.session.tick(self.now)
        }

        /// Lets the typing animation run to the end.
        fn settle(&mut self) {
            for _ in 0..10_000 {
                self.tick();
                if self.session.next_deadline().is_none() {
                    return;
                }
            }
            panic!("render never finished");
        }

        fn texts(&self) -> Vec<String> {
            self.session
                .transcript()
                .messages()
                .iter()
                .map(|m| m.text.clone())
                .collect()
        }
    }

    #[test]
    fn first_contact_creates_profile_chat_and_types_first_message() {
        let mut h = Harness::new(MockBackend::new());
        assert_eq!(h.session.state(), ConversationState::AwaitingFirstContact);
        assert!(h.session.signal_visible());

        assert!(h.submit("你好"));
        assert_eq!(h.counters().profile_calls.load(Ordering::SeqCst), 1);
        assert!(h.backend.prompts.lock().unwrap()[0].contains("\"你好\""));
        assert_eq!(h.counters().chats_created.load(Ordering::SeqCst), 1);
        assert!(h.backend.instructions.lock().unwrap()[0].starts_with("You are Vess."));

        assert_eq!(h.session.state(), ConversationState::InDialogue);
        assert!(!h.session.signal_visible());
        assert_eq!(h.session.profile().map(|p| p.name.as_str()), Some("Vess"));
        assert_eq!(h.session.transcript().count_kind(MessageKind::Placeholder), 0);
        assert!(h.session.is_busy());

        // character by character
        assert!(h.tick());
        assert_eq!(h.session.transcript().streaming().unwrap().text, "谁");
        assert!(h.tick());
        assert_eq!(h.session.transcript().streaming().unwrap().text, "谁在");

        h.settle();
        assert_eq!(h.texts(), vec!["你好", "谁在说话？"]);
        assert!(h.session.transcript().streaming().is_none());
        assert!(!h.session.is_busy());
    }

    #[test]
    fn placeholder_is_shown_while_contact_is_pending() {
        let mut h = Harness::new(MockBackend::new());
        let job = h.session.submit("hello").unwrap();
        assert!(matches!(job, Job::Contact { .. }));
        assert_eq!(h.texts(), vec!["hello", PLACEHOLDER_TEXT]);
        assert!(h.session.is_busy());
    }

    #[test]
    fn portrait_is_fetched_alongside_the_first_message() {
        let mut h = Harness::new(MockBackend::new());
        h.submit("hi");
        assert_eq!(h.counters().portraits.load(Ordering::SeqCst), 1);
        match h.session.portrait() {
            PortraitState::Ready(image) => assert_eq!((image.width(), image.height()), (3, 4)),
            other => panic!("unexpected portrait state {other:?}"),
        }
    }

    #[test]
    fn portrait_failure_leaves_the_conversation_alone() {
        let mut h = Harness::new(MockBackend {
            fail_portrait: true,
            ..MockBackend::new()
        });
        h.submit("hi");
        assert_eq!(
            h.session.portrait(),
            &PortraitState::Failed {
                caption: PORTRAIT_FAILED_CAPTION
            }
        );
        assert_eq!(h.session.state(), ConversationState::InDialogue);
        h.settle();
        assert_eq!(h.session.transcript().count_kind(MessageKind::Failure), 0);
        assert!(!h.session.is_busy());
    }

    #[test]
    fn failed_profile_keeps_waiting_for_first_contact() {
        let mut h = Harness::new(MockBackend {
            fail_profile: true,
            ..MockBackend::new()
        });
        h.submit("你好");

        assert_eq!(h.session.transcript().count_kind(MessageKind::Failure), 1);
        assert_eq!(h.session.transcript().count_kind(MessageKind::Placeholder), 0);
        assert_eq!(h.texts(), vec!["你好", CONTACT_FAILED_TEXT]);
        assert_eq!(h.counters().chats_created.load(Ordering::SeqCst), 0);
        assert_eq!(h.counters().portraits.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state(), ConversationState::AwaitingFirstContact);
        assert!(h.session.profile().is_none());
        assert!(h.session.signal_visible());
        assert!(!h.session.is_busy());

        // the user may simply try again
        assert!(h.submit("还在吗"));
        assert_eq!(h.counters().profile_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn later_messages_reuse_the_chat_session() {
        let mut h = Harness::new(MockBackend::new());
        h.submit("你好");
        h.settle();

        assert!(h.submit("你是谁？"));
        assert_eq!(h.counters().sends.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters().profile_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters().chats_created.load(Ordering::SeqCst), 1);
        assert!(h.session.is_busy());
        h.settle();
        assert!(!h.session.is_busy());
        assert_eq!(h.texts().last().unwrap(), "嗯，我听见了。");

        assert!(h.submit("再见"));
        h.settle();
        assert_eq!(h.counters().sends.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters().chats_created.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), ConversationState::InDialogue);
    }

    #[test]
    fn busy_submissions_change_nothing() {
        let mut h = Harness::new(MockBackend::new());
        h.submit("你好");
        assert!(h.session.is_busy());
        let before = h.texts();
        let revision = h.session.transcript().revision();

        assert!(!h.submit("again"));
        assert_eq!(h.texts(), before);
        assert_eq!(h.session.transcript().revision(), revision);
        assert_eq!(h.counters().profile_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters().sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blank_input_is_ignored() {
        let mut h = Harness::new(MockBackend::new());
        assert!(!h.submit("   \n"));
        assert!(h.session.transcript().is_empty());
        assert!(!h.session.is_busy());
    }

    #[test]
    fn broken_stream_keeps_partial_text_then_apologises_once() {
        let mut h = Harness::new(MockBackend {
            break_after: Some(1),
            ..MockBackend::new()
        });
        h.submit("你好");
        h.settle();

        h.submit("说下去");
        assert!(h.session.is_busy());
        h.settle();

        let texts = h.texts();
        assert_eq!(texts[texts.len() - 2], "嗯，");
        assert_eq!(texts[texts.len() - 1], TURN_FAILED_TEXT);
        assert_eq!(h.session.transcript().count_kind(MessageKind::Failure), 1);
        assert_eq!(h.session.state(), ConversationState::InDialogue);
        assert!(!h.session.is_busy());
    }

    #[test]
    fn failed_request_apologises_immediately() {
        let mut h = Harness::new(MockBackend {
            break_after: Some(0),
            ..MockBackend::new()
        });
        h.submit("你好");
        h.settle();
        h.submit("喂？");

        assert!(!h.session.is_busy());
        assert_eq!(h.texts().last().unwrap(), TURN_FAILED_TEXT);
        assert_eq!(h.session.transcript().count_kind(MessageKind::Failure), 1);
    }

    #[test]
    fn empty_reply_just_clears_busy() {
        let mut h = Harness::new(MockBackend {
            reply: vec![],
            ..MockBackend::new()
        });
        h.submit("你好");
        h.settle();
        let count = h.session.transcript().len();
        h.submit("……");
        assert!(!h.session.is_busy());
        assert_eq!(h.session.transcript().len(), count + 1);
    }

    #[test]
    fn shutdown_removes_the_cursor() {
        let mut h = Harness::new(MockBackend::new());
        h.submit("你好");
        h.tick();
        h.session.shutdown();
        assert!(h.session.transcript().streaming().is_none());
    }

    #[test]
    fn thinking_time_follows_the_trimmed_input_length() {
        let params = DelayParameters {
            thinking_base_ms: 600.0,
            thinking_per_char_ms: 40.0,
            thinking_spread_ms: 0.0,
            thinking_cap_ms: 4000.0,
            ..Default::default()
        };
        let mut h = Harness::with_delays(MockBackend::new(), params);
        h.submit("你好");
        h.settle();

        match h.session.submit("  一二三四五 \n") {
            Some(Job::Turn { thinking, input, .. }) => {
                assert_eq!(input, "一二三四五");
                assert!((thinking.as_secs_f64() - 0.8).abs() < 1e-6, "{thinking:?}");
            }
            other => panic!("unexpected job {other:?}"),
        }
        // the request itself goes out from the worker
        assert_eq!(h.counters().sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_first_message_leaves_no_bubble() {
        let mut h = Harness::new(MockBackend {
            profile: NpcProfile {
                first_message: "  ".to_string(),
                ..profile()
            },
            ..MockBackend::new()
        });
        h.submit("你好");

        assert_eq!(h.texts(), vec!["你好"]);
        assert!(h.session.next_deadline().is_none());
        assert!(!h.session.is_busy());
        assert_eq!(h.session.state(), ConversationState::InDialogue);
        assert_eq!(h.counters().portraits.load(Ordering::SeqCst), 1);

        assert!(h.submit("还在吗"));
        assert_eq!(h.counters().sends.load(Ordering::SeqCst), 1);
    }
}
