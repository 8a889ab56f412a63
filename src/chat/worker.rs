use std::{sync::Arc, time::Duration};

use super::im_channel::{EventTx, WorkerEvent};
use crate::sys::llm::{Backends, ChatSession, LlmError, PortraitGenerator, ProfileGenerator};

/// An external call requested by the session.
pub enum Job {
    Contact {
        prompt: String,
    },
    Turn {
        session: Arc<dyn ChatSession>,
        input: String,
        /// Simulated reading time before the request goes out.
        thinking: Duration,
    },
    Portrait {
        prompt: String,
    },
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Contact { prompt } => f.debug_struct("Contact").field("prompt", prompt).finish(),
            Job::Turn { input, thinking, .. } => f
                .debug_struct("Turn")
                .field("input", input)
                .field("thinking", thinking)
                .finish_non_exhaustive(),
            Job::Portrait { prompt } => f.debug_struct("Portrait").field("prompt", prompt).finish(),
        }
    }
}

/// Runs jobs and reports through the event channel.
pub struct Worker {
    profiles: Arc<dyn ProfileGenerator>,
    portraits: Arc<dyn PortraitGenerator>,
    tx: EventTx,
}

impl Worker {
    pub fn new(backends: &Backends, tx: EventTx) -> Self {
        Self {
            profiles: backends.profiles.clone(),
            portraits: backends.portraits.clone(),
            tx,
        }
    }

    /// Blocks until the job is done.
    pub fn execute(&self, job: Job) {
        match job {
            Job::Contact { prompt } => self.contact(&prompt),
            Job::Turn {
                session,
                input,
                thinking,
            } => self.turn(session.as_ref(), &input, thinking),
            Job::Portrait { prompt } => self.portrait(&prompt),
        }
    }

    /// Returns false once the UI has gone away.
    fn send(&self, event: WorkerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    fn contact(&self, prompt: &str) {
        log::info!("requesting npc profile");
        let event = match self.profiles.generate_profile(prompt) {
            Ok(profile) => {
                log::info!("contact with `{}`", profile.name);
                WorkerEvent::ProfileReady(profile)
            }
            Err(e) => {
                log::warn!("profile generation failed: {e}");
                WorkerEvent::ProfileFailed(e)
            }
        };
        self.send(event);
    }

    fn turn(&self, session: &dyn ChatSession, input: &str, thinking: Duration) {
        if !thinking.is_zero() {
            std::thread::sleep(thinking);
        }

        let stream = match session.send_message_stream(input) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("chat turn failed: {e}");
                self.send(WorkerEvent::TurnFailed(e));
                return;
            }
        };

        for chunk in stream {
            match chunk {
                Ok(chunk) if chunk.text.is_empty() => {}
                Ok(chunk) => {
                    if !self.send(WorkerEvent::Chunk(chunk.text)) {
                        log::debug!("ui closed, dropping the rest of the reply");
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("chat stream broke: {e}");
                    self.send(WorkerEvent::TurnFailed(e));
                    return;
                }
            }
        }
        self.send(WorkerEvent::TurnEnded);
    }

    fn portrait(&self, prompt: &str) {
        log::info!("requesting portrait");
        let result = self.portraits.generate_portrait(prompt).and_then(|portrait| {
            log::debug!(
                "portrait payload: {} bytes of {}",
                portrait.bytes.len(),
                portrait.mime_type
            );
            image::load_from_memory(&portrait.bytes)
                .map(|image| image.to_rgba8())
                .map_err(|e| LlmError::Decode(e.to_string()))
        });
        let event = match result {
            Ok(image) => WorkerEvent::PortraitReady(image),
            Err(e) => {
                log::warn!("portrait failed: {e}");
                WorkerEvent::PortraitFailed(e)
            }
        };
        self.send(event);
    }
}

pub trait JobRunner {
    fn run(&self, job: Job);
}

/// One OS thread per job; the portrait never waits on the text flow.
pub struct ThreadRunner {
    worker: Arc<Worker>,
}

impl ThreadRunner {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker: Arc::new(worker),
        }
    }
}

impl JobRunner for ThreadRunner {
    fn run(&self, job: Job) {
        let worker = self.worker.clone();
        log::debug!("spawning {job:?}");
        std::thread::spawn(move || worker.execute(job));
    }
}

/// Runs the job on the calling thread.
#[cfg(test)]
pub struct InlineRunner {
    pub worker: Worker,
}

#[cfg(test)]
impl JobRunner for InlineRunner {
    fn run(&self, job: Job) {
        self.worker.execute(job)
    }
}
