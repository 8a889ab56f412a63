use image::RgbaImage;

use crate::sys::{llm::LlmError, NpcProfile};

/// What background jobs report back to the UI thread.
#[derive(Debug)]
pub enum WorkerEvent {
    ProfileReady(NpcProfile),
    ProfileFailed(LlmError),

    Chunk(String),
    TurnEnded,
    TurnFailed(LlmError),

    PortraitReady(RgbaImage),
    PortraitFailed(LlmError),
}

pub type EventTx = crossbeam::channel::Sender<WorkerEvent>;
pub type EventRx = crossbeam::channel::Receiver<WorkerEvent>;

pub fn channel() -> (EventTx, EventRx) {
    crossbeam::channel::unbounded()
}
