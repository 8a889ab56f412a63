pub mod im_channel;
pub mod session;
pub mod transcript;
pub mod typing;
pub mod worker;

pub use session::{ConversationState, PortraitState, Session};
