#![deny(unsafe_code)]

//! Chat thread display that streams agent output into rendered thread items.

/// Agent seam and the replay backend.
pub mod agent;
/// Streaming display with single-slot turn handling.
pub mod display;
pub mod error;
/// Typed agent events decoded at the stream boundary.
pub mod events;
pub mod page;
/// Markdown rendering and the code stylesheet.
pub mod render;
pub mod sender;
/// Thread storage and the event reducer.
pub mod thread;
pub mod thread_item;

pub use agent::{
    AgentEventStream, AgentRequest, AgentRunnable, BoxFuture, ReplayAgent, SessionId,
};
pub use display::{
    ChatDisplay, DisplayConfig, DisplaySnapshot, DisplayUpdate, RenderedItem, STATUS_CANCELLED,
    STATUS_IDLE, SubmitPolicy, TurnId,
};
pub use error::{BoxedError, ChatError, ChatResult};
pub use events::{AgentEvent, ContentPart};
pub use page::render_page;
pub use render::{CodeStylesheet, Renderer, close_unterminated_fence};
pub use sender::Sender;
pub use thread::{Thread, ThreadChange, ThreadReducer};
pub use thread_item::{AgentMessage, ItemKind, ThreadItem};
