pub mod api;
pub mod call;
pub mod chat;
pub mod client;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod events;
pub mod messages;
pub mod session;
pub mod stream;
pub mod transport;
pub mod widget;

// Re-export commonly used items for convenience
pub use client::EmbedClient;
pub use config::EmbedConfig;
pub use errors::{EmbedError, EmbedResult};
pub use events::{ClientEvent, EventKind, HandlerId};
pub use messages::{Message, MessageRole, TranscriptionEvent};
pub use session::{SessionMode, SessionState};
pub use transport::{AudioFrameInfo, AudioSink, NullSink};
pub use widget::{WidgetController, WidgetState};
