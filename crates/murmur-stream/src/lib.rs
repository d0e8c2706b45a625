//! murmur-stream: resilient streaming sessions for assistant chat turns
//!
//! A [`StreamController`] opens one server-sent event stream per chat turn,
//! drives it through an explicit state machine, and reconnects with bounded
//! exponential backoff while keeping the text already received.

pub mod error;
pub mod events;
pub mod handle;
pub mod session;
pub mod transport;

pub use error::{Error, Failure, Result, StreamError};
pub use events::{SessionEvent, SessionEventKind, SessionHandler};
pub use handle::{SessionHandle, TextPolicy};
pub use session::{
    RetryConfig, SessionId, SessionSnapshot, SessionState, StreamConfig, StreamController,
};
pub use transport::{SseTransport, StreamRequest, StreamTransport, TransportEvent, TransportStream};
