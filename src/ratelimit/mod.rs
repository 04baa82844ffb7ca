//! Sliding-window admission control in front of an outbound sender.

mod context;
mod gate;
mod request;
mod sender;
mod window;

pub use context::{CallContext, ContextError};
pub use gate::Gate;
pub use request::build_request;
pub use sender::Sender;
pub use window::{GateConfig, SlidingWindow, WaitPolicy, MAX_INTERVAL_SECS, SEARCH_STEP_SECS};
