//! Sandboxed recursive retrieval.
//!
//! A model answers a question by issuing commands from a closed set
//! (`read`, `search`, `list_by_tag`, `get_links`, `ask`, `final`), one JSON
//! object per turn. Three independent guards apply:
//!
//! - **Static validation**: instructions are checked against the allow-list
//!   before anything executes ([`parse_instruction`])
//! - **Restricted surface**: commands map onto read-only store helpers; there
//!   is no interpreter behind them
//! - **Resource bounds**: per-command and session timeouts, an iteration cap,
//!   a depth cap, a buffer cap and an optional cost budget ([`SandboxLimits`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_mem::sandbox::{Sandbox, SandboxLimits};
//!
//! let sandbox = Sandbox::new(cached_store, llm, SandboxLimits::default());
//! let outcome = sandbox.session(&identity).run("Which auth scheme do we use?").await;
//! println!("{:?}: {:?}", outcome.status, outcome.answer);
//! ```

mod command;
mod limits;
mod session;
mod trace;

pub use command::{parse_instruction, Command, Parsed, ALLOWED_OPS};
pub use limits::SandboxLimits;
pub use session::{
    CancelHandle, FailureReason, RetrievalSession, Sandbox, SessionOutcome, SessionState,
    SessionStatus, StepReply,
};
pub use trace::{SessionTrace, TraceEvent, TraceEventType};
