//! Wire and data-model types shared between the agent core and its
//! front-ends: the model reply schema (with alias normalization), execution
//! events, session entries and command execution records.

mod events;
mod reply;
mod session;

pub use events::EventPhase;
pub use events::EventStatus;
pub use events::ExecutionEvent;
pub use reply::FindSymbolRequest;
pub use reply::McpCallRequest;
pub use reply::ModelReply;
pub use reply::PlanField;
pub use reply::TaskChange;
pub use reply::TaskCommand;
pub use reply::TerminalRequest;
pub use reply::WebSearchKind;
pub use reply::WebSearchRequest;
pub use reply::dedupe_changes;
pub use reply::normalize_reply;
pub use session::CommandExecutionRecord;
pub use session::Role;
pub use session::SessionEntry;
pub use session::SessionFile;
