//! Core of the `pilot` coding-assistant agent: configuration, session
//! memory, the streaming observer, the transactional file applier, the
//! command runner, tool adapters and the per-turn orchestrator.

pub mod access;
pub mod client;
pub mod command_runner;
pub mod config;
pub mod context;
pub mod diff_log;
pub mod error;
pub mod event_bus;
pub mod interact;
pub mod json_repair;
pub mod mission;
pub mod observer;
pub mod orchestrator;
pub mod provider;
pub mod recovery;
pub mod secrets;
pub mod session;
pub mod task;
pub mod tools;

pub use config::ConfigShape;
pub use config::agent_home;
pub use context::RuntimeContext;
pub use error::AgentErr;
pub use error::Result;
pub use interact::AutoApprove;
pub use interact::GrantChoice;
pub use interact::UserInteraction;
pub use orchestrator::CommandDispatch;
pub use orchestrator::CommandRegistry;
pub use orchestrator::TurnArgs;
pub use orchestrator::TurnOutcome;
pub use orchestrator::run_turn;
