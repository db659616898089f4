//! Executes the actions an LLM conversation declares (file writes, shell
//! commands, dev servers, builds, tests) against a sandbox, and turns what
//! comes back into feedback for the next turn.

pub mod actions;
pub mod agents;
pub mod config;
pub mod events;
pub mod intelligence;
pub mod logging;
pub mod sandbox;
pub mod testing;

pub use actions::{Action, ActionDeclaration, ActionRunner, ActionStatus};
pub use agents::{SubagentManager, SubagentTask};
pub use config::RunnerConfig;
pub use events::{EventSink, RunnerEvent};
