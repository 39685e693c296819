//! Agent gateways: a CLI subprocess speaking JSON lines, and a scripted
//! double for tests.

pub mod mock;
pub mod process;

pub use mock::{ScriptStep, ScriptedAgent, ScriptedResponse};
pub use process::{ProcessAgent, ProcessAgentConfig};
