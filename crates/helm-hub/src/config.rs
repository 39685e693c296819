use std::collections::HashSet;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Bound on interrupting one session during [`shutdown`](crate::SessionHub::shutdown)
    /// and on waiting for a running turn in `delete_session`.
    pub shutdown_timeout: Duration,
    /// Tools whose calls are tracked as pending actions until answered.
    pub interactive_tools: HashSet<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            interactive_tools: ["AskUserQuestion", "ExitPlanMode"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
