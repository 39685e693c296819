//! Settings types. Field names are camelCase on disk and every section is
//! `#[serde(default)]`, so a partial file only overrides what it names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmSettings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub storage: StorageSettings,
    pub agent: AgentSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Largest accepted WebSocket frame, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 31822,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Per-session bound on interrupting a turn during shutdown.
    pub shutdown_timeout_ms: u64,
    /// Tool names whose calls wait for a user response.
    pub interactive_tools: Vec<String>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
            interactive_tools: vec!["AskUserQuestion".to_string(), "ExitPlanMode".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite file. A leading `~/` expands to `$HOME`.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "~/.helm/helm.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub binary: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub resume_flag: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            args: ["--print", "--input-format", "stream-json", "--output-format", "stream-json"]
                .into_iter()
                .map(String::from)
                .collect(),
            env: HashMap::new(),
            resume_flag: "--resume".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// One of trace, debug, info, warn, error.
    pub log_level: String,
    pub json: bool,
    /// Keep WARN+ records in `logs.db` next to the main database.
    pub persist_logs: bool,
    pub metrics_snapshot_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            persist_logs: true,
            metrics_snapshot_secs: 60,
            metrics_retention_days: 7,
        }
    }
}
