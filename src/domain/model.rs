use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::config::TlsConfig;

/// Port the web process listens on inside its container.
pub const WEB_PROCESS_DEFAULT_PORT: u16 = 8888;
pub const WEB_PROCESS_NAME: &str = "web";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub name: String,
    pub platform: String,
    pub pool: String,
    pub deploys: u64,
    #[serde(rename = "updatePlatform")]
    pub update_platform: bool,
    pub token: String,
    pub env: BTreeMap<String, String>,
    pub router: String,
    #[serde(rename = "routerType")]
    pub router_type: String,
    pub volumes: Vec<Mount>,
}

impl App {
    pub fn new(name: &str, platform: &str) -> Self {
        Self {
            name: name.to_string(),
            platform: platform.to_string(),
            ..Default::default()
        }
    }
}

/// Versioned image list shared by app, builder and platform histories.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageHistory {
    pub name: String,
    pub count: u64,
    pub images: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProcessCommand {
    Single(String),
    List(Vec<String>),
}

impl ProcessCommand {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ProcessCommand::Single(cmd) => vec![cmd.clone()],
            ProcessCommand::List(cmds) => cmds.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Healthcheck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(
        alias = "allowedFailures",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_failures: Option<u32>,
    #[serde(alias = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestartHooks {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Hooks {
    pub restart: RestartHooks,
    pub build: Vec<String>,
}

/// Platform authored image descriptor. Known keys are typed, anything else is
/// kept in `extra` and written back untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CustomData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procfile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<BTreeMap<String, ProcessCommand>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(rename = "exposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CustomData {
    pub fn is_empty(&self) -> bool {
        *self == CustomData::default()
    }

    pub fn restart_before_hooks(&self) -> &[String] {
        self.hooks
            .as_ref()
            .map(|hooks| hooks.restart.before.as_slice())
            .unwrap_or_default()
    }

    pub fn restart_after_hooks(&self) -> &[String] {
        self.hooks
            .as_ref()
            .map(|hooks| hooks.restart.after.as_slice())
            .unwrap_or_default()
    }
}

/// Stored descriptor of one image identifier.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageMetadata {
    #[serde(rename = "_id")]
    pub name: String,
    #[serde(rename = "exposedports")]
    pub exposed_ports: Vec<String>,
    #[serde(rename = "exposedport", skip_serializing_if = "Option::is_none")]
    pub legacy_exposed_port: Option<String>,
    #[serde(deserialize_with = "deserialize_processes")]
    pub processes: BTreeMap<String, Vec<String>>,
    #[serde(rename = "customdata")]
    pub custom_data: CustomData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub disabled: bool,
}

impl ImageMetadata {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Legacy images have no process table and run through the start binary.
    pub fn is_legacy(&self) -> bool {
        self.processes.is_empty()
    }
}

fn deserialize_processes<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, ProcessCommand>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, cmd)| (name, cmd.to_vec()))
        .collect())
}

/// Persisted set of known swarm managers.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerRecord {
    pub addresses: Vec<String>,
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthConfig {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestartCondition {
    #[default]
    Any,
    None,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub replicas: u64,
    pub constraints: Vec<String>,
    pub health_check: Option<HealthConfig>,
    /// Target port published through a VIP endpoint.
    pub endpoint_port: Option<u16>,
    pub networks: Vec<String>,
    pub mounts: Vec<Mount>,
    pub restart_condition: RestartCondition,
    pub log_driver: Option<String>,
    pub user: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub version: u64,
    pub spec: ServiceSpec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    New,
    Allocated,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Allocated => "allocated",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Ready => "ready",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Shutdown => "shutdown",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Remove => "remove",
            TaskState::Orphaned => "orphaned",
        }
    }

    pub fn parse(value: &str) -> Option<TaskState> {
        Some(match value {
            "new" => TaskState::New,
            "allocated" => TaskState::Allocated,
            "pending" => TaskState::Pending,
            "assigned" => TaskState::Assigned,
            "accepted" => TaskState::Accepted,
            "preparing" => TaskState::Preparing,
            "ready" => TaskState::Ready,
            "starting" => TaskState::Starting,
            "running" => TaskState::Running,
            "complete" => TaskState::Complete,
            "shutdown" => TaskState::Shutdown,
            "failed" => TaskState::Failed,
            "rejected" => TaskState::Rejected,
            "remove" => TaskState::Remove,
            "orphaned" => TaskState::Orphaned,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub service_id: String,
    pub node_id: String,
    pub state: TaskState,
    pub desired_state: TaskState,
    pub message: String,
    pub err: String,
    pub container_id: Option<String>,
    pub exit_code: Option<i64>,
}

impl Task {
    pub fn status_message(&self) -> String {
        format!(
            "state: {:?}, err: {:?}, msg: {:?}, container exit: {:?}",
            self.state.as_str(),
            self.err,
            self.message,
            self.exit_code.map(|code| code.to_string()).unwrap_or_default()
        )
    }
}

/// One-shot container used by builds and metadata extraction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub exit_code: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub exposed_ports: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub addr: String,
    pub manager: bool,
    pub labels: BTreeMap<String, String>,
}
