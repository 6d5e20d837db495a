//! Wire protocol for the container manager.
//!
//! One TCP connection, newline-delimited JSON frames. The first client
//! frame selects the mode: `create` upgrades the connection to a Run
//! session (bidirectional streaming), any other request gets a single
//! response and the connection closes.
//!
//! Within a Run session the server guarantees that `created` is the first
//! frame and `exit` the last; binary payloads (stdout/stderr/stdin) travel
//! base64-encoded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runner::spec::ImageSpec;

// =============================================================================
// Client Frames
// =============================================================================

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Open a Run session. Must be the first frame of the connection.
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        config: WorkloadSpec,
    },
    /// Forward bytes to the workload's stdin (base64).
    Stdin { data: String },
    /// Stop accepting stdin.
    CloseStdin,
    /// Liveness ping; required at least every 30 seconds.
    Heartbeat,
    /// Stop the workload.
    Terminate {
        #[serde(default)]
        force: bool,
        #[serde(default)]
        timeout_secs: u32,
    },

    // Unary surface.
    ListContainers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    GetContainerStatus { container_id: String },
    Health,
    GetNodeResources,
    GetAvailableImages,
}

/// A workload creation request as the client states it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub image_spec: Option<ImageSpec>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<i64>,
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

/// Per-workload resource caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Client-side network settings, lowered into the runner's policy tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<String>,
    #[serde(default)]
    pub rules: Vec<NetworkRuleSpec>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// One allow/deny rule with an optional port range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRuleSpec {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_end: Option<u32>,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Server Frames
// =============================================================================

/// Transport-level status carried on `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    ResourceExhausted,
    DeadlineExceeded,
    Internal,
}

/// Workload lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadState {
    Created,
    Running,
    Exited,
    Failed,
    Terminated,
}

impl WorkloadState {
    /// Terminal states carry an exit code and a cleanup deadline.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Failed | Self::Terminated)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame of every Run session.
    Created {
        container_id: String,
        state: WorkloadState,
    },
    /// Workload stdout (base64).
    Stdout { data: String },
    /// Workload stderr (base64).
    Stderr { data: String },
    /// A structured runner event, forwarded verbatim.
    Message { json: String },
    /// Terminal frame of every Run session.
    Exit { exit_code: i32, timestamp: i64 },
    /// Stream failure with a transport status.
    Error { code: StatusCode, message: String },

    // Unary responses.
    Containers { containers: Vec<WorkloadInfo> },
    Status {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<WorkloadStatus>,
    },
    Health {
        healthy: bool,
        version: String,
        running_containers: u32,
        total_containers: u32,
    },
    NodeResources {
        success: bool,
        resources: NodeResources,
    },
    Images {
        success: bool,
        #[serde(default)]
        images: Vec<ImageInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerFrame {
    /// Serializes to a JSON line with trailing newline.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        let mut json = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"internal","message":"serialization failed"}"#.to_string()
        });
        json.push('\n');
        json
    }

    /// Builds an error frame.
    #[must_use]
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Listing entry for one workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub container_id: String,
    pub state: WorkloadState,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Full status of one workload. Credentials never appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub container_id: String,
    pub state: WorkloadState,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_after: Option<i64>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Host capacity snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu_cores: u32,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub memory_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
    pub disk_used_bytes: u64,
    pub running_containers: u32,
    pub total_containers: u32,
}

/// One locally-available image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub created: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_frame_roundtrip() {
        let json = r#"{"type":"create","config":{"image_spec":{"image":"alpine:latest"},"command":["echo","hello"]}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Create { container_id, config } => {
                assert!(container_id.is_none());
                assert_eq!(config.image_spec.unwrap().image, "alpine:latest");
                assert_eq!(config.command, vec!["echo", "hello"]);
                assert!(config.cleanup);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_and_terminate_parse() {
        let hb: ClientFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(hb, ClientFrame::Heartbeat));

        let term: ClientFrame =
            serde_json::from_str(r#"{"type":"terminate","force":true}"#).unwrap();
        match term {
            ClientFrame::Terminate { force, timeout_secs } => {
                assert!(force);
                assert_eq!(timeout_secs, 0);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn workload_states_serialize_upper() {
        let json = serde_json::to_string(&WorkloadState::Running).unwrap();
        assert_eq!(json, r#""RUNNING""#);
        assert!(WorkloadState::Failed.is_terminal());
        assert!(!WorkloadState::Running.is_terminal());
    }

    #[test]
    fn server_frames_are_tagged_lines() {
        let frame = ServerFrame::Exit {
            exit_code: 0,
            timestamp: 1_700_000_000,
        };
        let line = frame.to_json_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""type":"exit""#));

        let err = ServerFrame::error(StatusCode::DeadlineExceeded, "heartbeat timeout");
        assert!(err.to_json_line().contains(r#""code":"deadline_exceeded""#));
    }
}
