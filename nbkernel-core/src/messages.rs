//! Wire message model and session status
//!
//! The host treats wire framing (signing, multipart layout) as external;
//! what crosses the `WireConnection` trait is this typed message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire protocol version spoken with kernels
pub const PROTOCOL_VERSION: &str = "5.3";

/// Channel a message travels on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Requests and replies
    Shell,
    /// Broadcast output, stream data, and status
    Iopub,
    /// Input requests from the kernel
    Stdin,
    /// Interrupt and shutdown
    Control,
    /// Liveness echo
    Heartbeat,
}

impl Channel {
    /// Channel name as it appears on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Iopub => "iopub",
            Self::Stdin => "stdin",
            Self::Control => "control",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header common to every wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message id
    pub msg_id: String,
    /// Message type (e.g. `execute_request`, `status`)
    pub msg_type: String,
    /// Client session id
    pub session: String,
    /// Originating username
    pub username: String,
    /// Creation timestamp
    pub date: DateTime<Utc>,
    /// Protocol version
    pub version: String,
}

impl MessageHeader {
    /// Create a header for a new message in `session`
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            username: "nbkernel".to_string(),
            date: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One typed message crossing the wire seam
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message header
    pub header: MessageHeader,
    /// Header of the request this message answers, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_header: Option<MessageHeader>,
    /// Message content, shape determined by `header.msg_type`
    pub content: serde_json::Value,
    /// Channel the message travels on
    pub channel: Channel,
}

impl WireMessage {
    /// Build a request message for `channel` in `session`
    pub fn request(
        msg_type: impl Into<String>,
        content: serde_json::Value,
        session: impl Into<String>,
        channel: Channel,
    ) -> Self {
        Self {
            header: MessageHeader::new(msg_type, session),
            parent_header: None,
            content,
            channel,
        }
    }

    /// Build a reply to `parent` with the given type and content
    pub fn reply_to(
        parent: &Self,
        msg_type: impl Into<String>,
        content: serde_json::Value,
        channel: Channel,
    ) -> Self {
        Self {
            header: MessageHeader::new(msg_type, parent.header.session.clone()),
            parent_header: Some(parent.header.clone()),
            content,
            channel,
        }
    }

    /// Message id of the request this message answers
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|header| header.msg_id.as_str())
    }

    /// Execution state carried by an `IOPub` status message, when this is one
    pub fn execution_state(&self) -> Option<ExecutionState> {
        if self.channel != Channel::Iopub || self.header.msg_type != "status" {
            return None;
        }
        match self.content.get("execution_state").and_then(|value| value.as_str()) {
            Some("starting") => Some(ExecutionState::Starting),
            Some("idle") => Some(ExecutionState::Idle),
            Some("busy") => Some(ExecutionState::Busy),
            _ => None,
        }
    }
}

/// Execution state published by kernels on `IOPub`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    /// Kernel is starting up
    Starting,
    /// Kernel is ready for requests
    Idle,
    /// Kernel is executing
    Busy,
}

/// Lifecycle status of a session
///
/// `Dead` is terminal; a session never leaves it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    /// No connection attempt yet
    #[default]
    Unknown,
    /// Launch and startup probe in progress
    Starting,
    /// Kernel ready for requests
    Idle,
    /// Kernel executing
    Busy,
    /// Process exit observed; shutdown in progress
    Terminating,
    /// Session disposed; all operations fail
    Dead,
}

impl KernelStatus {
    /// True for the terminal state
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dead)
    }

    /// True while the kernel can accept requests
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header() {
        let message = WireMessage::request(
            "kernel_info_request",
            serde_json::json!({}),
            "session-1",
            Channel::Shell,
        );
        assert_eq!(message.header.msg_type, "kernel_info_request");
        assert_eq!(message.header.session, "session-1");
        assert_eq!(message.header.version, PROTOCOL_VERSION);
        assert!(message.parent_header.is_none());
    }

    #[test]
    fn test_reply_links_parent() {
        let request = WireMessage::request(
            "execute_request",
            serde_json::json!({"code": "1 + 1"}),
            "session-1",
            Channel::Shell,
        );
        let reply = WireMessage::reply_to(
            &request,
            "execute_reply",
            serde_json::json!({"status": "ok"}),
            Channel::Shell,
        );
        assert_eq!(reply.parent_msg_id(), Some(request.header.msg_id.as_str()));
        assert_eq!(reply.header.session, "session-1");
    }

    #[test]
    fn test_execution_state_parsing() {
        let mut status = WireMessage::request(
            "status",
            serde_json::json!({"execution_state": "idle"}),
            "session-1",
            Channel::Iopub,
        );
        assert_eq!(status.execution_state(), Some(ExecutionState::Idle));

        status.content = serde_json::json!({"execution_state": "busy"});
        assert_eq!(status.execution_state(), Some(ExecutionState::Busy));

        // Non-status and non-iopub messages carry no state
        status.header.msg_type = "stream".to_string();
        assert_eq!(status.execution_state(), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(KernelStatus::Dead.is_terminal());
        assert!(!KernelStatus::Terminating.is_terminal());
        assert!(KernelStatus::Idle.is_connected());
        assert!(KernelStatus::Busy.is_connected());
        assert!(!KernelStatus::Starting.is_connected());
    }
}
