//! Jupyter connection file format
//!
//! The connection file hands transport addressing to a launched kernel:
//! five channel ports, the bind address, and the HMAC key for message
//! signing.
//!
//! See <https://jupyter-client.readthedocs.io/en/stable/kernels.html#connection-files>.

use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

/// Transport addressing for a launched kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFile {
    /// Shell channel port (requests and replies)
    pub shell_port: u16,
    /// `IOPub` channel port (broadcast output and status)
    pub iopub_port: u16,
    /// Stdin channel port (input requests from the kernel)
    pub stdin_port: u16,
    /// Control channel port (interrupt and shutdown)
    pub control_port: u16,
    /// Heartbeat channel port (liveness echo)
    pub hb_port: u16,
    /// Address the kernel binds to
    pub ip: String,
    /// HMAC key for message signing (hex-encoded)
    pub key: String,
    /// Message signature scheme (always "hmac-sha256")
    pub signature_scheme: String,
    /// Transport protocol ("tcp" or "ipc")
    pub transport: String,
    /// Kernel name, for identification in runtime listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

impl ConnectionFile {
    /// Create a connection file for a local kernel with five freshly
    /// allocated TCP ports and a random 256-bit HMAC key
    ///
    /// # Errors
    ///
    /// Returns an error if free ports cannot be allocated.
    pub fn new_local(kernel_name: Option<String>) -> Result<Self> {
        let ports = allocate_free_ports(5)?;
        Ok(Self {
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            ip: "127.0.0.1".to_string(),
            key: generate_hmac_key(),
            signature_scheme: "hmac-sha256".to_string(),
            transport: "tcp".to_string(),
            kernel_name,
        })
    }

    /// Load a connection file from disk
    ///
    /// # Errors
    ///
    /// Returns `Parse` on malformed content and `Io` on read failure.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let connection: Self = serde_json::from_str(&content)
            .map_err(|error| HostError::parse(path, error.to_string()))?;
        connection.validate(path)?;
        Ok(connection)
    }

    /// Write the connection file to `path`
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|error| HostError::parse(path, error.to_string()))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Path for a fresh temp connection file for kernel `kernel_id`
    pub fn temp_path(kernel_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nbkernel-{kernel_id}.json"))
    }

    /// All five ports, in channel order
    pub const fn all_ports(&self) -> [u16; 5] {
        [
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.control_port,
            self.hb_port,
        ]
    }

    /// Validate port uniqueness, transport, scheme, and key encoding
    ///
    /// # Errors
    ///
    /// Returns `Parse` describing the first violated rule.
    pub fn validate(&self, origin: &Path) -> Result<()> {
        let ports = self.all_ports();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        if unique.len() != ports.len() {
            return Err(HostError::parse(origin, "duplicate channel ports"));
        }
        if ports.contains(&0) {
            return Err(HostError::parse(origin, "zero channel port"));
        }
        if self.transport != "tcp" && self.transport != "ipc" {
            return Err(HostError::parse(
                origin,
                format!("unsupported transport: {}", self.transport),
            ));
        }
        if self.signature_scheme != "hmac-sha256" {
            return Err(HostError::parse(
                origin,
                format!("unsupported signature scheme: {}", self.signature_scheme),
            ));
        }
        if hex::decode(&self.key).is_err() {
            return Err(HostError::parse(origin, "HMAC key is not valid hex"));
        }
        Ok(())
    }
}

/// Allocate `count` distinct free TCP ports on the loopback interface
///
/// Listeners stay bound until all ports are collected so the OS cannot hand
/// the same port out twice. The gap between release and kernel bind is
/// inherent to the protocol.
fn allocate_free_ports(count: usize) -> Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        ports.push(listener.local_addr()?.port());
        listeners.push(listener);
    }
    Ok(ports)
}

/// Generate a random HMAC key (32 bytes, hex-encoded)
fn generate_hmac_key() -> String {
    let key_bytes: [u8; 32] = rand::random();
    hex::encode(key_bytes)
}
