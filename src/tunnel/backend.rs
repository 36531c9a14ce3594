//! Tunnel backends: the component that actually configures peers on the
//! tunnel interface.

use crate::tunnel::PeerKey;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Tunnel backend timed out")]
    Timeout,

    #[error("Tunnel backend rejected the change: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Allow `key` to use exactly `address`.
    async fn add_peer(&self, key: &PeerKey, address: Ipv4Addr) -> Result<(), BackendError>;

    async fn remove_peer(&self, key: &PeerKey) -> Result<(), BackendError>;
}

/// Drives a WireGuard interface through the `wg` tool.
#[derive(Debug, Clone)]
pub struct WgBackend {
    program: String,
    interface: String,
}

impl WgBackend {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            program: "wg".to_string(),
            interface: interface.into(),
        }
    }

    /// Use a different executable, e.g. a wrapper that adds `sudo`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn add_args(&self, key: &PeerKey, address: Ipv4Addr) -> Vec<String> {
        vec![
            "set".to_string(),
            self.interface.clone(),
            "peer".to_string(),
            key.to_string(),
            "allowed-ips".to_string(),
            format!("{}/32", address),
        ]
    }

    fn remove_args(&self, key: &PeerKey) -> Vec<String> {
        vec![
            "set".to_string(),
            self.interface.clone(),
            "peer".to_string(),
            key.to_string(),
            "remove".to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<(), BackendError> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!("Running {}", command);
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackendError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(BackendError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelBackend for WgBackend {
    async fn add_peer(&self, key: &PeerKey, address: Ipv4Addr) -> Result<(), BackendError> {
        self.run(self.add_args(key, address)).await
    }

    async fn remove_peer(&self, key: &PeerKey) -> Result<(), BackendError> {
        self.run(self.remove_args(key)).await
    }
}

/// Keeps peers in memory. Used for tests and development without a tunnel
/// interface; failures can be injected.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    peers: Mutex<HashMap<PeerKey, Ipv4Addr>>,
    fail_adds: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerKey, Ipv4Addr>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn peer_address(&self, key: &PeerKey) -> Option<Ipv4Addr> {
        self.lock().get(key).copied()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl TunnelBackend for MemoryBackend {
    async fn add_peer(&self, key: &PeerKey, address: Ipv4Addr) -> Result<(), BackendError> {
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!("add {}", key)));
        }
        let mut peers = self.lock();
        // An allowed-ip belongs to one peer at a time.
        peers.retain(|_, a| *a != address);
        peers.insert(key.clone(), address);
        Ok(())
    }

    async fn remove_peer(&self, key: &PeerKey) -> Result<(), BackendError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!("remove {}", key)));
        }
        self.lock().remove(key);
        Ok(())
    }
}
