use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::{MinerState, MinerStatus, WorkMode};

#[derive(Debug, Error)]
pub enum MinerClientError {
    #[error("i/o error talking to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("timed out talking to {addr}")]
    Timeout { addr: SocketAddr },
    #[error("malformed response from {addr}: {reason}")]
    Protocol { addr: SocketAddr, reason: String },
    #[error("{addr} rejected {command}: {reason}")]
    Rejected {
        addr: SocketAddr,
        command: String,
        reason: String,
    },
}

/// Remote miner operations. This is the seam the policy tests mock.
#[async_trait]
pub trait MinerControl: Send + Sync {
    async fn status(&self, addr: SocketAddr) -> Result<MinerStatus, MinerClientError>;
    async fn set_work_mode(&self, addr: SocketAddr, mode: WorkMode)
        -> Result<(), MinerClientError>;
    async fn standby(&self, addr: SocketAddr) -> Result<(), MinerClientError>;
    async fn wake(&self, addr: SocketAddr) -> Result<(), MinerClientError>;
}

/// JSON-over-TCP management client: one request/response per connection,
/// newline-delimited JSON, bounded by a socket timeout.
pub struct TcpMinerClient {
    timeout: Duration,
}

impl TcpMinerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn request(
        &self,
        addr: SocketAddr,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, MinerClientError> {
        let io_err = |source| MinerClientError::Io { addr, source };
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await.map_err(io_err)?;
            let mut payload = command.to_string();
            payload.push('\n');
            stream.write_all(payload.as_bytes()).await.map_err(io_err)?;

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.map_err(io_err)?;
            serde_json::from_slice(&response).map_err(|e| MinerClientError::Protocol {
                addr,
                reason: e.to_string(),
            })
        };
        timeout(self.timeout, exchange)
            .await
            .map_err(|_| MinerClientError::Timeout { addr })?
    }

    async fn command(&self, addr: SocketAddr, command: serde_json::Value) -> Result<(), MinerClientError> {
        let name = command["command"].as_str().unwrap_or("?").to_string();
        let response = self.request(addr, command).await?;
        let ack: CommandAck = serde_json::from_value(response).map_err(|e| {
            MinerClientError::Protocol {
                addr,
                reason: e.to_string(),
            }
        })?;
        if ack.result.as_deref() == Some("ok") {
            debug!(%addr, command = %name, "miner command acknowledged");
            Ok(())
        } else {
            Err(MinerClientError::Rejected {
                addr,
                command: name,
                reason: ack.error.unwrap_or_else(|| "no reason given".to_string()),
            })
        }
    }
}

#[async_trait]
impl MinerControl for TcpMinerClient {
    async fn status(&self, addr: SocketAddr) -> Result<MinerStatus, MinerClientError> {
        let response = self
            .request(addr, serde_json::json!({ "command": "status" }))
            .await?;
        let raw: RawStatus =
            serde_json::from_value(response).map_err(|e| MinerClientError::Protocol {
                addr,
                reason: e.to_string(),
            })?;
        Ok(MinerStatus {
            state: raw.state.parse().unwrap_or(MinerState::Other),
            work_mode: raw.mode.parse().unwrap_or(WorkMode::Eco),
            fan_r: raw.fan_r,
            board_temp_c: raw.board_temp,
            chip_temp_c: raw.chip_temp,
        })
    }

    async fn set_work_mode(
        &self,
        addr: SocketAddr,
        mode: WorkMode,
    ) -> Result<(), MinerClientError> {
        self.command(
            addr,
            serde_json::json!({ "command": "set_mode", "mode": mode.to_string() }),
        )
        .await
    }

    async fn standby(&self, addr: SocketAddr) -> Result<(), MinerClientError> {
        self.command(addr, serde_json::json!({ "command": "standby" }))
            .await
    }

    async fn wake(&self, addr: SocketAddr) -> Result<(), MinerClientError> {
        self.command(addr, serde_json::json!({ "command": "wakeup" }))
            .await
    }
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    state: String,
    mode: String,
    #[serde(default)]
    fan_r: f64,
    #[serde(default)]
    board_temp: f64,
    #[serde(default)]
    chip_temp: f64,
}

#[derive(Debug, Deserialize)]
struct CommandAck {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}
