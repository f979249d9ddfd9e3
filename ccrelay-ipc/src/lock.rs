//! The cross-process server lock (§4.H): first-to-bind becomes the lock
//! server over a Unix domain socket, a line-delimited JSON protocol.
//!
//! POSIX only — this expansion implements `tokio::net::UnixListener`/
//! `UnixStream`; a Windows named-pipe variant is an open platform target
//! with no crate anywhere in the grounding corpus to build it from.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub const HEARTBEAT_TIMEOUT_MS: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerLockInfo {
    pub instance_id: String,
    pub pid: u32,
    pub port: u16,
    pub host: String,
    pub start_time: i64,
    pub last_heartbeat: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockMessage {
    Query,
    Acquire {
        instance_id: String,
        pid: u32,
        port: u16,
        host: String,
        start_time: i64,
        last_heartbeat: i64,
    },
    Heartbeat {
        instance_id: String,
        last_heartbeat: i64,
    },
    Release {
        instance_id: String,
    },
    Response {
        lock: Option<ServerLockInfo>,
    },
    Error {
        message: String,
    },
}

pub fn default_socket_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ccrelay").join("ccrelay-lock.sock")
}

/// The lock-server side: one process-wide `Option<ServerLockInfo>`
/// guarded by the protocol rules in §4.H.
pub struct LockServer {
    state: Mutex<Option<ServerLockInfo>>,
}

impl Default for LockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LockServer {
    pub fn new() -> Self {
        Self { state: Mutex::new(None) }
    }

    pub fn handle_message(&self, msg: LockMessage) -> LockMessage {
        let mut guard = self.state.lock().unwrap();
        match msg {
            LockMessage::Query => LockMessage::Response { lock: guard.clone() },
            LockMessage::Acquire { instance_id, pid, port, host, start_time, last_heartbeat } => {
                let should_replace = match &*guard {
                    None => true,
                    Some(current) => last_heartbeat - current.last_heartbeat > HEARTBEAT_TIMEOUT_MS,
                };
                if should_replace {
                    *guard = Some(ServerLockInfo { instance_id, pid, port, host, start_time, last_heartbeat });
                }
                LockMessage::Response { lock: guard.clone() }
            }
            LockMessage::Heartbeat { instance_id, last_heartbeat } => match &mut *guard {
                Some(current) if current.instance_id == instance_id => {
                    current.last_heartbeat = last_heartbeat;
                    LockMessage::Response { lock: Some(current.clone()) }
                }
                _ => LockMessage::Error { message: "caller is not the current leader".to_string() },
            },
            LockMessage::Release { instance_id } => {
                if matches!(&*guard, Some(current) if current.instance_id == instance_id) {
                    *guard = None;
                }
                LockMessage::Response { lock: guard.clone() }
            }
            LockMessage::Response { .. } | LockMessage::Error { .. } => {
                LockMessage::Error { message: "unexpected message on server side".to_string() }
            }
        }
    }

    pub fn spawn_accept_loop(self: Arc<Self>, listener: UnixListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(stream).await {
                                tracing::debug!(error = %e, "lock connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lock socket accept failed");
                        break;
                    }
                }
            }
        });
    }

    async fn serve_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let Ok(msg) = serde_json::from_str::<LockMessage>(&line) else { continue };
            let reply = self.handle_message(msg);
            let mut out = serde_json::to_string(&reply).unwrap_or_default();
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }
}

/// The lock-client side used by both followers and the leader's own
/// heartbeat loop.
pub struct LockClient {
    path: PathBuf,
}

impl LockClient {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn send(&self, msg: &LockMessage) -> std::io::Result<LockMessage> {
        let stream = UnixStream::connect(&self.path).await?;
        let (reader, mut writer) = stream.into_split();
        let mut line = serde_json::to_string(msg).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        let mut lines = BufReader::new(reader).lines();
        let response = lines
            .next_line()
            .await?
            .ok_or_else(|| std::io::Error::other("lock server closed without responding"))?;
        serde_json::from_str(&response).map_err(std::io::Error::other)
    }

    pub async fn probe(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.send(&LockMessage::Query))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

pub enum LockRole {
    Server(UnixListener, Arc<LockServer>),
    Client(LockClient),
}

/// §4.H "Client recovery": probe an existing socket file; if it is stale
/// (exists but nothing answers within the probe timeout) remove it and
/// bind as the server ourselves.
pub async fn bind_or_connect(path: PathBuf, probe_timeout: Duration) -> std::io::Result<LockRole> {
    if path.exists() {
        let client = LockClient::new(path.clone());
        if client.probe(probe_timeout).await {
            return Ok(LockRole::Client(client));
        }
        let _ = std::fs::remove_file(&path);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match UnixListener::bind(&path) {
        Ok(listener) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(LockRole::Server(listener, Arc::new(LockServer::new())))
        }
        Err(_) => Ok(LockRole::Client(LockClient::new(path))),
    }
}

#[allow(dead_code)]
fn _assert_path_type(_p: &Path) {}
