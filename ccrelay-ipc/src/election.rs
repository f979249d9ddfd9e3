//! Leader election (§4.I): a small state machine that decides whether this
//! instance serves the dataplane or follows another instance's lock, built
//! on top of the Unix-socket lock protocol and a status-endpoint probe.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::lock::{LockClient, LockMessage, ServerLockInfo};

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const BACKOFF_FACTOR: f64 = 1.5;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const JITTER_CAP: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const STALE_LOCK_MS: i64 = 10_000;
const MAX_BIND_FAILURES: u32 = 3;
const ELECTION_ATTEMPT_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Electing,
    Leader,
    LeaderActive,
    Follower,
    Waiting,
}

/// Advances the backoff delay by the configured factor, capped and jittered.
/// `seed` selects the jitter deterministically (callers pass a changing
/// value such as an attempt counter) since this crate carries no RNG
/// dependency of its own.
pub fn next_backoff(current: Duration, seed: u32) -> Duration {
    let scaled_ms = (current.as_millis() as f64 * BACKOFF_FACTOR) as u64;
    let capped = Duration::from_millis(scaled_ms).min(MAX_BACKOFF);
    let jitter_ms = (seed as u64 % (JITTER_CAP.as_millis() as u64 + 1)) as u64;
    capped + Duration::from_millis(jitter_ms)
}

/// Whether `lock` (as last observed) is stale relative to `now_ms`.
pub fn lock_is_stale(lock: &ServerLockInfo, now_ms: i64) -> bool {
    now_ms - lock.last_heartbeat > STALE_LOCK_MS
}

/// Drives the state machine described in §4.I. The HTTP probe and the lock
/// protocol calls are the only I/O; everything else is plain state.
pub struct LeaderElection {
    instance_id: String,
    pid: u32,
    port: u16,
    host: String,
    start_time: i64,
    lock: LockClient,
    http: reqwest::Client,
    state: Mutex<ElectionState>,
    bind_failures: AtomicU32,
}

impl LeaderElection {
    pub fn new(instance_id: String, pid: u32, port: u16, host: String, start_time: i64, lock: LockClient) -> Self {
        Self {
            instance_id,
            pid,
            port,
            host,
            start_time,
            lock,
            http: reqwest::Client::builder().timeout(Duration::from_secs(3)).build().unwrap_or_default(),
            state: Mutex::new(ElectionState::Idle),
            bind_failures: AtomicU32::new(0),
        }
    }

    pub async fn state(&self) -> ElectionState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: ElectionState) {
        *self.state.lock().await = next;
        tracing::debug!(?next, "election state transition");
    }

    pub fn record_bind_failure(&self) -> u32 {
        self.bind_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_bind_failures(&self) {
        self.bind_failures.store(0, Ordering::SeqCst);
    }

    pub fn bind_failures(&self) -> u32 {
        self.bind_failures.load(Ordering::SeqCst)
    }

    pub fn bind_failures_exhausted(&self) -> bool {
        self.bind_failures() >= MAX_BIND_FAILURES
    }

    /// Probes `GET {base_url}/ccrelay/api/status` for liveness. `base_url`
    /// is the current leader's advertised host/port.
    async fn probe_status(&self, base_url: &str) -> bool {
        let url = format!("{}/ccrelay/api/status", base_url.trim_end_matches('/'));
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Runs a single election attempt, capped at `ELECTION_ATTEMPT_CAP`.
    /// Returns the resulting state: `Leader`, `Follower`, or `Waiting` if
    /// the attempt timed out or bind failures are exhausted.
    pub async fn attempt(&self, now_ms: i64) -> ElectionState {
        self.set_state(ElectionState::Electing).await;
        match tokio::time::timeout(ELECTION_ATTEMPT_CAP, self.attempt_inner(now_ms)).await {
            Ok(state) => {
                self.set_state(state).await;
                state
            }
            Err(_) => {
                self.set_state(ElectionState::Waiting).await;
                ElectionState::Waiting
            }
        }
    }

    async fn attempt_inner(&self, now_ms: i64) -> ElectionState {
        if self.bind_failures_exhausted() {
            return ElectionState::Waiting;
        }

        let current = match self.lock.send(&LockMessage::Query).await {
            Ok(LockMessage::Response { lock }) => lock,
            _ => None,
        };

        if let Some(existing) = &current {
            if existing.instance_id != self.instance_id {
                let base_url = format!("http://{}:{}", existing.host, existing.port);
                if !lock_is_stale(existing, now_ms) {
                    if self.probe_status(&base_url).await {
                        return ElectionState::Follower;
                    }
                } else if self.probe_status(&base_url).await {
                    // Heartbeat is stale but the port still answers: a
                    // transient heartbeat stall, not a dead leader. Wait
                    // once and remain a follower rather than racing it
                    // for the lock.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    return ElectionState::Follower;
                }
            }
        }

        let reply = self
            .lock
            .send(&LockMessage::Acquire {
                instance_id: self.instance_id.clone(),
                pid: self.pid,
                port: self.port,
                host: self.host.clone(),
                start_time: self.start_time,
                last_heartbeat: now_ms,
            })
            .await;

        match reply {
            Ok(LockMessage::Response { lock: Some(lock) }) if lock.instance_id == self.instance_id => {
                self.reset_bind_failures();
                ElectionState::Leader
            }
            Ok(LockMessage::Response { lock: Some(_) }) => ElectionState::Follower,
            _ => {
                self.record_bind_failure();
                ElectionState::Waiting
            }
        }
    }

    pub async fn mark_active(&self) {
        self.set_state(ElectionState::LeaderActive).await;
    }

    /// Query the lock for the currently recorded leader, used by a
    /// follower to find the address to dial for the WebSocket fan-out.
    pub async fn current_leader(&self) -> Option<ServerLockInfo> {
        match self.lock.send(&LockMessage::Query).await {
            Ok(LockMessage::Response { lock }) => lock,
            _ => None,
        }
    }

    pub async fn heartbeat_once(&self, now_ms: i64) -> Result<(), String> {
        match self.lock.send(&LockMessage::Heartbeat { instance_id: self.instance_id.clone(), last_heartbeat: now_ms }).await {
            Ok(LockMessage::Response { .. }) => Ok(()),
            Ok(LockMessage::Error { message }) => Err(message),
            Ok(_) => Err("unexpected reply to heartbeat".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub async fn release(&self) {
        let _ = self.lock.send(&LockMessage::Release { instance_id: self.instance_id.clone() }).await;
        self.set_state(ElectionState::Idle).await;
    }

    pub fn heartbeat_interval(&self) -> Duration {
        HEARTBEAT_INTERVAL
    }
}

/// Runs the leader's periodic heartbeat loop until `shutdown` resolves, or
/// exits early (logged) if the lock server stops acknowledging us.
pub async fn run_heartbeat_loop(election: Arc<LeaderElection>, mut shutdown: tokio::sync::oneshot::Receiver<()>, now_ms_fn: impl Fn() -> i64) {
    let interval = election.heartbeat_interval();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = election.heartbeat_once(now_ms_fn()).await {
                    tracing::warn!(error = %e, "leader heartbeat rejected, stepping down");
                    break;
                }
            }
        }
    }
}

/// Computes a bounded, exponentially-backed-off delay sequence for probing
/// an existing leader before attempting a new election.
pub fn backoff_sequence(attempts: u32) -> Duration {
    let mut delay = INITIAL_BACKOFF;
    for seed in 0..attempts {
        delay = next_backoff(delay, seed);
    }
    delay
}
