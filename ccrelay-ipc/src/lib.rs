pub mod election;
pub mod lock;

pub use election::{backoff_sequence, run_heartbeat_loop, ElectionState, LeaderElection};
pub use lock::{bind_or_connect, default_socket_path, LockClient, LockMessage, LockRole, LockServer, ServerLockInfo};
