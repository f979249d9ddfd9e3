pub mod embedded;
pub mod model;
pub mod sqlite;
pub mod store;
pub mod writer;

pub use model::{CompletedUpdate, LogFilter, LogStats, LogStatus, RequestLog, RouteType};
pub use store::LogStore;
pub use writer::{open_backend, Logger};
