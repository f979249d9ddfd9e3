pub mod error;
pub mod handlers;
pub mod persist;
pub mod server;
pub mod state;

pub use server::{build_router, cors_layer};
pub use state::AdminState;
