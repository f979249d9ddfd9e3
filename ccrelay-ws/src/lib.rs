pub mod client;
pub mod hub;
pub mod message;

pub use client::WsClient;
pub use hub::{ws_handler, Hub};
pub use message::WsMessage;
