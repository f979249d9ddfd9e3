pub mod executor;
pub mod pipeline;

pub use executor::{ProxyExecutor, SseSink, DEFAULT_PROXY_DEADLINE};
pub use pipeline::{handle_request, PipelineState};
