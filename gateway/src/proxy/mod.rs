pub mod chain;
pub mod context;
pub mod fallback;
pub mod filter;
mod handler;

pub use chain::{FilterChain, Terminal};
pub use context::{BoxBody, RequestContext, ResponseContext};
pub use handler::handle_request;
