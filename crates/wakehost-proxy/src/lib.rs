pub mod admin;
pub mod backend;
pub mod handler;
pub mod proxy;
pub mod wstunnel;

pub use backend::{Backend, BackendTable};
pub use handler::ProxyError;
pub use proxy::Proxy;
