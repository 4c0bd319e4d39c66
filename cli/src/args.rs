mod auth;
mod connection;
mod execution;
mod global;
mod proxy;

pub use auth::AuthArgs;
pub use connection::ConnectionArgs;
pub use execution::ExecutionArgs;
pub use global::GlobalArgs;
pub use proxy::ProxyArgs;
