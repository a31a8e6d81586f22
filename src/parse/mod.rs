pub mod context;
pub mod dispatcher;
pub mod fallback;
pub mod protocol;
pub mod worker;

// Re-export common types
pub use context::{ContextHost, ContextPort, ParseContextManager, UnsupportedHost};
pub use dispatcher::{DispatchError, Dispatcher};
pub use protocol::RequestKind;
pub use worker::WorkerThreadHost;
