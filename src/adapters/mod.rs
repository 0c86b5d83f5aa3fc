pub mod http_client;
pub mod http_handler;
pub mod listener;
pub mod server;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
pub use http_handler::{FetchRequestPayload, FetchResponsePayload, HandlerError, HttpHandler};
pub use listener::GateListener;
pub use server::GatewayServer;
