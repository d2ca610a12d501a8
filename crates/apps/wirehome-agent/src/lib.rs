//! Wirehome device agent.
//!
//! Holds an outbound WebSocket to the cloud relay, authorizes with the
//! owner's credentials and answers the relay's requests: pings, tunneled
//! HTTP calls executed against the local API, and raw JSON requests routed
//! to registered [`handlers::RawHandler`]s.

pub mod agent;
pub mod config;
pub mod connect;
pub mod handlers;

pub use agent::{AgentError, AgentState, CloudAgent};
pub use config::AgentConfig;
pub use connect::{Connector, Transport, WebSocketConnector};
pub use handlers::{
    AgentRequestHandler, HandlerError, LocalHttpHandler, RawHandler, RawHandlerRegistry,
    ReqwestHttpHandler,
};
