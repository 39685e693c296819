//! JSON-RPC over WebSocket front end for the session hub.

pub mod client;
pub mod compat;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use rpc::{RpcError, RpcRequest, RpcResponse};
pub use server::{start, ServerConfig, ServerHandle};
