//! Outbound paths: the RPC dispatcher (correlation plane) and the event
//! dispatcher.

mod event;
mod rpc;

pub use self::event::EventDispatcher;
pub use self::rpc::RpcDispatcher;
