//! WsRPC 服务器模块
//!
//! 核心链路：传输 -> 解析 -> 批次 -> 派发器 -> 处理器 -> 响应通道 ->
//! 派发器 -> 命令通道 -> 传输写出

pub mod channel;
pub mod config;
pub mod connection_manager;
pub mod context;
pub mod dispatcher;
pub mod header;
pub mod long_poll;
pub mod middleware;
pub mod models;
pub mod registry;
pub mod router;
pub mod ws_transport;

pub use channel::{CommandChannel, ResponseChannel};
pub use config::ServerConfig;
pub use context::{JobContext, TransportMeta};
pub use header::{HeaderValue, Headers};
pub use middleware::{middleware_fn, HandlerFuture, Middleware, NextFunc};
pub use models::{
    Outbound, Request, RequestType, Response, RpcError, CODE_EOF, CODE_INVALID_REQUEST,
    CODE_METHOD_NOT_FOUND, CODE_SERVER_ERROR,
};
pub use registry::{CallHandler, StreamHandler};
pub use router::{ErrorPostProc, ErrorPreProc, WsRpcRouter};
