//! RAT WsRPC 双向 RPC 路由器
//!
//! 在单一传输端点上复用单次调用（CALL）和流式任务（STREAM）两类
//! 请求/响应作业，支持两种传输形态：
//! - 持久的 WebSocket 文本帧连接（从普通 HTTP GET 升级）
//! - 单次 HTTP POST 请求/响应交换（长轮询）
//!
//! 一条载荷可以是单个请求对象或同类型请求组成的数组（批次）。每个
//! 请求派发给注册的处理器并发执行，输出按调用/流式两种成帧规则
//! 返回给请求方。
//!
//! # 示例
//!
//! ```no_run
//! use rat_wsrpc::server::WsRpcRouter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = WsRpcRouter::new();
//!
//!     router.register_call("add", |ctx| async move {
//!         let a = ctx.request().header.get("A").int_or(0);
//!         let b = ctx.request().header.get("B").int_or(0);
//!         ctx.response().result =
//!             Some(serde_json::value::to_raw_value(&(a + b))?);
//!         Ok(())
//!     }, Vec::new());
//!
//!     router.register_stream("countdown", |ctx, channel| async move {
//!         let mut state = ctx.request().header.get("state").int_or(0);
//!         while state > 0 {
//!             if ctx.is_cancelled() {
//!                 return Err(rat_wsrpc::WsRpcError::HandlerError(
//!                     "cancelled".to_string(),
//!                 ));
//!             }
//!             let mut rsp = ctx.new_response();
//!             rsp.result = Some(serde_json::value::to_raw_value(&state)?);
//!             channel.write(rsp).await?;
//!             state -= 1;
//!         }
//!         Ok(())
//!     }, Vec::new());
//!
//!     router.start("127.0.0.1:10101").await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod server;
pub mod utils;

pub use error::{WsRpcError, WsRpcResult};
pub use server::{
    Headers, JobContext, Request, RequestType, Response, ResponseChannel, RpcError,
    ServerConfig, WsRpcRouter,
};
