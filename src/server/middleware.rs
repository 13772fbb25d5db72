//! 中间件管道
//!
//! 中间件是 `(上下文, next) -> 结果` 形式的拦截器，按注册顺序层层
//! 包裹终端处理器：m1 包住 m2，一直包到终端处理器 h。
//! 路由器级全局中间件先于按方法注册的中间件执行。不调用 `next`
//! 即短路，其返回的错误就是整条管道的结果。

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::WsRpcResult;
use crate::server::context::JobContext;

/// 处理器/中间件统一的装箱 Future
pub type HandlerFuture = Pin<Box<dyn Future<Output = WsRpcResult<()>> + Send>>;

/// 调用链中的下一环
pub type NextFunc = Box<dyn FnOnce(JobContext) -> HandlerFuture + Send>;

/// 中间件
pub type Middleware = Arc<dyn Fn(JobContext, NextFunc) -> HandlerFuture + Send + Sync>;

/// 用闭包构造一个中间件
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(JobContext, NextFunc) -> HandlerFuture + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 按顺序执行中间件链，最终抵达终端处理器
pub(crate) fn process_middleware(
    ctx: JobContext,
    handler: NextFunc,
    mut chain: VecDeque<Middleware>,
) -> HandlerFuture {
    Box::pin(async move {
        match chain.pop_front() {
            None => handler(ctx).await,
            Some(mw) => {
                let next: NextFunc =
                    Box::new(move |c| process_middleware(c, handler, chain));
                mw(ctx, next).await
            }
        }
    })
}
