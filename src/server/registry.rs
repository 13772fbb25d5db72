//! 处理器注册表
//!
//! 按方法名索引调用处理器和流式处理器两张互不相交的表，精确匹配、
//! 区分大小写。注册发生在 `start` 之前，派发阶段只读，无需同步。

use std::collections::HashMap;
use std::sync::Arc;

use crate::server::channel::ResponseChannel;
use crate::server::context::JobContext;
use crate::server::middleware::{HandlerFuture, Middleware};
use crate::utils::logger::info;

/// 调用处理器：就地填充 `ctx.response()` 后返回
pub type CallHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// 流式处理器：向响应通道写入零或多个中间响应后返回
pub type StreamHandler =
    Arc<dyn Fn(JobContext, Arc<ResponseChannel>) -> HandlerFuture + Send + Sync>;

struct Bundle {
    middleware: Vec<Middleware>,
}

pub(crate) struct FunctionBundle {
    bundle: Bundle,
    pub(crate) function: CallHandler,
}

pub(crate) struct StreamBundle {
    bundle: Bundle,
    pub(crate) stream: StreamHandler,
}

impl FunctionBundle {
    pub(crate) fn middleware(&self) -> &[Middleware] {
        &self.bundle.middleware
    }
}

impl StreamBundle {
    pub(crate) fn middleware(&self) -> &[Middleware] {
        &self.bundle.middleware
    }
}

/// 方法名到处理器的注册表
pub(crate) struct HandlerRegistry {
    call_handlers: HashMap<String, FunctionBundle>,
    stream_handlers: HashMap<String, StreamBundle>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        HandlerRegistry {
            call_handlers: HashMap::new(),
            stream_handlers: HashMap::new(),
        }
    }

    /// 注册调用处理器
    pub(crate) fn register_call(
        &mut self,
        method: impl Into<String>,
        handler: CallHandler,
        middleware: Vec<Middleware>,
    ) {
        let method = method.into();
        info!("📝 [注册表] 注册调用方法: {}", method);
        self.call_handlers.insert(
            method,
            FunctionBundle {
                bundle: Bundle { middleware },
                function: handler,
            },
        );
    }

    /// 注册流式处理器
    pub(crate) fn register_stream(
        &mut self,
        method: impl Into<String>,
        handler: StreamHandler,
        middleware: Vec<Middleware>,
    ) {
        let method = method.into();
        info!("📝 [注册表] 注册流式方法: {}", method);
        self.stream_handlers.insert(
            method,
            StreamBundle {
                bundle: Bundle { middleware },
                stream: handler,
            },
        );
    }

    pub(crate) fn get_call(&self, method: &str) -> Option<&FunctionBundle> {
        self.call_handlers.get(method)
    }

    pub(crate) fn get_stream(&self, method: &str) -> Option<&StreamBundle> {
        self.stream_handlers.get(method)
    }

    /// 列出全部已注册方法，排序后返回
    pub(crate) fn list_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .call_handlers
            .keys()
            .chain(self.stream_handlers.keys())
            .cloned()
            .collect();
        methods.sort();
        methods
    }
}
