//! WsRPC 路由器
//!
//! 对外入口：注册调用/流式处理器和中间件，然后 `start` 绑定监听并
//! 阻塞服务。同一个端点同时承接两种传输形态：带升级头的 GET 升级为
//! WebSocket 双工连接，POST 作为长轮询单次交换。

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::error::{WsRpcError, WsRpcResult};
use crate::server::channel::ResponseChannel;
use crate::server::config::ServerConfig;
use crate::server::connection_manager::WsConnectionManager;
use crate::server::context::{JobContext, Session, TransportMeta};
use crate::server::long_poll::{handle_long_poll, plain_response};
use crate::server::middleware::Middleware;
use crate::server::registry::{CallHandler, HandlerRegistry, StreamHandler};
use crate::server::ws_transport::run_duplex;
use crate::utils::logger::{debug, error, info, warn};

/// 错误预处理器：在错误被观察之前转换它
pub type ErrorPreProc = Arc<dyn Fn(WsRpcError) -> WsRpcError + Send + Sync>;
/// 错误后处理器：消费错误通道里的每一个错误
pub type ErrorPostProc = Arc<dyn Fn(&WsRpcError) + Send + Sync>;

/// 派发期共享的路由器状态
pub(crate) struct RouterShared {
    pub(crate) registry: HandlerRegistry,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) config: ServerConfig,
    pub(crate) errc: mpsc::UnboundedSender<WsRpcError>,
    pub(crate) err_preproc: ErrorPreProc,
}

impl RouterShared {
    /// 上报一个非致命错误
    pub(crate) fn report(&self, err: WsRpcError) {
        let err = (self.err_preproc)(err);
        let _ = self.errc.send(err);
    }
}

/// 双向 RPC 路由器
///
/// # 示例
///
/// ```no_run
/// use rat_wsrpc::server::WsRpcRouter;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = WsRpcRouter::new();
///     router.register_call("echo", |ctx| async move {
///         let params = ctx.request().params.clone();
///         ctx.response().result = params;
///         Ok(())
///     }, Vec::new());
///
///     router.start("127.0.0.1:10101").await?;
///     Ok(())
/// }
/// ```
pub struct WsRpcRouter {
    config: ServerConfig,
    registry: HandlerRegistry,
    middleware: Vec<Middleware>,
    err_preproc: ErrorPreProc,
    err_postproc: ErrorPostProc,
}

impl WsRpcRouter {
    /// 以默认配置创建路由器
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// 以指定配置创建路由器
    pub fn with_config(config: ServerConfig) -> Self {
        WsRpcRouter {
            config,
            registry: HandlerRegistry::new(),
            middleware: Vec::new(),
            err_preproc: Arc::new(|err| err),
            err_postproc: Arc::new(|err| error!("❌ [路由器] {}", err)),
        }
    }

    /// 注册一个调用处理器
    ///
    /// 处理器就地填充 `ctx.response()`；返回错误时由派发器合成
    /// 服务端错误响应。
    pub fn register_call<F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
        middleware: Vec<Middleware>,
    ) where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WsRpcResult<()>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.registry.register_call(method, handler, middleware);
    }

    /// 注册一个流式处理器
    ///
    /// 处理器向响应通道写入零或多个中间响应；返回后派发器补发
    /// 终止 EOF。
    pub fn register_stream<F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
        middleware: Vec<Middleware>,
    ) where
        F: Fn(JobContext, Arc<ResponseChannel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WsRpcResult<()>> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |ctx, channel| Box::pin(handler(ctx, channel)));
        self.registry.register_stream(method, handler, middleware);
    }

    /// 追加全局中间件，先于按方法注册的中间件执行
    pub fn use_middleware(&mut self, middleware: Vec<Middleware>) {
        self.middleware.extend(middleware);
    }

    /// 设置错误预处理器
    pub fn set_error_preproc(
        &mut self,
        f: impl Fn(WsRpcError) -> WsRpcError + Send + Sync + 'static,
    ) {
        self.err_preproc = Arc::new(f);
    }

    /// 设置错误后处理器
    pub fn set_error_postproc(&mut self, f: impl Fn(&WsRpcError) + Send + Sync + 'static) {
        self.err_postproc = Arc::new(f);
    }

    /// 绑定监听地址并阻塞服务
    ///
    /// 收到 Ctrl+C 时终止全部活跃会话后返回。
    pub async fn start(self, address: &str) -> WsRpcResult<()> {
        let (errc_tx, mut errc_rx) = mpsc::unbounded_channel::<WsRpcError>();

        // 错误通道消费者
        let postproc = self.err_postproc.clone();
        tokio::spawn(async move {
            while let Some(err) = errc_rx.recv().await {
                postproc(&err);
            }
        });

        let shared = Arc::new(RouterShared {
            registry: self.registry,
            middleware: self.middleware,
            config: self.config,
            errc: errc_tx,
            err_preproc: self.err_preproc,
        });
        let manager = Arc::new(WsConnectionManager::new());

        let listener = TcpListener::bind(address).await?;
        info!("🚀 [路由器] WsRPC 服务已启动: {}", address);

        let methods = shared.registry.list_methods();
        if !methods.is_empty() {
            info!("📋 [路由器] 已注册方法:");
            for method in &methods {
                info!("   {}", method);
            }
        }

        let accept_loop = {
            let shared = shared.clone();
            let manager = manager.clone();
            async move {
                loop {
                    let (stream, remote_addr) = listener.accept().await?;
                    let shared = shared.clone();
                    let manager = manager.clone();

                    tokio::task::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            handle_request(shared.clone(), manager.clone(), remote_addr, req)
                        });

                        let builder =
                            hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                        if let Err(err) =
                            builder.serve_connection_with_upgrades(io, service).await
                        {
                            let err_str = err.to_string();
                            if err_str.contains("IncompleteMessage")
                                || err_str.contains("connection closed")
                            {
                                debug!("🔌 [路由器] 客户端断开: {}", remote_addr);
                            } else {
                                error!(
                                    "❌ [路由器] 连接处理失败: {}: {}",
                                    remote_addr, err_str
                                );
                            }
                        }
                    });
                }

                // accept 循环正常情况下不会退出，这里仅为类型标注
                #[allow(unreachable_code)]
                Ok::<(), WsRpcError>(())
            }
        };

        tokio::select! {
            res = accept_loop => res,
            _ = tokio::signal::ctrl_c() => {
                info!(
                    "🛑 [路由器] 收到关闭信号，正在终止 {} 个活跃会话",
                    manager.active_count()
                );
                manager.shutdown_all().await;
                Ok(())
            }
        }
    }
}

impl Default for WsRpcRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// 按 HTTP 方法和升级头把请求分派到两种传输适配器
async fn handle_request(
    shared: Arc<RouterShared>,
    manager: Arc<WsConnectionManager>,
    remote_addr: SocketAddr,
    req: hyper::Request<Incoming>,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    if *req.method() == Method::GET {
        if !is_upgrade_request(&req) {
            shared.report(WsRpcError::HandshakeError(
                "not a websocket upgrade request".to_string(),
            ));
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "websocket upgrade required",
            ));
        }
        Ok(upgrade_websocket(shared, manager, remote_addr, req))
    } else if *req.method() == Method::POST {
        let meta = Arc::new(transport_meta(remote_addr, &req));
        let session = Session::new(meta);
        manager.register(session.clone());

        let response = handle_long_poll(shared, session.clone(), req).await;

        session.kill().await;
        manager.remove(session.id());
        Ok(response)
    } else {
        shared.report(WsRpcError::MethodNotFound(req.method().to_string()));
        Ok(plain_response(
            StatusCode::BAD_REQUEST,
            "method not supported",
        ))
    }
}

/// 应答 101 并在升级完成后的连接上运行双工适配器
fn upgrade_websocket(
    shared: Arc<RouterShared>,
    manager: Arc<WsConnectionManager>,
    remote_addr: SocketAddr,
    mut req: hyper::Request<Incoming>,
) -> hyper::Response<Full<Bytes>> {
    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => key.clone(),
        None => {
            shared.report(WsRpcError::HandshakeError(
                "missing Sec-WebSocket-Key".to_string(),
            ));
            return plain_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
        }
    };

    let accept = derive_accept_key(key.as_bytes());
    let accept = match HeaderValue::from_str(&accept) {
        Ok(accept) => accept,
        Err(e) => {
            shared.report(WsRpcError::HandshakeError(e.to_string()));
            return plain_response(StatusCode::BAD_REQUEST, "invalid Sec-WebSocket-Key");
        }
    };

    let meta = Arc::new(transport_meta(remote_addr, &req));
    let handshake_timeout = shared.config.handshake_timeout;

    // 升级在 101 应答发出后才完成，连接的后续驱动放到独立任务
    tokio::spawn(async move {
        match tokio::time::timeout(handshake_timeout, hyper::upgrade::on(&mut req)).await {
            Ok(Ok(upgraded)) => {
                info!("✅ [WS 传输] 协议升级成功: {}", remote_addr);

                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;

                let session = Session::new(meta);
                manager.register(session.clone());
                run_duplex(shared.clone(), session.clone(), ws).await;
                manager.remove(session.id());
            }
            Ok(Err(e)) => {
                warn!("❌ [WS 传输] 协议升级失败: {}: {}", remote_addr, e);
                shared.report(WsRpcError::HandshakeError(e.to_string()));
            }
            Err(_) => {
                shared.report(WsRpcError::HandshakeError(format!(
                    "upgrade timed out after {:?}",
                    handshake_timeout
                )));
            }
        }
    });

    let mut response = hyper::Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    response.headers_mut().insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

fn is_upgrade_request(req: &hyper::Request<Incoming>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    let upgrade_is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_has_upgrade && upgrade_is_websocket
}

fn transport_meta(remote_addr: SocketAddr, req: &hyper::Request<Incoming>) -> TransportMeta {
    TransportMeta {
        remote_addr,
        method: req.method().clone(),
        uri: req.uri().clone(),
        headers: req.headers().clone(),
    }
}
