//! 批次派发器
//!
//! 驱动一个批次走完全程：解析出的每个任务并发执行各自的处理器，
//! 输出经由批次响应通道汇聚，再按调用/流式两种成帧规则写上连接的
//! 命令通道。无论从哪条路径退出，批次都会被终止，所有任务、通道
//! 和定时器随之确定性回收。

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::error::WsRpcError;
use crate::server::channel::{CommandChannel, ResponseChannel};
use crate::server::context::{Batch, JobContext};
use crate::server::middleware::{process_middleware, HandlerFuture, NextFunc};
use crate::server::models::{Outbound, RequestType, RpcError};
use crate::server::router::RouterShared;
use crate::utils::logger::debug;

/// 派发一个批次并保证回收
pub(crate) async fn dispatch(
    shared: Arc<RouterShared>,
    batch: Arc<Batch>,
    out: Arc<CommandChannel>,
) {
    run_batch(&shared, &batch, &out).await;
    batch.kill();
}

async fn run_batch(shared: &Arc<RouterShared>, batch: &Arc<Batch>, out: &Arc<CommandChannel>) {
    debug!(
        "🔄 [派发器] 开始派发批次: jobs={} stream={} sequence={}",
        batch.len(),
        batch.is_stream,
        batch.is_sequence
    );

    for job in &batch.jobs {
        let ctx = job.context().clone();
        let request = job.request();

        let pipeline = match resolve_pipeline(shared, &ctx, batch.channel.clone()) {
            Ok(pipeline) => pipeline,
            Err((rpc_err, report)) => {
                shared.report(report);

                let mut resp = ctx.new_response();
                resp.error = Some(rpc_err);

                // 失败响应的写入放到独立任务：聚合循环尚未启动，
                // 在这里等待缓冲空位会卡住整个批次
                let shared = shared.clone();
                let batch = batch.clone();
                tokio::spawn(async move {
                    let id = resp.id;
                    if let Err(e) = batch.channel.write(resp).await {
                        shared.report(e);
                    }
                    // 未启动的任务直接终止，流式聚合循环经由通道关闭收敛
                    batch.kill_job(id);
                });
                continue;
            }
        };

        spawn_job(shared, batch, ctx, request.method.clone(), pipeline);
    }

    if batch.is_stream {
        stream_framing(shared, batch, out).await;
    } else {
        call_framing(shared, batch, out).await;
    }
}

/// 解析任务对应的处理器并套上中间件链
///
/// 全局中间件在前，按方法注册的中间件在后。查找失败时返回要写回
/// 请求方的线路错误和要上报错误通道的内部错误。
fn resolve_pipeline(
    shared: &Arc<RouterShared>,
    ctx: &JobContext,
    channel: Arc<ResponseChannel>,
) -> Result<HandlerFuture, (RpcError, WsRpcError)> {
    let request = ctx.request();

    match request.req_type {
        RequestType::Call => {
            let bundle = shared.registry.get_call(&request.method).ok_or_else(|| {
                (
                    RpcError::method_not_found(&request.method),
                    WsRpcError::MethodNotFound(request.method.clone()),
                )
            })?;

            let function = bundle.function.clone();
            let exec: NextFunc = Box::new(move |c| function(c));

            let mut chain: VecDeque<_> = shared.middleware.iter().cloned().collect();
            chain.extend(bundle.middleware().iter().cloned());

            Ok(process_middleware(ctx.clone(), exec, chain))
        }
        RequestType::Stream => {
            let bundle = shared.registry.get_stream(&request.method).ok_or_else(|| {
                (
                    RpcError::method_not_found(&request.method),
                    WsRpcError::MethodNotFound(request.method.clone()),
                )
            })?;

            let stream = bundle.stream.clone();
            let exec: NextFunc = Box::new(move |c| stream(c, channel));

            let mut chain: VecDeque<_> = shared.middleware.iter().cloned().collect();
            chain.extend(bundle.middleware().iter().cloned());

            Ok(process_middleware(ctx.clone(), exec, chain))
        }
        RequestType::Unknown => Err((
            RpcError::type_not_found(request.req_type),
            WsRpcError::InvalidRequest(format!(
                "type not found for method {}",
                request.method
            )),
        )),
    }
}

/// 并发执行一个任务的处理器管道
///
/// 处理器结束后由这里补齐成帧约定：调用任务写出响应槽；流式任务
/// 在终态响应有内容时先写出，再补终止 EOF。处理器返回错误或
/// panic 时合成服务端错误响应，流式任务同时被终止（错误帧即终帧，
/// 不再补 EOF）。
fn spawn_job(
    shared: &Arc<RouterShared>,
    batch: &Arc<Batch>,
    ctx: JobContext,
    method: String,
    pipeline: HandlerFuture,
) {
    let shared = shared.clone();
    let batch = batch.clone();
    let channel = batch.channel.clone();
    let is_stream = batch.is_stream;

    tokio::spawn(async move {
        let id = ctx.request().id;

        // 处理器内的 panic 折算为错误，绝不拖垮会话
        let outcome = AssertUnwindSafe(pipeline).catch_unwind().await;
        let failure: Option<WsRpcError> = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(WsRpcError::HandlerError(format!(
                "handler panicked: {}",
                method
            ))),
        };

        match failure {
            None => {
                if is_stream {
                    let resp = ctx.snapshot_response();
                    if resp.result.is_some() || !resp.header.is_empty() {
                        if let Err(e) = channel.write(resp).await {
                            shared.report(e);
                        }
                    }

                    let mut eof = ctx.new_response();
                    eof.error = Some(RpcError::eof());
                    if let Err(e) = channel.write(eof).await {
                        shared.report(e);
                    }
                } else {
                    if let Err(e) = channel.write(ctx.snapshot_response()).await {
                        shared.report(e);
                    }
                }
            }
            Some(err) => {
                let mut resp = ctx.new_response();
                resp.error = Some(RpcError::server_error(&err));
                shared.report(err);

                if let Err(e) = channel.write(resp).await {
                    shared.report(e);
                }
                if is_stream {
                    batch.kill_job(id);
                }
            }
        }
    });
}

/// 调用成帧：固定读出任务数个响应，聚合为一条命令
async fn call_framing(shared: &Arc<RouterShared>, batch: &Arc<Batch>, out: &Arc<CommandChannel>) {
    let mut result = Vec::with_capacity(batch.len());
    for _ in 0..batch.len() {
        match batch.channel.read().await {
            Ok(resp) => result.push(resp),
            Err(_) => continue,
        }
    }

    let outbound = if batch.is_sequence {
        Outbound::Batch(result)
    } else {
        // 批次提前终止时可能一个响应都没有
        match result.into_iter().next() {
            Some(first) => Outbound::Single(first),
            None => return,
        }
    };

    if let Err(e) = out.write(outbound).await {
        shared.report(e);
    }
}

/// 流式成帧：逐条转发，EOF 帧结束对应任务
///
/// 收敛条件：每读到一次 EOF 或一次通道关闭，存活计数减一；没有
/// EOF 的结束路径（错误帧、方法缺失）靠最后一个任务终止时关闭的
/// 响应通道来消化剩余计数。
async fn stream_framing(
    _shared: &Arc<RouterShared>,
    batch: &Arc<Batch>,
    out: &Arc<CommandChannel>,
) {
    let mut running = batch.len();
    while running > 0 {
        let resp = match batch.channel.read().await {
            Ok(resp) => resp,
            Err(_) => {
                running -= 1;
                continue;
            }
        };

        if resp.error.as_ref().map(RpcError::is_eof).unwrap_or(false) {
            batch.kill_job(resp.id);
            running -= 1;
        }

        // 命令通道写失败说明会话已经关停
        if out.write(Outbound::Single(resp)).await.is_err() {
            return;
        }
    }

    debug!("✅ [派发器] 流式批次完成: jobs={}", batch.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use crate::server::context::{Session, TransportMeta};
    use crate::server::models::{Response, CODE_METHOD_NOT_FOUND, CODE_SERVER_ERROR};
    use crate::server::registry::HandlerRegistry;
    use serde_json::value::to_raw_value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_meta() -> Arc<TransportMeta> {
        Arc::new(TransportMeta {
            remote_addr: "127.0.0.1:0".parse().unwrap(),
            method: hyper::Method::GET,
            uri: hyper::Uri::from_static("/"),
            headers: hyper::HeaderMap::new(),
        })
    }

    fn test_shared(registry: HandlerRegistry) -> Arc<RouterShared> {
        let (errc, mut errc_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while errc_rx.recv().await.is_some() {} });
        Arc::new(RouterShared {
            registry,
            middleware: Vec::new(),
            config: ServerConfig::default(),
            errc,
            err_preproc: Arc::new(|err| err),
        })
    }

    fn add_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_call(
            "add",
            Arc::new(|ctx: JobContext| {
                Box::pin(async move {
                    let a = ctx.request().header.get("A").int_or(0);
                    let b = ctx.request().header.get("B").int_or(0);
                    ctx.response().result = Some(to_raw_value(&(a + b))?);
                    Ok(())
                })
            }),
            Vec::new(),
        );
        registry.register_call(
            "fail",
            Arc::new(|_ctx: JobContext| {
                Box::pin(async move {
                    Err(WsRpcError::HandlerError("boom".to_string()))
                })
            }),
            Vec::new(),
        );
        registry.register_call(
            "panic",
            Arc::new(|_ctx: JobContext| {
                Box::pin(async move { panic!("unexpected") })
            }),
            Vec::new(),
        );
        registry.register_stream(
            "countdown",
            Arc::new(|ctx: JobContext, channel: Arc<crate::server::channel::ResponseChannel>| {
                Box::pin(async move {
                    let mut state = ctx.request().header.get("state").int_or(0);
                    while state > 0 {
                        let mut rsp = ctx.new_response();
                        rsp.result = Some(to_raw_value(&state)?);
                        channel.write(rsp).await?;
                        state -= 1;
                    }
                    Ok(())
                })
            }),
            Vec::new(),
        );
        registry.register_stream(
            "broken",
            Arc::new(|_ctx: JobContext, _channel: Arc<crate::server::channel::ResponseChannel>| {
                Box::pin(async move {
                    Err(WsRpcError::HandlerError("stream boom".to_string()))
                })
            }),
            Vec::new(),
        );
        registry
    }

    async fn run(payload: &[u8]) -> (Arc<Session>, Arc<Batch>) {
        let shared = test_shared(add_registry());
        let session = Session::new(test_meta());
        let batch =
            Batch::parse(payload, session.transport(), session.cancel_token()).unwrap();
        session.push_batch(batch.clone());
        tokio::spawn(dispatch(shared, batch.clone(), session.channel()));
        (session, batch)
    }

    fn result_i64(resp: &Response) -> i64 {
        serde_json::from_str(resp.result.as_ref().unwrap().get()).unwrap()
    }

    #[tokio::test]
    async fn test_call_single_framing() {
        let (session, _batch) =
            run(br#"{"id":1,"method":"add","type":"CALL","header":{"A":2,"B":3}}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 1);
                assert_eq!(result_i64(&resp), 5);
                assert!(resp.error.is_none());
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_batch_framing() {
        let (session, _batch) = run(
            br#"[{"id":1,"method":"add","type":"CALL","header":{"A":1,"B":2}},
                 {"id":2,"method":"add","type":"CALL","header":{"A":3,"B":4}}]"#,
        )
        .await;

        match session.channel().read().await.unwrap() {
            Outbound::Batch(mut responses) => {
                assert_eq!(responses.len(), 2);
                responses.sort_by_key(|r| r.id);
                assert_eq!(result_i64(&responses[0]), 3);
                assert_eq!(result_i64(&responses[1]), 7);
            }
            other => panic!("expected aggregated batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_unknown_method() {
        let (session, _batch) =
            run(br#"{"id":9,"method":"nope","type":"CALL"}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 9);
                assert_eq!(resp.error.unwrap().code, CODE_METHOD_NOT_FOUND);
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_batch_preserves_count_with_missing_method() {
        let (session, _batch) = run(
            br#"[{"id":1,"method":"add","type":"CALL","header":{"A":1,"B":1}},
                 {"id":2,"method":"nope","type":"CALL"}]"#,
        )
        .await;

        match session.channel().read().await.unwrap() {
            Outbound::Batch(mut responses) => {
                assert_eq!(responses.len(), 2);
                responses.sort_by_key(|r| r.id);
                assert_eq!(result_i64(&responses[0]), 2);
                assert_eq!(
                    responses[1].error.as_ref().unwrap().code,
                    CODE_METHOD_NOT_FOUND
                );
            }
            other => panic!("expected aggregated batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_handler_error_becomes_server_error() {
        let (session, _batch) = run(br#"{"id":4,"method":"fail","type":"CALL"}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 4);
                let err = resp.error.unwrap();
                assert_eq!(err.code, CODE_SERVER_ERROR);
                assert!(err.message.contains("boom"));
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_handler_panic_becomes_server_error() {
        let (session, _batch) = run(br#"{"id":5,"method":"panic","type":"CALL"}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 5);
                assert_eq!(resp.error.unwrap().code, CODE_SERVER_ERROR);
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (session, _batch) = run(br#"{"id":6,"method":"add","type":"PUSH"}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 6);
                assert_eq!(
                    resp.error.unwrap().code,
                    crate::server::models::CODE_INVALID_REQUEST
                );
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_framing_order_and_eof() {
        let (session, batch) = run(
            br#"{"id":7,"method":"countdown","type":"STREAM","header":{"state":3}}"#,
        )
        .await;

        let mut results = Vec::new();
        loop {
            match session.channel().read().await.unwrap() {
                Outbound::Single(resp) => {
                    assert_eq!(resp.id, 7);
                    match &resp.error {
                        None => results.push(result_i64(&resp)),
                        Some(err) => {
                            assert!(err.is_eof());
                            break;
                        }
                    }
                }
                other => panic!("expected single frames, got {:?}", other),
            }
        }

        // 单个流式任务内的发送顺序保持不变，EOF 收尾
        assert_eq!(results, vec![3, 2, 1]);

        // 批次收敛后所有任务结束，响应通道关闭
        tokio::time::timeout(Duration::from_secs(1), async {
            while !batch.channel.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("response channel not closed after stream completion");
    }

    #[tokio::test]
    async fn test_stream_unknown_method_terminates() {
        let (session, batch) =
            run(br#"{"id":8,"method":"nope","type":"STREAM"}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 8);
                assert_eq!(resp.error.unwrap().code, CODE_METHOD_NOT_FOUND);
            }
            other => panic!("expected single response, got {:?}", other),
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while !batch.channel.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream aggregation did not terminate");
    }

    #[tokio::test]
    async fn test_middleware_order_and_short_circuit() {
        use crate::server::middleware::{middleware_fn, Middleware};

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let tag = |name: &'static str,
                   order: Arc<std::sync::Mutex<Vec<&'static str>>>|
         -> Middleware {
            middleware_fn(move |ctx, next| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(name);
                    next(ctx).await
                })
            })
        };

        let mut registry = HandlerRegistry::new();
        let order2 = order.clone();
        registry.register_call(
            "probe",
            Arc::new(move |_ctx: JobContext| {
                let order = order2.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("handler");
                    Ok(())
                })
            }),
            vec![tag("method", order.clone())],
        );
        registry.register_call(
            "denied",
            Arc::new(|_ctx: JobContext| {
                Box::pin(async move { Ok(()) })
            }),
            vec![middleware_fn(|_ctx, _next| {
                Box::pin(async move {
                    Err(WsRpcError::HandlerError("denied by middleware".to_string()))
                })
            })],
        );

        let (errc, mut errc_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while errc_rx.recv().await.is_some() {} });
        let shared = Arc::new(RouterShared {
            registry,
            middleware: vec![tag("global", order.clone())],
            config: ServerConfig::default(),
            errc,
            err_preproc: Arc::new(|err| err),
        });

        let session = Session::new(test_meta());
        let batch = Batch::parse(
            br#"{"id":1,"method":"probe","type":"CALL"}"#,
            session.transport(),
            session.cancel_token(),
        )
        .unwrap();
        tokio::spawn(dispatch(shared.clone(), batch, session.channel()));
        session.channel().read().await.unwrap();

        // 全局中间件先于按方法注册的中间件
        assert_eq!(*order.lock().unwrap(), vec!["global", "method", "handler"]);

        // 中间件短路的错误与处理器错误同样处理
        let batch = Batch::parse(
            br#"{"id":2,"method":"denied","type":"CALL"}"#,
            session.transport(),
            session.cancel_token(),
        )
        .unwrap();
        tokio::spawn(dispatch(shared, batch, session.channel()));
        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, CODE_SERVER_ERROR);
                assert!(err.message.contains("denied by middleware"));
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_handler_error_no_eof() {
        let (session, batch) =
            run(br#"{"id":11,"method":"broken","type":"STREAM"}"#).await;

        match session.channel().read().await.unwrap() {
            Outbound::Single(resp) => {
                assert_eq!(resp.id, 11);
                let err = resp.error.unwrap();
                assert_eq!(err.code, CODE_SERVER_ERROR);
                assert!(err.message.contains("stream boom"));
            }
            other => panic!("expected single response, got {:?}", other),
        }

        // 错误帧即终帧：批次收敛且没有后续 EOF 帧
        tokio::time::timeout(Duration::from_secs(1), async {
            while !batch.channel.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream aggregation did not terminate");

        let follow_up =
            tokio::time::timeout(Duration::from_millis(100), session.channel().read()).await;
        assert!(follow_up.is_err() || follow_up.unwrap().is_err());
    }
}

