//! 长轮询单次传输适配器
//!
//! 一次 POST 即一个会话：请求体解析为批次并发派发，从命令通道读出
//! 恰好一条消息作为响应体返回，随后立即终止批次。调用型批次的聚合
//! 命令正好是一条消息；流式批次经由该传输只能收到第一条流消息。

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;

use crate::error::WsRpcError;
use crate::server::context::{Batch, Session};
use crate::server::dispatcher::dispatch;
use crate::server::router::RouterShared;
use crate::utils::logger::debug;

/// 处理一次长轮询交换
pub(crate) async fn handle_long_poll(
    shared: Arc<RouterShared>,
    session: Arc<Session>,
    req: hyper::Request<Incoming>,
) -> hyper::Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            shared.report(e.into());
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read request body",
            );
        }
    };

    if body.len() > shared.config.max_payload_bytes {
        shared.report(WsRpcError::InvalidRequest(format!(
            "payload of {} bytes exceeds limit",
            body.len()
        )));
        return plain_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
    }

    let batch = match Batch::parse(&body, session.transport(), session.cancel_token()) {
        Ok(batch) => batch,
        Err(e) => {
            let msg = e.to_string();
            shared.report(e);
            return plain_response(StatusCode::BAD_REQUEST, &msg);
        }
    };

    debug!(
        "📥 [长轮询] 收到批次: jobs={} session={}",
        batch.len(),
        session.id()
    );

    session.push_batch(batch.clone());
    tokio::spawn(dispatch(shared.clone(), batch.clone(), session.channel()));

    let msg = match session.channel().read().await {
        Ok(msg) => msg,
        Err(e) => {
            shared.report(e);
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "no response produced",
            );
        }
    };
    // 单次交换只取一条消息，之后批次整体终止
    batch.kill();

    match serde_json::to_vec(&msg) {
        Ok(data) => json_response(StatusCode::OK, Bytes::from(data)),
        Err(e) => {
            shared.report(e.into());
            plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize response",
            )
        }
    }
}

fn json_response(status: StatusCode, body: Bytes) -> hyper::Response<Full<Bytes>> {
    let mut resp = hyper::Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub(crate) fn plain_response(status: StatusCode, msg: &str) -> hyper::Response<Full<Bytes>> {
    let mut resp = hyper::Response::new(Full::new(Bytes::from(msg.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
