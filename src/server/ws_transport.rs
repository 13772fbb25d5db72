//! WebSocket 双工传输适配器
//!
//! 升级完成后的持久连接在这里驱动：写出循环把命令通道里的消息逐条
//! 序列化为文本帧；读取循环把文本帧解析为批次并发派发。对端关闭或
//! 读取出错即退出，会话终止级联回收所有批次。

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::WsRpcError;
use crate::server::channel::CommandChannel;
use crate::server::context::{Batch, Session};
use crate::server::dispatcher::dispatch;
use crate::server::router::RouterShared;
use crate::utils::logger::debug;

/// 驱动一条已升级的 WebSocket 连接直到对端离开
pub(crate) async fn run_duplex<S>(
    shared: Arc<RouterShared>,
    session: Arc<Session>,
    ws: WebSocketStream<S>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(send_output(shared.clone(), session.channel(), sink));

    loop {
        match stream.next().await {
            None => break,
            Some(Err(e)) => {
                shared.report(e.into());
                break;
            }
            Some(Ok(Message::Text(text))) => {
                let batch = match Batch::parse(
                    text.as_bytes(),
                    session.transport(),
                    session.cancel_token(),
                ) {
                    Ok(batch) => batch,
                    Err(e) => {
                        shared.report(e);
                        continue;
                    }
                };

                session.push_batch(batch.clone());
                tokio::spawn(dispatch(shared.clone(), batch, session.channel()));
            }
            Some(Ok(Message::Binary(_))) => {
                shared.report(WsRpcError::UnsupportedFrame);
            }
            Some(Ok(Message::Close(_))) => {
                debug!("👋 [WS 传输] 对端关闭连接: {}", session.id());
                break;
            }
            // Ping/Pong 由协议栈自动应答
            Some(Ok(_)) => {}
        }
    }

    session.kill().await;
    let _ = writer.await;
}

/// 写出循环：命令通道 -> 每条消息一个 JSON 文本帧
///
/// 命令通道关闭即退出；单条消息的序列化或发送失败只上报，不中断
/// 循环。
async fn send_output<S>(
    shared: Arc<RouterShared>,
    channel: Arc<CommandChannel>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let msg = match channel.read().await {
            Ok(msg) => msg,
            Err(_) => break,
        };

        let data = match serde_json::to_string(&msg) {
            Ok(data) => data,
            Err(e) => {
                shared.report(e.into());
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(data.into())).await {
            shared.report(e.into());
        }
    }

    let _ = sink.close().await;
}
