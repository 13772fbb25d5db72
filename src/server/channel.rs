//! 批次内部通道
//!
//! 两种可关闭的队列：
//! - [`ResponseChannel`]：按批次大小限容，多写单读，处理器把响应写进来，
//!   派发器聚合端读出去。会传递给流式处理器使用。
//! - [`CommandChannel`]：每个连接一条，所有批次的派发器汇聚到传输写出端。
//!
//! 两者的共同契约：`close` 幂等；关闭后 `write` 确定性地返回
//! [`WsRpcError::ChannelClosed`]，绝不 panic；关闭后 `read` 先排空缓冲，
//! 排空后返回 `ChannelClosed`。

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::{WsRpcError, WsRpcResult};
use crate::server::models::{Outbound, Response};

/// 批次响应通道
///
/// 容量在构造时固定为批次的任务数：调用型批次里每个任务恰好存入一个
/// 响应，处理器永远不会因为缓冲不足而阻塞；流式批次则由缓冲上限形成
/// 对处理器的自然背压。
///
/// 写端在缓冲满时阻塞，直到出现空位或通道被关闭。读端只有一个。
pub struct ResponseChannel {
    tx: Mutex<Option<mpsc::Sender<Response>>>,
    rx: AsyncMutex<mpsc::Receiver<Response>>,
    closed: CancellationToken,
}

impl ResponseChannel {
    /// 创建指定容量的响应通道
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size.max(1));
        ResponseChannel {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// 写入一个响应
    ///
    /// 缓冲满时挂起，直到有空位或通道关闭。与关闭竞争的写入统一
    /// 归一化为 `ChannelClosed`。
    pub async fn write(&self, msg: Response) -> WsRpcResult<()> {
        if self.closed.is_cancelled() {
            return Err(WsRpcError::ChannelClosed);
        }

        let tx = match self.tx.lock().unwrap().clone() {
            Some(tx) => tx,
            None => return Err(WsRpcError::ChannelClosed),
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(WsRpcError::ChannelClosed),
            res = tx.send(msg) => res.map_err(|_| WsRpcError::ChannelClosed),
        }
    }

    /// 读出一个响应，仅供聚合端使用
    pub(crate) async fn read(&self) -> WsRpcResult<Response> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(WsRpcError::ChannelClosed)
    }

    /// 关闭通道，幂等
    pub fn close(&self) {
        // 丢弃发送端，读端排空缓冲后自然观察到关闭
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        self.closed.cancel();
    }

    /// 通道是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// 连接命令通道
///
/// 承载不定形的出站消息，多个批次派发器写入，单个传输写出端读取。
/// 以容量 1 的会合语义实现：传输端停滞时派发器在写入处阻塞，背压经由
/// 限容的响应通道传导回处理器。不会暴露给请求处理器。
pub struct CommandChannel {
    tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    rx: AsyncMutex<mpsc::Receiver<Outbound>>,
    closed: CancellationToken,
}

impl CommandChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        CommandChannel {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// 写入一条出站命令
    pub(crate) async fn write(&self, msg: Outbound) -> WsRpcResult<()> {
        if self.closed.is_cancelled() {
            return Err(WsRpcError::ChannelClosed);
        }

        let tx = match self.tx.lock().unwrap().clone() {
            Some(tx) => tx,
            None => return Err(WsRpcError::ChannelClosed),
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(WsRpcError::ChannelClosed),
            res = tx.send(msg) => res.map_err(|_| WsRpcError::ChannelClosed),
        }
    }

    /// 读出一条出站命令
    pub(crate) async fn read(&self) -> WsRpcResult<Outbound> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(WsRpcError::ChannelClosed)
    }

    /// 关闭通道，幂等
    pub fn close(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        self.closed.cancel();
    }

    /// 关闭并排空残留消息
    ///
    /// 会话终止时调用，解除与关闭竞争的派发器的写阻塞。
    pub(crate) async fn drain_and_close(&self) {
        self.close();
        let mut rx = self.rx.lock().await;
        while rx.recv().await.is_some() {}
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}
