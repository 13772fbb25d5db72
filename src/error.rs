//! 错误类型定义
//!
//! 提供整个 crate 统一的错误枚举和 Result 别名

use std::fmt;

/// 统一的 Result 类型别名
pub type WsRpcResult<T> = Result<T, WsRpcError>;

/// WsRPC 错误类型
///
/// 覆盖传输 I/O、握手、解析、通道和处理器各个层面的错误。
/// 通道相关的失败统一归一化为 `ChannelClosed`，保证写已关闭通道
/// 永远返回确定性错误而不是 panic。
#[derive(Debug)]
pub enum WsRpcError {
    /// I/O 错误
    IoError(std::io::Error),
    /// 网络错误（WebSocket 帧读写、连接中断等）
    NetworkError(String),
    /// WebSocket 握手/升级错误
    HandshakeError(String),
    /// 载荷解析错误
    ParseError(String),
    /// 请求格式错误（缺失请求、缺失 id、混合类型等）
    InvalidRequest(String),
    /// 通道已关闭
    ChannelClosed,
    /// 处理器返回的错误
    HandlerError(String),
    /// 方法未找到
    MethodNotFound(String),
    /// 帧类型不支持（非文本帧）
    UnsupportedFrame,
}

impl fmt::Display for WsRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsRpcError::IoError(e) => write!(f, "io error: {}", e),
            WsRpcError::NetworkError(msg) => write!(f, "network error: {}", msg),
            WsRpcError::HandshakeError(msg) => write!(f, "handshake error: {}", msg),
            WsRpcError::ParseError(msg) => write!(f, "parse error: {}", msg),
            WsRpcError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            WsRpcError::ChannelClosed => write!(f, "channel closed"),
            WsRpcError::HandlerError(msg) => write!(f, "handler error: {}", msg),
            WsRpcError::MethodNotFound(method) => write!(f, "method not found: {}", method),
            WsRpcError::UnsupportedFrame => write!(f, "frame content is not text"),
        }
    }
}

impl std::error::Error for WsRpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WsRpcError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WsRpcError {
    fn from(e: std::io::Error) -> Self {
        WsRpcError::IoError(e)
    }
}

impl From<serde_json::Error> for WsRpcError {
    fn from(e: serde_json::Error) -> Self {
        WsRpcError::ParseError(e.to_string())
    }
}

impl From<hyper::Error> for WsRpcError {
    fn from(e: hyper::Error) -> Self {
        WsRpcError::NetworkError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WsRpcError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsRpcError::NetworkError(e.to_string())
    }
}
