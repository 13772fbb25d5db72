//! 服务器配置

use std::time::Duration;

/// 路由器运行配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket 升级完成的最长等待时间
    pub handshake_timeout: Duration,
    /// 长轮询请求体大小上限（字节）
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_payload_bytes: 4 * 1024 * 1024,
        }
    }
}
