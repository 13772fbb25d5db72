//! 连接管理器
//!
//! 基于无锁 DashMap 的活跃会话登记表

use std::sync::Arc;

use dashmap::DashMap;

use crate::server::context::Session;
use crate::utils::logger::{debug, info};

/// 活跃会话登记表：session_id -> Session
pub(crate) struct WsConnectionManager {
    sessions: DashMap<String, Arc<Session>>,
}

impl WsConnectionManager {
    pub(crate) fn new() -> Self {
        WsConnectionManager {
            sessions: DashMap::new(),
        }
    }

    /// 登记一个新会话
    pub(crate) fn register(&self, session: Arc<Session>) {
        debug!(
            "🔗 [连接管理器] 登记会话: {} (活跃: {})",
            session.id(),
            self.sessions.len() + 1
        );
        self.sessions.insert(session.id().to_string(), session);
    }

    /// 移除一个会话
    pub(crate) fn remove(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!("🔌 [连接管理器] 移除会话: {}", session_id);
        }
    }

    /// 当前活跃会话数
    pub(crate) fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// 终止全部会话
    pub(crate) async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        for session in &sessions {
            session.kill().await;
        }
        info!("🧹 [连接管理器] 已终止 {} 个会话", sessions.len());
    }
}
