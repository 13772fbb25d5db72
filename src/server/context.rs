//! 任务上下文与生命周期
//!
//! 所有权树：会话拥有命令通道和批次列表；批次拥有响应通道和任务列表；
//! 任务拥有响应槽和取消信号。取消信号是一棵一次性闩锁树
//! （会话 -> 批次 -> 任务），kill 全部幂等。

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{WsRpcError, WsRpcResult};
use crate::server::channel::{CommandChannel, ResponseChannel};
use crate::server::models::{Request, RequestType, Response};
use crate::utils::logger::debug;

/// 发起本次连接的 HTTP 请求元数据，处理器只读
#[derive(Debug, Clone)]
pub struct TransportMeta {
    /// 对端地址
    pub remote_addr: std::net::SocketAddr,
    /// HTTP 方法
    pub method: hyper::Method,
    /// 请求 URI
    pub uri: hyper::Uri,
    /// HTTP 请求头
    pub headers: hyper::HeaderMap,
}

/// 传递给请求处理器的上下文
///
/// 携带处理请求所需的数据：请求本身、预分配的响应槽、取消信号、
/// 任意键值暂存区以及发起连接的传输层元数据。克隆是浅拷贝，
/// 各克隆共享同一响应槽和暂存区。
#[derive(Clone)]
pub struct JobContext {
    request: Arc<Request>,
    response: Arc<Mutex<Response>>,
    cancel: CancellationToken,
    values: Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>,
    transport: Arc<TransportMeta>,
}

impl JobContext {
    fn new(
        request: Arc<Request>,
        cancel: CancellationToken,
        transport: Arc<TransportMeta>,
    ) -> Self {
        let response = Response::new(request.id);
        JobContext {
            request,
            response: Arc::new(Mutex::new(response)),
            cancel,
            values: Arc::new(DashMap::new()),
            transport,
        }
    }

    /// 当前任务的请求
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// 当前任务的响应槽，处理器就地修改
    pub fn response(&self) -> MutexGuard<'_, Response> {
        self.response.lock().unwrap()
    }

    /// 创建一个携带相同 id 的新响应
    ///
    /// 流式处理器用它生成中间响应后写入响应通道。
    pub fn new_response(&self) -> Response {
        Response::new(self.request.id)
    }

    /// 取消信号是否已触发
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待取消信号触发
    ///
    /// 处理器必须及时观察该信号并尽快返回。
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// 在暂存区写入一个键值对并返回自身
    pub fn with_value(
        self,
        key: impl Into<String>,
        value: impl Any + Send + Sync,
    ) -> Self {
        self.values.insert(key.into(), Arc::new(value));
        self
    }

    /// 读取暂存区的值
    pub fn value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// 发起本次连接的 HTTP 请求元数据
    pub fn transport(&self) -> &TransportMeta {
        &self.transport
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 取出响应槽当前内容的快照
    pub(crate) fn snapshot_response(&self) -> Response {
        self.response.lock().unwrap().clone()
    }
}

/// 一个请求的执行上下文
///
/// 批次解析时创建；处理器返回或批次被终止时结束，以先到者为准。
pub(crate) struct Job {
    ctx: JobContext,
    killed: AtomicBool,
    live: Arc<AtomicUsize>,
    channel: Arc<ResponseChannel>,
}

impl Job {
    pub(crate) fn context(&self) -> &JobContext {
        &self.ctx
    }

    pub(crate) fn request(&self) -> &Request {
        self.ctx.request()
    }

    /// 终止任务：触发取消信号，幂等
    ///
    /// 批次里最后一个被终止的任务顺带关闭响应通道，聚合循环由此
    /// 在没有 EOF 的结束路径上也能收敛。
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.cancel_token().cancel();
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.channel.close();
        }
    }
}

/// 共享同一解析来源、同一请求类型的一组任务
pub(crate) struct Batch {
    pub(crate) jobs: Vec<Job>,
    /// 线路载荷是数组形式
    pub(crate) is_sequence: bool,
    /// 批次内全部任务为流式类型
    pub(crate) is_stream: bool,
    pub(crate) channel: Arc<ResponseChannel>,
    cancel: CancellationToken,
    killed: AtomicBool,
}

// 手动实现：字段含 dyn Any，无法 derive；仅供测试 unwrap_err 使用
impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("jobs_len", &self.jobs.len())
            .field("is_sequence", &self.is_sequence)
            .field("is_stream", &self.is_stream)
            .finish()
    }
}

impl Batch {
    /// 把一条线路载荷解析为批次
    ///
    /// 接受单对象和非空数组两种形式。空载荷、id 为零、数组内混合
    /// 请求类型都会让整个批次在派发前失败。
    pub(crate) fn parse(
        data: &[u8],
        transport: Arc<TransportMeta>,
        parent: &CancellationToken,
    ) -> WsRpcResult<Arc<Batch>> {
        let trimmed = data.trim_ascii_start();

        let (requests, is_sequence) = match trimmed.first() {
            Some(b'[') => {
                let requests: Vec<Request> = serde_json::from_slice(trimmed)?;
                (requests, true)
            }
            Some(b'{') => {
                let request: Request = serde_json::from_slice(trimmed)?;
                (vec![request], false)
            }
            _ => {
                return Err(WsRpcError::InvalidRequest("missing request".to_string()))
            }
        };

        if requests.is_empty() {
            return Err(WsRpcError::InvalidRequest("missing request".to_string()));
        }

        let is_stream = requests[0].req_type == RequestType::Stream;
        for request in &requests {
            if request.id == 0 {
                return Err(WsRpcError::InvalidRequest(
                    "missing request id".to_string(),
                ));
            }
            if (request.req_type == RequestType::Stream) != is_stream {
                return Err(WsRpcError::InvalidRequest(
                    "mixed types is not allowed".to_string(),
                ));
            }
        }

        let cancel = parent.child_token();
        let channel = Arc::new(ResponseChannel::new(requests.len()));
        let live = Arc::new(AtomicUsize::new(requests.len()));

        let jobs = requests
            .into_iter()
            .map(|request| Job {
                ctx: JobContext::new(
                    Arc::new(request),
                    cancel.child_token(),
                    transport.clone(),
                ),
                killed: AtomicBool::new(false),
                live: live.clone(),
                channel: channel.clone(),
            })
            .collect();

        Ok(Arc::new(Batch {
            jobs,
            is_sequence,
            is_stream,
            channel,
            cancel,
            killed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    /// 终止整个批次：终止所有任务并关闭响应通道，幂等
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        for job in &self.jobs {
            job.kill();
        }
        self.channel.close();
        self.cancel.cancel();
    }

    /// 按请求 id 终止单个任务
    pub(crate) fn kill_job(&self, id: i64) {
        for job in &self.jobs {
            if job.request().id == id {
                job.kill();
            }
        }
    }
}

/// 一个已连接客户端的生命周期及其作用域内的资源
pub(crate) struct Session {
    id: String,
    channel: Arc<CommandChannel>,
    batches: Mutex<Vec<Arc<Batch>>>,
    cancel: CancellationToken,
    killed: AtomicBool,
    transport: Arc<TransportMeta>,
}

impl Session {
    pub(crate) fn new(transport: Arc<TransportMeta>) -> Arc<Session> {
        Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            channel: Arc::new(CommandChannel::new()),
            batches: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            killed: AtomicBool::new(false),
            transport,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn channel(&self) -> Arc<CommandChannel> {
        self.channel.clone()
    }

    pub(crate) fn transport(&self) -> Arc<TransportMeta> {
        self.transport.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 记录一个新批次，仅由读取循环调用
    pub(crate) fn push_batch(&self, batch: Arc<Batch>) {
        self.batches.lock().unwrap().push(batch);
    }

    /// 终止会话：级联终止全部批次，然后排空并关闭命令通道，幂等
    pub(crate) async fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("🛑 [会话] 终止会话: {}", self.id);

        let batches: Vec<Arc<Batch>> = self.batches.lock().unwrap().clone();
        for batch in batches {
            batch.kill();
        }
        self.channel.drain_and_close().await;
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> Arc<TransportMeta> {
        Arc::new(TransportMeta {
            remote_addr: "127.0.0.1:0".parse().unwrap(),
            method: hyper::Method::GET,
            uri: hyper::Uri::from_static("/"),
            headers: hyper::HeaderMap::new(),
        })
    }

    #[test]
    fn test_parse_object_form() {
        let root = CancellationToken::new();
        let batch = Batch::parse(
            br#"{"id":1,"method":"add","type":"CALL"}"#,
            test_meta(),
            &root,
        )
        .unwrap();

        assert_eq!(batch.len(), 1);
        assert!(!batch.is_sequence);
        assert!(!batch.is_stream);
        assert!(!batch.channel.is_closed());
    }

    #[test]
    fn test_parse_array_form() {
        let root = CancellationToken::new();
        let batch = Batch::parse(
            br#"[{"id":1,"method":"a","type":"STREAM"},{"id":2,"method":"b","type":"STREAM"}]"#,
            test_meta(),
            &root,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert!(batch.is_sequence);
        assert!(batch.is_stream);
    }

    #[test]
    fn test_parse_rejects_empty_payload() {
        let root = CancellationToken::new();
        for payload in [&b""[..], &b"  "[..], &b"[]"[..], &b"null"[..]] {
            assert!(Batch::parse(payload, test_meta(), &root).is_err());
        }
    }

    #[test]
    fn test_parse_rejects_zero_id() {
        let root = CancellationToken::new();
        let err = Batch::parse(
            br#"{"method":"add","type":"CALL"}"#,
            test_meta(),
            &root,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing request id"));
    }

    #[test]
    fn test_parse_rejects_mixed_types() {
        let root = CancellationToken::new();
        let err = Batch::parse(
            br#"[{"id":1,"method":"a","type":"CALL"},{"id":2,"method":"b","type":"STREAM"}]"#,
            test_meta(),
            &root,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mixed types"));
    }

    #[test]
    fn test_batch_kill_cascades() {
        let root = CancellationToken::new();
        let batch = Batch::parse(
            br#"[{"id":1,"method":"a","type":"CALL"},{"id":2,"method":"b","type":"CALL"}]"#,
            test_meta(),
            &root,
        )
        .unwrap();

        batch.kill();
        batch.kill();

        assert!(batch.channel.is_closed());
        for job in &batch.jobs {
            assert!(job.context().is_cancelled());
        }
    }

    #[test]
    fn test_last_job_kill_closes_channel() {
        let root = CancellationToken::new();
        let batch = Batch::parse(
            br#"[{"id":1,"method":"a","type":"STREAM"},{"id":2,"method":"b","type":"STREAM"}]"#,
            test_meta(),
            &root,
        )
        .unwrap();

        batch.kill_job(1);
        assert!(!batch.channel.is_closed());
        batch.kill_job(2);
        assert!(batch.channel.is_closed());
    }

    #[tokio::test]
    async fn test_session_kill_cascades() {
        let session = Session::new(test_meta());
        let batch = Batch::parse(
            br#"{"id":5,"method":"a","type":"STREAM"}"#,
            session.transport(),
            session.cancel_token(),
        )
        .unwrap();
        session.push_batch(batch.clone());

        session.kill().await;
        session.kill().await;

        assert!(batch.channel.is_closed());
        assert!(batch.jobs[0].context().is_cancelled());
        assert!(session.channel().is_closed());
    }

    #[test]
    fn test_context_scratch_store() {
        let root = CancellationToken::new();
        let batch = Batch::parse(
            br#"{"id":1,"method":"add","type":"CALL"}"#,
            test_meta(),
            &root,
        )
        .unwrap();

        let ctx = batch.jobs[0].context().clone().with_value("who", "tester");
        let value = ctx.value("who").unwrap();
        assert_eq!(value.downcast_ref::<&str>(), Some(&"tester"));
        assert!(ctx.value("missing").is_none());
    }
}
