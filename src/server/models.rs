//! 线路数据模型
//!
//! 请求、响应和错误记录的序列化结构。`params`/`result`/`error.data`
//! 都是不透明的 JSON 片段，以 `RawValue` 原样携带，不做二次解析。

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::server::header::Headers;

/// 无效请求（格式/类型错误）
pub const CODE_INVALID_REQUEST: i32 = -32600;
/// 方法未找到
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
/// 通用服务端错误（包装处理器返回的错误）
pub const CODE_SERVER_ERROR: i32 = -32000;
/// 流结束标记（不是失败，是成帧信号）
pub const CODE_EOF: i32 = 205;

/// 请求类型，标记一个任务是单次调用还是流式任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestType {
    /// 单次调用：恰好产生一个响应
    #[serde(rename = "CALL")]
    Call,
    /// 流式任务：产生一串响应，以 EOF 标记结束
    #[serde(rename = "STREAM")]
    Stream,
    /// 未识别的类型，派发阶段会以 type-not-found 响应
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

// 线路上 type 是普通字符串，未识别的值保留到派发阶段处理
impl<'de> Deserialize<'de> for RequestType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "CALL" => RequestType::Call,
            "STREAM" => RequestType::Stream,
            _ => RequestType::Unknown,
        })
    }
}

/// 客户端请求，解析完成后不可变
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// 关联 id，批次内唯一且非零
    #[serde(default)]
    pub id: i64,
    /// 方法名，区分大小写精确匹配
    pub method: String,
    /// 请求类型
    #[serde(rename = "type")]
    pub req_type: RequestType,
    /// 不透明参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    /// 动态类型请求头
    #[serde(default)]
    pub header: Headers,
}

/// 返回给请求方的响应
///
/// 在处理器执行期间可变，一旦写入响应通道即视为不可变。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// 从请求复制的关联 id
    pub id: i64,
    /// 不透明结果
    pub result: Option<Box<RawValue>>,
    /// 响应头，初始为空
    pub header: Headers,
    /// 错误记录
    pub error: Option<RpcError>,
}

impl Response {
    /// 为指定请求 id 创建一个空响应
    pub fn new(id: i64) -> Self {
        Response {
            id,
            result: None,
            header: Headers::new(),
            error: None,
        }
    }
}

/// 线路错误记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl RpcError {
    /// 请求了不存在的方法
    pub fn method_not_found(method: &str) -> Self {
        RpcError {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("method not found: {}", method),
            data: None,
        }
    }

    /// 请求了无效的请求类型
    pub fn type_not_found(req_type: RequestType) -> Self {
        RpcError {
            code: CODE_INVALID_REQUEST,
            message: format!("type not found: {:?}", req_type),
            data: None,
        }
    }

    /// 将处理器错误包装为服务端错误
    pub fn server_error(msg: impl std::fmt::Display) -> Self {
        RpcError {
            code: CODE_SERVER_ERROR,
            message: format!("server error: {}", msg),
            data: None,
        }
    }

    /// 流结束标记
    pub fn eof() -> Self {
        RpcError {
            code: CODE_EOF,
            message: "EOF".to_string(),
            data: None,
        }
    }

    /// 是否为流结束标记
    pub fn is_eof(&self) -> bool {
        self.code == CODE_EOF
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wsrpc: {}, message={}", self.code, self.message)
    }
}

/// 出站命令：单个响应或按批次聚合的响应数组
///
/// 调用批次以数组/单对象形式一次性下发，流式批次逐条下发。
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Single(Response),
    Batch(Vec<Response>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let raw = r#"{"id":1,"method":"add","type":"CALL","params":{"val":3},"header":{"A":2,"B":3}}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.id, 1);
        assert_eq!(req.method, "add");
        assert_eq!(req.req_type, RequestType::Call);
        assert_eq!(req.header.get("A").int_or(0), 2);

        let encoded = serde_json::to_string(&req).unwrap();
        let a: serde_json::Value = serde_json::from_str(raw).unwrap();
        let b: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_id_defaults_to_zero() {
        let req: Request =
            serde_json::from_str(r#"{"method":"add","type":"CALL"}"#).unwrap();
        assert_eq!(req.id, 0);
    }

    #[test]
    fn test_unknown_type_parses() {
        let req: Request =
            serde_json::from_str(r#"{"id":1,"method":"x","type":"PUSH"}"#).unwrap();
        assert_eq!(req.req_type, RequestType::Unknown);
    }

    #[test]
    fn test_response_serialization_shape() {
        let resp = Response::new(7);
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(v["id"], 7);
        assert!(v["result"].is_null());
        assert!(v["error"].is_null());
        assert!(v["header"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_outbound_framing_shapes() {
        let single = Outbound::Single(Response::new(1));
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&single).unwrap()).unwrap();
        assert!(v.is_object());

        let batch = Outbound::Batch(vec![Response::new(1), Response::new(2)]);
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&batch).unwrap()).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);
    }
}
