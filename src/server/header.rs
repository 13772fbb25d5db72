//! 动态类型请求头
//!
//! 线路格式允许任意 JSON 值作为 header 的值，这里以不透明的
//! `serde_json::Value` 存储，并通过 [`HeaderValue`] 提供带默认值的
//! 类型化访问器。需要强类型 header 的处理器应当在入口处一次性解析。

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 请求/响应头，等价于 HTTP 头的 WsRPC 版本
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, Value>);

impl Headers {
    /// 创建一个空的 Headers
    pub fn new() -> Self {
        Headers(HashMap::new())
    }

    /// 写入一个键值对
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// 读取一个键，返回类型化访问器
    ///
    /// 键不存在时访问器的所有 `*_or` 方法都返回默认值
    pub fn get(&self, key: &str) -> HeaderValue<'_> {
        HeaderValue {
            value: self.0.get(key),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// 单个 header 值的类型化访问器
///
/// JSON 数字在线路上可能以浮点形式出现，`int_or` 会在整数读取失败时
/// 退回浮点截断。
#[derive(Debug, Clone, Copy)]
pub struct HeaderValue<'a> {
    value: Option<&'a Value>,
}

impl<'a> HeaderValue<'a> {
    /// 键是否存在
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// 原始 JSON 值
    pub fn value(&self) -> Option<&'a Value> {
        self.value
    }

    pub fn int_or(&self, default: i64) -> i64 {
        match self.value {
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            None => default,
        }
    }

    pub fn f64_or(&self, default: f64) -> f64 {
        self.value.and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn bool_or(&self, default: bool) -> bool {
        self.value.and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn str_or(&self, default: &str) -> String {
        self.value
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// 将值反序列化为 `Vec<T>`，值缺失或类型不匹配时返回 None
    pub fn slice_of<T: DeserializeOwned>(&self) -> Option<Vec<T>> {
        self.value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
