use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// TTL 查询在没有任何过期时间时返回的哨兵值(秒)
pub const NO_EXPIRY_SECONDS: i64 = -1;

/// 表示"永不过期"的 TTL
pub fn no_expiry() -> Duration {
    Duration::seconds(NO_EXPIRY_SECONDS)
}

/// 任务调用信息: 目标类型, 方法以及参数类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationData {
    pub type_name: String,
    pub method: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
}

impl InvocationData {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            parameter_types: Vec::new(),
        }
    }

    pub fn with_parameter_types(mut self, parameter_types: Vec<String>) -> Self {
        self.parameter_types = parameter_types;
        self
    }

    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn deserialize(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// 任务读模型
///
/// 调用信息无法解析时 `invocation` 为空, 错误记录在 `load_error` 中,
/// 以便损坏的任务仍然可以被查看。
#[derive(Debug, Clone, PartialEq)]
pub struct JobData {
    pub invocation: Option<InvocationData>,
    pub arguments: String,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub load_error: Option<String>,
}

impl JobData {
    pub fn is_loadable(&self) -> bool {
        self.load_error.is_none()
    }
}

/// 状态读模型, 同时作为写入新状态时的输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub name: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl StateData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: HashMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// 服务器注册时上报的处理能力
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    pub workers: u32,
    pub queues: Vec<String>,
}

/// 哈希批量合并的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashMergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl HashMergeOutcome {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_data_roundtrip() {
        let invocation = InvocationData::new("Billing.Invoices", "Send")
            .with_parameter_types(vec!["System.Int32".to_string()]);
        let payload = invocation.serialize().unwrap();
        assert_eq!(InvocationData::deserialize(&payload).unwrap(), invocation);
    }

    #[test]
    fn test_invocation_data_rejects_garbage() {
        assert!(InvocationData::deserialize("not-json").is_err());
        assert!(InvocationData::deserialize(r#"{"method":"Run"}"#).is_err());
    }

    #[test]
    fn test_state_data_builder() {
        let state = StateData::new("Failed")
            .with_reason("exception")
            .with_data("ExceptionType", "Timeout");
        assert_eq!(state.reason.as_deref(), Some("exception"));
        assert_eq!(state.data.get("ExceptionType").map(String::as_str), Some("Timeout"));
    }

    #[test]
    fn test_no_expiry_sentinel() {
        assert_eq!(no_expiry(), Duration::seconds(-1));
        let outcome = HashMergeOutcome {
            inserted: 1,
            updated: 1,
            unchanged: 3,
        };
        assert_eq!(outcome.writes(), 2);
    }
}
