//! 存储端原子脚本的参数定义
//!
//! 每个脚本只在一个分区内执行, 要么全部提交要么全部不生效。
//! 脚本名称和参数结构是与存储之间的协议, 修改参数需要提升 `VERSION`。

use serde::{Deserialize, Serialize};

use crate::entities::{Document, DocumentType, Parameter};
use crate::repositories::DocumentQuery;

pub trait ScriptArgs: Serialize + Send + Sync {
    const NAME: &'static str;
    const VERSION: u32;

    /// 脚本执行所在的分区
    fn partition(&self) -> DocumentType;
}

/// 在任务的参数列表中替换或追加一个参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetJobParameterArgs {
    pub job_id: String,
    pub parameter: Parameter,
}

impl ScriptArgs for SetJobParameterArgs {
    const NAME: &'static str = "setJobParameter";
    const VERSION: u32 = 1;

    fn partition(&self) -> DocumentType {
        DocumentType::Job
    }
}

/// 服务器文档仍存在时更新其心跳时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatServerArgs {
    pub server_document_id: String,
    pub heartbeat: i64,
}

impl ScriptArgs for HeartbeatServerArgs {
    const NAME: &'static str = "heartbeatServer";
    const VERSION: u32 = 1;

    fn partition(&self) -> DocumentType {
        DocumentType::Server
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertDocumentsArgs {
    pub partition: DocumentType,
    pub documents: Vec<Document>,
}

impl UpsertDocumentsArgs {
    /// 所有文档必须属于同一个分区
    pub fn validate(&self) -> Result<(), String> {
        match self
            .documents
            .iter()
            .find(|d| d.doc_type() != self.partition)
        {
            Some(stray) => Err(format!(
                "文档 {} 属于分区 {}, 不能在分区 {} 中写入",
                stray.id(),
                stray.doc_type(),
                self.partition
            )),
            None => Ok(()),
        }
    }
}

impl ScriptArgs for UpsertDocumentsArgs {
    const NAME: &'static str = "upsertDocuments";
    const VERSION: u32 = 1;

    fn partition(&self) -> DocumentType {
        self.partition
    }
}

/// 删除查询命中的所有文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDocumentsArgs {
    pub query: DocumentQuery,
}

impl ScriptArgs for DeleteDocumentsArgs {
    const NAME: &'static str = "deleteDocuments";
    const VERSION: u32 = 1;

    fn partition(&self) -> DocumentType {
        self.query.doc_type
    }
}

/// 在分区内读取查询命中的文档并改写过期时间, `expire_on` 为空表示永不过期
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpireDocumentsArgs {
    pub query: DocumentQuery,
    pub expire_on: Option<i64>,
}

impl ScriptArgs for ExpireDocumentsArgs {
    const NAME: &'static str = "expireDocuments";
    const VERSION: u32 = 1;

    fn partition(&self) -> DocumentType {
        self.query.doc_type
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "script", content = "args", rename_all = "camelCase")]
pub enum ScriptCall {
    SetJobParameter(SetJobParameterArgs),
    HeartbeatServer(HeartbeatServerArgs),
    UpsertDocuments(UpsertDocumentsArgs),
    DeleteDocuments(DeleteDocumentsArgs),
    ExpireDocuments(ExpireDocumentsArgs),
}

impl ScriptCall {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptCall::SetJobParameter(_) => SetJobParameterArgs::NAME,
            ScriptCall::HeartbeatServer(_) => HeartbeatServerArgs::NAME,
            ScriptCall::UpsertDocuments(_) => UpsertDocumentsArgs::NAME,
            ScriptCall::DeleteDocuments(_) => DeleteDocumentsArgs::NAME,
            ScriptCall::ExpireDocuments(_) => ExpireDocumentsArgs::NAME,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            ScriptCall::SetJobParameter(_) => SetJobParameterArgs::VERSION,
            ScriptCall::HeartbeatServer(_) => HeartbeatServerArgs::VERSION,
            ScriptCall::UpsertDocuments(_) => UpsertDocumentsArgs::VERSION,
            ScriptCall::DeleteDocuments(_) => DeleteDocumentsArgs::VERSION,
            ScriptCall::ExpireDocuments(_) => ExpireDocumentsArgs::VERSION,
        }
    }

    pub fn partition(&self) -> DocumentType {
        match self {
            ScriptCall::SetJobParameter(args) => args.partition(),
            ScriptCall::HeartbeatServer(args) => args.partition(),
            ScriptCall::UpsertDocuments(args) => args.partition(),
            ScriptCall::DeleteDocuments(args) => args.partition(),
            ScriptCall::ExpireDocuments(args) => args.partition(),
        }
    }
}

impl From<SetJobParameterArgs> for ScriptCall {
    fn from(args: SetJobParameterArgs) -> Self {
        ScriptCall::SetJobParameter(args)
    }
}

impl From<HeartbeatServerArgs> for ScriptCall {
    fn from(args: HeartbeatServerArgs) -> Self {
        ScriptCall::HeartbeatServer(args)
    }
}

impl From<UpsertDocumentsArgs> for ScriptCall {
    fn from(args: UpsertDocumentsArgs) -> Self {
        ScriptCall::UpsertDocuments(args)
    }
}

impl From<DeleteDocumentsArgs> for ScriptCall {
    fn from(args: DeleteDocumentsArgs) -> Self {
        ScriptCall::DeleteDocuments(args)
    }
}

impl From<ExpireDocumentsArgs> for ScriptCall {
    fn from(args: ExpireDocumentsArgs) -> Self {
        ScriptCall::ExpireDocuments(args)
    }
}

/// 脚本执行结果: 受影响的文档数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub affected: u64,
}

impl ScriptOutcome {
    pub fn affected(affected: u64) -> Self {
        Self { affected }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{HashEntry, ListEntry};
    use chrono::Utc;

    #[test]
    fn test_script_call_metadata() {
        let call: ScriptCall = HeartbeatServerArgs {
            server_document_id: "s".to_string(),
            heartbeat: 10,
        }
        .into();
        assert_eq!(call.name(), "heartbeatServer");
        assert_eq!(call.version(), 1);
        assert_eq!(call.partition(), DocumentType::Server);

        let call: ScriptCall = DeleteDocumentsArgs {
            query: DocumentQuery::of(DocumentType::Counter),
        }
        .into();
        assert_eq!(call.name(), "deleteDocuments");
        assert_eq!(call.partition(), DocumentType::Counter);

        let call: ScriptCall = ExpireDocumentsArgs {
            query: DocumentQuery::of(DocumentType::Hash).with_key("job:1"),
            expire_on: Some(60),
        }
        .into();
        assert_eq!(call.name(), "expireDocuments");
        assert_eq!(call.partition(), DocumentType::Hash);
    }

    #[test]
    fn test_script_call_wire_format() {
        let call: ScriptCall = SetJobParameterArgs {
            job_id: "job-1".to_string(),
            parameter: Parameter {
                name: "RetryCount".to_string(),
                value: Some("2".to_string()),
            },
        }
        .into();

        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["script"], "setJobParameter");
        assert_eq!(json["args"]["job_id"], "job-1");
        assert_eq!(json["args"]["parameter"]["name"], "RetryCount");
    }

    #[test]
    fn test_upsert_rejects_foreign_partition() {
        let now = Utc::now();
        let args = UpsertDocumentsArgs {
            partition: DocumentType::Hash,
            documents: vec![
                HashEntry::new("k", "a", Some("1".to_string()), now).into(),
                ListEntry::new("k", "x", now).into(),
            ],
        };
        assert!(args.validate().is_err());

        let args = UpsertDocumentsArgs {
            partition: DocumentType::Hash,
            documents: vec![HashEntry::new("k", "a", None, now).into()],
        };
        assert!(args.validate().is_ok());
    }
}
