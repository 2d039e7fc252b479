//! 信封解码
//!
//! 队列消息的 body 中是订阅信封，订阅信封的 Message 字段中才是领域事件。
//! 两层反序列化分两步进行，各自失败时报告所在阶段。

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{IngestError, PayloadStage};
use crate::model::DomainEvent;

/// 队列消息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// 投递层分配的记录标识，部分失败时按它回报
    pub message_id: String,
    /// 缺失或不是字符串时为 None，解码时按 body 阶段失败处理
    pub body: Option<String>,
}

/// 一次调用收到的一批队列消息，`{"Records": [...]}`
///
/// 单条记录的形状错误不会让整个批次反序列化失败，而是留到该记录解码时报告。
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvelopeBatch {
    #[serde(rename = "Records")]
    pub records: Vec<Envelope>,
}

impl<'de> Deserialize<'de> for EnvelopeBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct RawBatch {
            #[serde(rename = "Records", default)]
            records: Vec<Value>,
        }

        let raw = RawBatch::deserialize(deserializer)?;
        let records = raw
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| Envelope::from_record(index, record))
            .collect();
        Ok(Self { records })
    }
}

/// 订阅信封，只关心 Message 字段，其余元数据忽略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerEnvelope {
    #[serde(rename = "Message")]
    pub message: String,
}

impl Envelope {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: Some(body.into()),
        }
    }

    /// 从批次中的一条原始记录构造信封
    ///
    /// 没有字符串 messageId 的记录以 `record-{index}` 作为标识。
    pub fn from_record(index: usize, record: &Value) -> Self {
        let message_id = record
            .get("messageId")
            .and_then(Value::as_str)
            .map_or_else(|| format!("record-{index}"), String::from);
        let body = record.get("body").and_then(Value::as_str).map(String::from);
        Self { message_id, body }
    }

    /// 第一步：解析 body 得到订阅信封
    pub fn inner(&self) -> Result<InnerEnvelope, IngestError> {
        let body = self.body.as_deref().ok_or_else(|| {
            IngestError::malformed(&self.message_id, PayloadStage::Body, "body 缺失或不是字符串")
        })?;
        serde_json::from_str(body)
            .map_err(|e| IngestError::malformed(&self.message_id, PayloadStage::Body, e))
    }

    /// 完整解码：body -> 订阅信封 -> 领域事件 -> 字段校验
    pub fn decode(&self) -> Result<DomainEvent, IngestError> {
        let inner = self.inner()?;
        let event = inner.event(&self.message_id)?;
        event
            .validate()
            .map_err(|reason| IngestError::malformed(&self.message_id, PayloadStage::Event, reason))?;
        Ok(event)
    }
}

impl InnerEnvelope {
    /// 第二步：解析 Message 字段得到领域事件
    pub fn event(&self, message_id: &str) -> Result<DomainEvent, IngestError> {
        serde_json::from_str(&self.message)
            .map_err(|e| IngestError::malformed(message_id, PayloadStage::Message, e))
    }
}
