//! 入库服务错误类型
//!
//! 重复记录不是错误：条件写入失败由存储层以 `InsertOutcome::AlreadyExists` 返回。
//! 这里只定义需要交给投递层重投的失败：消息格式错误和非重复类的存储错误。

use std::fmt;

use thiserror::Error;

/// 存储层错误（条件检查失败除外）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// 连接失败、连接池耗尽、网络中断
    #[error("存储不可用: {0}")]
    Unavailable(String),

    /// 认证或授权失败
    #[error("存储认证失败: {0}")]
    AuthFailure(String),

    /// 限流、资源不足或并发冲突
    #[error("存储限流: {0}")]
    Throttled(String),

    /// 存储拒绝了写入（约束或数据错误）
    #[error("存储拒绝写入: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "STORE_UNAVAILABLE",
            Self::AuthFailure(_) => "STORE_AUTH_FAILURE",
            Self::Throttled(_) => "STORE_THROTTLED",
            Self::Rejected(_) => "STORE_REJECTED",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                classify_sqlstate(&code, err.to_string())
            }
            _ => Self::Rejected(err.to_string()),
        }
    }
}

/// 按 SQLSTATE 对数据库错误分类
fn classify_sqlstate(code: &str, message: String) -> StoreError {
    match code {
        // invalid_authorization_specification / invalid_password / insufficient_privilege
        "28000" | "28P01" | "42501" => StoreError::AuthFailure(message),
        // too_many_connections / configuration_limit_exceeded / cannot_connect_now
        // serialization_failure / deadlock_detected / lock_not_available / query_canceled
        "53300" | "53400" | "57P03" | "40001" | "40P01" | "55P03" | "57014" => {
            StoreError::Throttled(message)
        }
        // connection_exception 类
        c if c.starts_with("08") => StoreError::Unavailable(message),
        _ => StoreError::Rejected(message),
    }
}

/// 消息解析失败所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStage {
    /// 队列消息 body 无法解析为订阅信封
    Body,
    /// 订阅信封的 Message 字段无法解析为领域事件
    Message,
    /// 领域事件字段校验失败
    Event,
}

impl fmt::Display for PayloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Body => "body",
            Self::Message => "message",
            Self::Event => "event",
        };
        f.write_str(stage)
    }
}

/// 单条记录的处理错误，出现时该记录需要重投
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("消息格式错误: message_id={message_id}, 阶段={stage}, 原因={reason}")]
    MalformedPayload {
        message_id: String,
        stage: PayloadStage,
        reason: String,
    },

    #[error("写入存储失败: message_id={message_id}, order_id={order_id}, {source}")]
    Store {
        message_id: String,
        order_id: String,
        source: StoreError,
    },
}

impl IngestError {
    pub fn malformed(
        message_id: impl Into<String>,
        stage: PayloadStage,
        reason: impl fmt::Display,
    ) -> Self {
        Self::MalformedPayload {
            message_id: message_id.into(),
            stage,
            reason: reason.to_string(),
        }
    }

    /// 出错记录的原始标识，任何阶段都可用
    pub fn message_id(&self) -> &str {
        match self {
            Self::MalformedPayload { message_id, .. } | Self::Store { message_id, .. } => {
                message_id
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::Store { source, .. } => source.code(),
        }
    }
}
