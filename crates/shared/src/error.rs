//! 统一错误处理模块
//!
//! 定义各服务共享的基础设施错误类型，使用 thiserror 提供良好的错误信息。
//! 业务层错误（如入库失败的分类）由各服务自行定义并透传本类型。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum SavannahError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 配置与序列化错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SavannahError>;

impl SavannahError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有基础设施的瞬时故障值得重试；配置和序列化错误重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = SavannahError::Kafka("broker 不可达".to_string());
        assert_eq!(err.code(), "KAFKA_ERROR");
        assert_eq!(err.to_string(), "Kafka 错误: broker 不可达");

        let err = SavannahError::Internal("unexpected".to_string());
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = SavannahError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let kafka_err = SavannahError::Kafka("超时".to_string());
        assert!(kafka_err.is_retryable());

        let serde_err: SavannahError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(!serde_err.is_retryable());
        assert_eq!(serde_err.code(), "SERIALIZATION_ERROR");
    }
}
