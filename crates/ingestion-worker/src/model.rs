//! 领域模型
//!
//! 配送完成事件与其持久化记录。记录一经创建不再修改。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 配送完成事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub order_id: String,
    pub driver_id: String,
    pub amount: f64,
}

impl DomainEvent {
    /// 字段校验，返回第一个不合法字段的原因
    ///
    /// order_id 是存储主键，driver_id 用于对账，二者都不能为空白。
    pub fn validate(&self) -> Result<(), String> {
        if self.order_id.trim().is_empty() {
            return Err("order_id 不能为空".to_string());
        }
        if self.driver_id.trim().is_empty() {
            return Err("driver_id 不能为空".to_string());
        }
        if !self.amount.is_finite() {
            return Err(format!("amount 不是有限数值: {}", self.amount));
        }
        Ok(())
    }
}

/// 记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Processed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSED" => Ok(Self::Processed),
            other => Err(format!("未知的记录状态: {other}")),
        }
    }
}

/// 持久化的配送记录，以 order_id 为主键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub order_id: String,
    pub driver_id: String,
    pub status: RecordStatus,
    pub amount: f64,
}

impl StoredRecord {
    pub fn processed(event: &DomainEvent) -> Self {
        Self {
            order_id: event.order_id.clone(),
            driver_id: event.driver_id.clone(),
            status: RecordStatus::Processed,
            amount: event.amount,
        }
    }
}
