//! 死信队列与延迟重投
//!
//! 入库失败的消息连同已重投次数写入死信 topic，并按退避策略算好下次重投时间。
//! 死信消费者到期后把原始负载发回来源 topic，重投次数加一写入消息头；
//! 次数用尽的消息只记录错误日志，停留在死信 topic 等待人工处理。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::SavannahError;
use crate::kafka::{ConsumerMessage, KafkaConsumer, MessagePublisher, OutgoingMessage, headers};
use crate::retry::{RetryPolicy, retry_with_policy};

/// 死信 topic 中的消息体，原始负载原样保存在 `payload` 中
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始记录标识
    pub message_id: String,
    /// 原始 topic
    pub source_topic: String,
    /// 原始消息内容
    pub payload: String,
    /// 失败原因
    pub error: String,
    /// 该消息失败前已被重投的次数
    pub retry_count: u32,
    pub max_retries: u32,
    pub failed_at: DateTime<Utc>,
    /// 下次重投时间（None 表示不再重投）
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    /// 创建新的死信消息，默认不安排重投，需调用 [`Self::scheduled`]
    pub fn new(
        message_id: impl Into<String>,
        source_topic: impl Into<String>,
        payload: impl Into<String>,
        error: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_topic: source_topic.into(),
            payload: payload.into(),
            error: error.into(),
            retry_count: 0,
            max_retries: 0,
            failed_at: Utc::now(),
            next_retry_at: None,
            source_service: source_service.into(),
        }
    }

    /// 按退避策略安排下一次重投
    ///
    /// `retry_count` 为失败前已重投的次数；已达上限时 next_retry_at 置为 None。
    pub fn scheduled(mut self, retry_count: u32, retry_policy: &RetryPolicy) -> Self {
        self.retry_count = retry_count;
        self.max_retries = retry_policy.max_retries;

        self.next_retry_at = if retry_policy.should_retry(retry_count) {
            let delay = retry_policy.delay_for_attempt(retry_count);
            Some(self.failed_at + chrono::Duration::from_std(delay).unwrap_or_default())
        } else {
            None
        };
        self
    }

    /// 是否应继续重投
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries && self.next_retry_at.is_some()
    }

    /// 距离计划重投时间还需等待多久，已到期返回零
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.next_retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default()
    }
}

/// 把处理失败的消息写入死信 topic
#[derive(Clone)]
pub struct DlqProducer {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    source_service: String,
    retry_policy: RetryPolicy,
}

impl DlqProducer {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        topic: &str,
        source_service: &str,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            publisher,
            topic: topic.to_string(),
            source_service: source_service.to_string(),
            retry_policy,
        }
    }

    /// `retry_count` 为该消息已被重投的次数，首次投递为 0
    pub async fn send_to_dlq(
        &self,
        message_id: &str,
        source_topic: &str,
        payload: &str,
        error: &str,
        retry_count: u32,
    ) -> Result<(), SavannahError> {
        let dlq_msg =
            DeadLetterMessage::new(message_id, source_topic, payload, error, &self.source_service)
                .scheduled(retry_count, &self.retry_policy);

        let payload = serde_json::to_vec(&dlq_msg)?;
        self.publisher
            .send(OutgoingMessage::new(&self.topic, message_id, payload))
            .await?;

        warn!(
            message_id,
            source_topic,
            error,
            retry_count,
            next_retry_at = ?dlq_msg.next_retry_at,
            "消息已发送到死信队列"
        );

        Ok(())
    }
}

/// 死信 topic 的消费者，负责到期重投
pub struct DlqConsumer {
    consumer: KafkaConsumer,
    /// 将待重投的消息发回原始 topic
    retry_publisher: Arc<dyn MessagePublisher>,
    /// 重投时 Kafka 发送本身的重试策略
    publish_policy: RetryPolicy,
}

impl DlqConsumer {
    /// 消费组为 `{consumer_group}.dlq`，offset 与配送事件消费者分开提交
    pub fn new(
        config: &AppConfig,
        retry_publisher: Arc<dyn MessagePublisher>,
    ) -> Result<Self, SavannahError> {
        let consumer = KafkaConsumer::new(&config.kafka, Some("dlq"))?;
        consumer.subscribe(&[config.kafka.dead_letter_topic.as_str()])?;

        info!(
            topic = %config.kafka.dead_letter_topic,
            "DLQ 消费者已创建"
        );

        Ok(Self {
            consumer,
            retry_publisher,
            publish_policy: RetryPolicy::default(),
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let retry_publisher = self.retry_publisher;
        let publish_policy = self.publish_policy;

        self.consumer
            .start(shutdown, |msg| {
                let publisher = retry_publisher.as_ref();
                let policy = &publish_policy;
                async move { handle_dlq_message(&msg, publisher, policy).await }
            })
            .await;

        info!("死信消费者已停止");
    }
}

/// 到期重投一条死信消息
///
/// - 仍可重投 → 等待到计划时间，把原始 payload 连同递增后的重投次数发回 source_topic
/// - 不可重投 → 记录错误日志，需要人工介入处理
///
/// 等待时间受退避上限约束，期间消费循环不会拉取新的死信消息；
/// 关闭信号会打断等待，该死信消息的 offset 不前移。
async fn handle_dlq_message(
    msg: &ConsumerMessage,
    publisher: &dyn MessagePublisher,
    publish_policy: &RetryPolicy,
) -> Result<(), SavannahError> {
    let dlq_msg: DeadLetterMessage = msg.json()?;

    if !dlq_msg.should_retry() {
        error!(
            message_id = %dlq_msg.message_id,
            source_topic = %dlq_msg.source_topic,
            source_service = %dlq_msg.source_service,
            retry_count = dlq_msg.retry_count,
            max_retries = dlq_msg.max_retries,
            failed_at = %dlq_msg.failed_at,
            error = %dlq_msg.error,
            "死信消息已耗尽重投次数，需人工介入"
        );
        return Ok(());
    }

    let wait = dlq_msg.remaining_delay(Utc::now());
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }

    let next_count = dlq_msg.retry_count + 1;
    let redelivery = OutgoingMessage::new(
        &dlq_msg.source_topic,
        &dlq_msg.message_id,
        dlq_msg.payload.as_bytes(),
    )
    .with_header(headers::REDELIVERY_COUNT, next_count.to_string());
    info!(
        message_id = %dlq_msg.message_id,
        source_topic = %dlq_msg.source_topic,
        redelivery = next_count,
        max_retries = dlq_msg.max_retries,
        "重投死信消息到原始 topic"
    );

    retry_with_policy(
        publish_policy,
        "dlq_redeliver",
        SavannahError::is_retryable,
        || publisher.send(redelivery.clone()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MockMessagePublisher;
    use std::time::Duration;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_new_message_is_not_scheduled() {
        let msg = DeadLetterMessage::new(
            "msg-001",
            "savannah.delivery.events",
            r#"{"Message":"{}"}"#,
            "存储不可用",
            "ingestion-worker",
        );

        assert_eq!(msg.message_id, "msg-001");
        assert_eq!(msg.source_topic, "savannah.delivery.events");
        assert_eq!(msg.error, "存储不可用");
        assert_eq!(msg.retry_count, 0);
        // 未安排重投前不应重投
        assert!(msg.next_retry_at.is_none());
        assert!(!msg.should_retry());
    }

    #[test]
    fn test_scheduled_first_failure() {
        let msg = DeadLetterMessage::new("msg-001", "topic", "payload", "error", "svc")
            .scheduled(0, &policy(3));

        assert!(msg.should_retry());
        assert_eq!(msg.max_retries, 3);
        let next = msg.next_retry_at.unwrap();
        assert_eq!(next - msg.failed_at, chrono::Duration::seconds(1));
    }

    #[test]
    fn test_scheduled_backoff_grows_with_retry_count() {
        let msg = DeadLetterMessage::new("msg-001", "topic", "payload", "error", "svc")
            .scheduled(2, &policy(3));

        assert!(msg.should_retry());
        let next = msg.next_retry_at.unwrap();
        assert_eq!(next - msg.failed_at, chrono::Duration::seconds(4));
    }

    #[test]
    fn test_scheduled_at_limit_stops_retrying() {
        let msg = DeadLetterMessage::new("msg-001", "topic", "payload", "error", "svc")
            .scheduled(3, &policy(3));

        assert!(msg.next_retry_at.is_none());
        assert!(!msg.should_retry());
    }

    #[test]
    fn test_remaining_delay() {
        let msg = DeadLetterMessage::new("msg-001", "topic", "payload", "error", "svc")
            .scheduled(0, &policy(3));

        let remaining = msg.remaining_delay(msg.failed_at);
        assert_eq!(remaining, Duration::from_secs(1));

        // 已过期的计划时间不再等待
        let later = msg.failed_at + chrono::Duration::seconds(10);
        assert!(msg.remaining_delay(later).is_zero());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let msg = DeadLetterMessage::new(
            "msg-002",
            "savannah.delivery.events",
            r#"{"Message":"..."}"#,
            "数据库连接失败",
            "ingestion-worker",
        )
        .scheduled(1, &policy(5));

        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("messageId"));
        assert!(json.contains("sourceTopic"));
        assert!(json.contains("retryCount"));
        assert!(json.contains("nextRetryAt"));
        assert!(json.contains("sourceService"));

        let deserialized: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.message_id, "msg-002");
        assert_eq!(deserialized.retry_count, 1);
        assert_eq!(deserialized.max_retries, 5);
        assert!(deserialized.should_retry());
    }

    fn fast_publish_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn dlq_record(dlq_msg: &DeadLetterMessage) -> ConsumerMessage {
        ConsumerMessage {
            topic: "savannah.delivery.dlq".to_string(),
            partition: 0,
            offset: 3,
            key: Some(dlq_msg.message_id.clone()),
            payload: serde_json::to_vec(dlq_msg).unwrap(),
            timestamp: None,
            headers: Default::default(),
        }
    }

    fn due_message(retry_count: u32) -> DeadLetterMessage {
        let mut msg = DeadLetterMessage::new(
            "msg-7",
            "savannah.delivery.events",
            r#"{"Message":"{}"}"#,
            "存储不可用",
            "ingestion-worker",
        )
        .scheduled(retry_count, &policy(3));
        msg.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        msg
    }

    #[tokio::test]
    async fn test_send_to_dlq_carries_redelivery_count() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_send()
            .withf(|m| {
                let dlq_msg: DeadLetterMessage = serde_json::from_slice(&m.payload).unwrap();
                m.topic == "savannah.delivery.dlq"
                    && m.key == "msg-7"
                    && dlq_msg.source_topic == "savannah.delivery.events"
                    && dlq_msg.retry_count == 1
                    && dlq_msg.max_retries == 3
                    && dlq_msg.next_retry_at.is_some()
            })
            .times(1)
            .returning(|_| Ok(()));

        let producer = DlqProducer::new(
            Arc::new(publisher),
            "savannah.delivery.dlq",
            "ingestion-worker",
            policy(3),
        );
        producer
            .send_to_dlq("msg-7", "savannah.delivery.events", "{}", "存储不可用", 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_to_dlq_failure_is_returned() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_send()
            .returning(|_| Err(SavannahError::Kafka("超时".to_string())));

        let producer = DlqProducer::new(Arc::new(publisher), "dlq", "svc", policy(3));
        let result = producer.send_to_dlq("msg-7", "topic", "{}", "error", 0).await;
        assert!(matches!(result, Err(SavannahError::Kafka(_))));
    }

    #[tokio::test]
    async fn test_due_message_is_redelivered_with_incremented_count() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_send()
            .withf(|m| {
                m.topic == "savannah.delivery.events"
                    && m.key == "msg-7"
                    && m.payload.as_slice() == br#"{"Message":"{}"}"#.as_slice()
                    && m.header(headers::REDELIVERY_COUNT) == Some("2")
            })
            .times(1)
            .returning(|_| Ok(()));

        let msg = dlq_record(&due_message(1));
        handle_dlq_message(&msg, &publisher, &fast_publish_policy())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_message_is_parked() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_send().never();

        let msg = dlq_record(&due_message(3));
        handle_dlq_message(&msg, &publisher, &fast_publish_policy())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redelivery_publish_retries_then_fails() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_send()
            .times(3)
            .returning(|_| Err(SavannahError::Kafka("broker 不可达".to_string())));

        let msg = dlq_record(&due_message(0));
        let result = handle_dlq_message(&msg, &publisher, &fast_publish_policy()).await;
        assert!(matches!(result, Err(SavannahError::Kafka(_))));
    }

    #[tokio::test]
    async fn test_unreadable_dead_letter_is_rejected() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_send().never();

        let mut msg = dlq_record(&due_message(0));
        msg.payload = b"not json".to_vec();
        let err = handle_dlq_message(&msg, &publisher, &fast_publish_policy())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
