//! Kafka 客户端
//!
//! 投递层的 Kafka 绑定：配送事件从 delivery topic 消费，失败消息写入死信 topic，
//! 死信消费者再把到期的消息带着重投次数发回 delivery topic。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::SavannahError;
use crate::retry::RetryPolicy;

/// 默认 topic，实际名称以 [`KafkaConfig`] 为准
pub mod topics {
    pub const DELIVERY_EVENTS: &str = "savannah.delivery.events";
    pub const DEAD_LETTER_QUEUE: &str = "savannah.delivery.dlq";
}

pub mod headers {
    /// 消息已被重投的次数，首次投递时不带此头
    pub const REDELIVERY_COUNT: &str = "x-redelivery-count";
}

/// 发送超时，超时后由调用方的重试策略接管
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// 拥有所有权的 Kafka 消息，可以跨 await 传给处理函数
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// 非 UTF-8 的 key 视为没有 key
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    /// 只保留值为 UTF-8 的消息头
    pub headers: HashMap<String, String>,
}

impl From<&BorrowedMessage<'_>> for ConsumerMessage {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|h| {
                h.iter()
                    .filter_map(|header| {
                        let value = std::str::from_utf8(header.value?).ok()?;
                        Some((header.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg
                .key()
                .and_then(|k| std::str::from_utf8(k).ok())
                .map(String::from),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }
}

impl ConsumerMessage {
    /// `topic-partition-offset`，集群内唯一
    pub fn coordinate(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }

    /// 已重投次数；没有该消息头或无法解析时为 0
    pub fn redelivery_count(&self) -> u32 {
        self.headers
            .get(headers::REDELIVERY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn payload_str(&self) -> Result<&str, SavannahError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| SavannahError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 把 JSON 负载解析为 `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SavannahError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Kafka 生产者，克隆后共享同一个底层连接
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, SavannahError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string())
            .create()
            .map_err(|e| SavannahError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已创建");
        Ok(Self { producer })
    }

    /// 发送一条消息，返回写入的 (partition, offset)
    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<(i32, i64), SavannahError> {
        let headers = headers
            .iter()
            .fold(OwnedHeaders::new(), |acc, &(name, value)| {
                acc.insert(Header {
                    key: name,
                    value: Some(value),
                })
            });
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        let delivery = self
            .producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| SavannahError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }
}

/// 一条待发送的消息
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// 消息发送端
///
/// 死信写入和到期重投都只依赖这个 trait，生产环境由 [`KafkaProducer`] 实现。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SavannahError>;
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SavannahError> {
        let headers: Vec<(&str, &str)> = message
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        self.publish(&message.topic, &message.key, &message.payload, &headers)
            .await?;
        Ok(())
    }
}

/// 一条消息交给处理函数后的最终去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 处理完成（或确认无法通过重试完成），可以提交 offset
    Settled,
    /// 收到关闭信号时仍未完成，offset 不提交，重启后重新消费
    Interrupted,
}

/// 反复执行 `handler` 直到消息有最终结果
///
/// 可重试的错误按 `policy` 的退避间隔无限重试（间隔封顶 `max_delay`）；
/// 不可重试的错误记录日志后视为已处理。处理与等待都随时可被关闭信号打断。
pub async fn settle_message<F, Fut>(
    msg: &ConsumerMessage,
    handler: &F,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Disposition
where
    F: Fn(ConsumerMessage) -> Fut,
    Fut: Future<Output = Result<(), SavannahError>>,
{
    let coordinate = msg.coordinate();
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => return Disposition::Interrupted,
            result = handler(msg.clone()) => result,
        };

        let err = match result {
            Ok(()) => return Disposition::Settled,
            Err(err) => err,
        };

        if !err.is_retryable() {
            error!(
                coordinate = %coordinate,
                error = %err,
                error_code = err.code(),
                "消息处理失败且不可重试，跳过"
            );
            return Disposition::Settled;
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        warn!(
            coordinate = %coordinate,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            error_code = err.code(),
            "消息处理失败，等待后重试"
        );

        tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => return Disposition::Interrupted,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Kafka 消费者
///
/// offset 只在消息处理完成后存储，由自动提交周期性提交已存储的 offset。
/// 处理中途崩溃或被关闭的消息会在重启后重新消费。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    group_id: String,
    retry_policy: RetryPolicy,
}

impl KafkaConsumer {
    /// `group_id_suffix` 给同一服务内的另一条消费链路一个独立消费组，
    /// 例如死信消费者使用 `savannah-ingestion.dlq`
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, SavannahError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{suffix}", config.consumer_group),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| SavannahError::Kafka(format!("创建消费者失败: {e}")))?;

        Ok(Self {
            consumer,
            group_id,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), SavannahError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| SavannahError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(group_id = %self.group_id, ?topics, "已订阅");
        Ok(())
    }

    /// 逐条消费直到 `shutdown` 变为 true
    ///
    /// 消息按到达顺序串行交给 `handler`，见 [`settle_message`]。
    /// 只有处理完成的消息才会前移 offset。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: Future<Output = Result<(), SavannahError>>,
    {
        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        loop {
            let received = tokio::select! {
                biased;

                // 发送端被丢弃同样视为关闭
                _ = shutdown.wait_for(|stop| *stop) => break,
                received = stream.next() => received,
            };

            let msg = match received {
                Some(Ok(borrowed)) => ConsumerMessage::from(&borrowed),
                Some(Err(e)) => {
                    error!(group_id = %self.group_id, error = %e, "接收消息出错");
                    continue;
                }
                None => {
                    warn!(group_id = %self.group_id, "消息流已结束");
                    break;
                }
            };

            debug!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "收到消息"
            );

            match settle_message(&msg, &handler, &self.retry_policy, &mut shutdown).await {
                Disposition::Settled => {
                    if let Err(e) = self.store_offset(&msg) {
                        warn!(coordinate = %msg.coordinate(), error = %e, "存储 offset 失败");
                    }
                }
                Disposition::Interrupted => {
                    info!(coordinate = %msg.coordinate(), "处理被关闭信号打断，offset 未前移");
                    break;
                }
            }
        }

        info!(group_id = %self.group_id, "消费循环已退出");
    }

    /// 存储下一条待消费的 offset，随下一次自动提交生效
    fn store_offset(&self, msg: &ConsumerMessage) -> KafkaResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))?;
        self.consumer.store_offsets(&tpl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn message(payload: &[u8], headers: HashMap<String, String>) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::DELIVERY_EVENTS.to_string(),
            partition: 2,
            offset: 42,
            key: None,
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers,
        }
    }

    fn with_redelivery(value: &str) -> HashMap<String, String> {
        HashMap::from([(headers::REDELIVERY_COUNT.to_string(), value.to_string())])
    }

    #[test]
    fn test_coordinate() {
        let msg = message(b"{}", HashMap::new());
        assert_eq!(msg.coordinate(), "savannah.delivery.events-2-42");
    }

    #[test]
    fn test_redelivery_count() {
        assert_eq!(message(b"{}", HashMap::new()).redelivery_count(), 0);
        assert_eq!(message(b"{}", with_redelivery("2")).redelivery_count(), 2);
        assert_eq!(message(b"{}", with_redelivery("abc")).redelivery_count(), 0);
        assert_eq!(message(b"{}", with_redelivery("-1")).redelivery_count(), 0);
    }

    #[test]
    fn test_json_payload() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct OrderRef {
            order_id: String,
        }

        let parsed: OrderRef = message(br#"{"order_id":"A1"}"#, HashMap::new())
            .json()
            .unwrap();
        assert_eq!(parsed.order_id, "A1");

        let err = message(b"not json", HashMap::new())
            .json::<OrderRef>()
            .unwrap_err();
        assert!(matches!(err, SavannahError::Serialization(_)));
    }

    #[test]
    fn test_payload_str() {
        assert_eq!(
            message(b"hello", HashMap::new()).payload_str().unwrap(),
            "hello"
        );
        assert!(message(&[0xFF, 0xFE], HashMap::new()).payload_str().is_err());
    }

    #[test]
    fn test_outgoing_message_headers() {
        let msg = OutgoingMessage::new("topic", "key", b"payload".to_vec())
            .with_header(headers::REDELIVERY_COUNT, "2");

        assert_eq!(msg.header(headers::REDELIVERY_COUNT), Some("2"));
        assert_eq!(msg.header("x-other"), None);
    }

    fn fast_policy(max_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            initial_delay: Duration::from_millis(1),
            max_delay,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_settle_retries_until_handler_succeeds() {
        let calls = AtomicU32::new(0);
        let handler = |_msg: ConsumerMessage| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(SavannahError::Kafka("死信 topic 不可写".to_string()))
                } else {
                    Ok(())
                }
            }
        };
        let (_tx, mut shutdown) = watch::channel(false);

        let disposition = settle_message(
            &message(b"{}", HashMap::new()),
            &handler,
            &fast_policy(Duration::from_millis(5)),
            &mut shutdown,
        )
        .await;

        assert_eq!(disposition, Disposition::Settled);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_settle_skips_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let handler = |_msg: ConsumerMessage| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SavannahError::Internal("无法解析".to_string())) }
        };
        let (_tx, mut shutdown) = watch::channel(false);

        let disposition = settle_message(
            &message(b"{}", HashMap::new()),
            &handler,
            &fast_policy(Duration::from_millis(5)),
            &mut shutdown,
        )
        .await;

        assert_eq!(disposition, Disposition::Settled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_slow_handler() {
        let handler = |_msg: ConsumerMessage| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), SavannahError>(())
        };
        let (tx, mut shutdown) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let disposition = tokio::time::timeout(
            Duration::from_secs(5),
            settle_message(
                &message(b"{}", HashMap::new()),
                &handler,
                &fast_policy(Duration::from_millis(5)),
                &mut shutdown,
            ),
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Interrupted);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let handler = |_msg: ConsumerMessage| async {
            Err::<(), _>(SavannahError::Kafka("broker 不可达".to_string()))
        };
        let (tx, mut shutdown) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            ..fast_policy(Duration::from_secs(60))
        };
        let disposition = tokio::time::timeout(
            Duration::from_secs(5),
            settle_message(&message(b"{}", HashMap::new()), &handler, &policy, &mut shutdown),
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Interrupted);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_interrupts() {
        let handler = |_msg: ConsumerMessage| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), SavannahError>(())
        };
        let (tx, mut shutdown) = watch::channel(false);
        drop(tx);

        let disposition = settle_message(
            &message(b"{}", HashMap::new()),
            &handler,
            &fast_policy(Duration::from_millis(5)),
            &mut shutdown,
        )
        .await;

        assert_eq!(disposition, Disposition::Interrupted);
    }
}
