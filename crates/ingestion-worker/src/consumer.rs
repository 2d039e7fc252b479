//! Kafka 投递适配
//!
//! 把 Kafka 消息转换为队列信封交给 IngestionWorker 处理。
//! 处理失败的消息连同重投次数写入死信队列，由 DlqConsumer 按退避策略重投，
//! 超过上限后停留在死信队列等待人工介入。

use savannah_shared::config::AppConfig;
use savannah_shared::dlq::DlqProducer;
use savannah_shared::error::SavannahError;
use savannah_shared::kafka::{ConsumerMessage, KafkaConsumer};
use tokio::sync::watch;
use tracing::{error, info};

use crate::envelope::Envelope;
use crate::error::{IngestError, PayloadStage};
use crate::worker::{IngestionWorker, RecordOutcome};

/// 配送事件消费者
///
/// 组合 KafkaConsumer（消息拉取）、IngestionWorker（幂等入库）
/// 和 DlqProducer（失败消息投递）三个组件，形成完整的消费管道。
pub struct DeliveryConsumer {
    consumer: KafkaConsumer,
    topic: String,
    worker: IngestionWorker,
    dlq: DlqProducer,
}

impl DeliveryConsumer {
    pub fn new(
        config: &AppConfig,
        worker: IngestionWorker,
        dlq: DlqProducer,
    ) -> Result<Self, SavannahError> {
        let consumer = KafkaConsumer::new(&config.kafka, None)?;
        Ok(Self {
            consumer,
            topic: config.kafka.delivery_topic.clone(),
            worker,
            dlq,
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), SavannahError> {
        self.consumer.subscribe(&[self.topic.as_str()])?;

        info!(topic = %self.topic, "配送事件消费者已启动");

        let worker = self.worker;
        let dlq = self.dlq;

        self.consumer
            .start(shutdown, |msg| {
                let worker = &worker;
                let dlq = &dlq;
                async move { handle_message(worker, dlq, &msg).await }
            })
            .await;

        info!("配送事件消费者已停止");
        Ok(())
    }
}

/// 把 Kafka 消息转换为队列信封
///
/// 记录标识优先使用消息 key，没有 key 时使用 topic-partition-offset。
pub fn envelope_from_message(msg: &ConsumerMessage) -> Result<Envelope, IngestError> {
    let message_id = msg.key.clone().unwrap_or_else(|| msg.coordinate());
    let body = msg
        .payload_str()
        .map_err(|e| IngestError::malformed(&message_id, PayloadStage::Body, e))?;
    Ok(Envelope::new(message_id, body))
}

/// 单条 Kafka 消息的入库流程
pub async fn ingest_message(
    worker: &IngestionWorker,
    msg: &ConsumerMessage,
) -> Result<RecordOutcome, IngestError> {
    let envelope = envelope_from_message(msg)?;
    worker.process_record(&envelope).await
}

/// 处理单条消息，失败时写入死信队列
///
/// 只有死信队列写入本身失败时才返回错误，消费循环据此重试该消息且不前移 offset。
async fn handle_message(
    worker: &IngestionWorker,
    dlq: &DlqProducer,
    msg: &ConsumerMessage,
) -> Result<(), SavannahError> {
    let Err(err) = ingest_message(worker, msg).await else {
        return Ok(());
    };

    let payload = String::from_utf8_lossy(&msg.payload);
    let redelivery_count = msg.redelivery_count();

    dlq.send_to_dlq(
        err.message_id(),
        &msg.topic,
        &payload,
        &err.to_string(),
        redelivery_count,
    )
    .await
    .inspect_err(|e| {
        error!(
            message_id = %err.message_id(),
            partition = msg.partition,
            offset = msg.offset,
            error = %e,
            "发送到死信队列失败"
        );
    })
}
