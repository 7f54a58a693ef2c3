use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use event_bus_cell::{group_consumer, Delivery, EventBus, QueueName};

use crate::models::{Disposition, WorkerConfig};
use crate::services::processor::ConfirmationProcessor;

const CONSUMED_QUEUES: [QueueName; 2] = [QueueName::Created, QueueName::Retry];

/// Consumes `appointment.created` and `appointment.retry` with a fixed number
/// of concurrent consumers until shutdown is signalled.
pub struct ConfirmationWorker {
    bus: Arc<dyn EventBus>,
    processor: Arc<ConfirmationProcessor>,
    config: WorkerConfig,
}

impl ConfirmationWorker {
    pub fn new(bus: Arc<dyn EventBus>, processor: Arc<ConfirmationProcessor>, config: WorkerConfig) -> Self {
        Self { bus, processor, config }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.bus.declare_topology().await?;

        // A previous run may have used more consumers than this one
        match self
            .bus
            .recover_consumer_group(&CONSUMED_QUEUES, &self.config.worker_id)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!("Worker {} recovered {} unacked message(s)", self.config.worker_id, n),
            Err(e) => warn!("Worker {} could not recover unacked messages: {}", self.config.worker_id, e),
        }

        info!(
            "Confirmation worker {} starting {} consumer(s)",
            self.config.worker_id, self.config.concurrency
        );

        let consumers = (0..self.config.concurrency).map(|i| {
            let consumer = group_consumer(&self.config.worker_id, i);
            self.consume_loop(consumer, shutdown.clone())
        });
        join_all(consumers).await;

        info!("Confirmation worker {} stopped", self.config.worker_id);
        Ok(())
    }

    async fn consume_loop(&self, consumer: String, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the wait is cancelled; a delivery in progress always settles.
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.bus.consume(&CONSUMED_QUEUES, &consumer, self.config.poll_wait) => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(&consumer, delivery).await,
                Ok(None) => {}
                Err(e) => {
                    error!("Consumer {} failed to consume: {}", consumer, e);
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        debug!("Consumer {} shutting down", consumer);
    }

    async fn process(&self, consumer: &str, delivery: Delivery) {
        let settled = match self.processor.handle(&delivery).await {
            Ok(Disposition::Rejected(reason)) => {
                warn!("Consumer {} rejected delivery: {}", consumer, reason);
                self.bus.nack(&delivery, false).await
            }
            Ok(disposition) => {
                debug!("Consumer {} finished delivery: {:?}", consumer, disposition);
                self.bus.ack(&delivery).await
            }
            Err(e) => {
                error!("Consumer {} failed processing delivery, requeueing: {}", consumer, e);
                let requeued = self.bus.nack(&delivery, true).await;
                tokio::time::sleep(self.config.error_backoff).await;
                requeued
            }
        };

        if let Err(e) = settled {
            error!("Consumer {} could not settle delivery: {}", consumer, e);
        }
    }
}
