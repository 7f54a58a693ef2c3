use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Connection pool error: {0}")]
    PoolError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Queue {0} is not declared in the topology")]
    UnknownQueue(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Delivery {0} is not held by this consumer")]
    UnknownDelivery(String),
}
