use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker operation exceeded its {0:?} deadline")]
    Deadline(std::time::Duration),
}
