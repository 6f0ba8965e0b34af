use tieralloc_core::TierError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocator error: {0}")]
    Allocator(#[from] TierError),
    #[error("invalid workload: {0}")]
    Workload(String),
}
