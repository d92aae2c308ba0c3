use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fairq_core::types::Priority;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CollaboratorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub priority: Priority,
    pub batch_size: u32,
    pub concurrency: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

/// External batch-processing service. The processor for `job_type` is
/// resolved on its side.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Returns the batch identifier assigned by the processor.
    async fn submit_batch(
        &self,
        job_type: &str,
        items: Vec<Value>,
        options: &BatchOptions,
    ) -> Result<String, CollaboratorError>;
}

/// Reinterpret a job payload as a list of batch items.
///
/// An array is the list itself; an object carrying an `items` array yields
/// that array; anything else becomes a single item.
pub fn payload_items(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => match obj.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![data.clone()],
        },
        other => vec![other.clone()],
    }
}
