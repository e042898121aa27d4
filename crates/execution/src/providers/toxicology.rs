//! Toxicology batch provider.
//!
//! Payload: `{ "smiles_list": ["CCO", ...] }`. The unit of work appends one
//! entry per compound to `payload.results`; a compound that cannot be parsed
//! gets an error entry instead of failing the batch.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use molflow_chem::{PropertyCalculator, ToxicityModel};

use crate::checkpoint::CheckpointAccessor;
use crate::provider::{UnitOfWork, ValidationError, WorkError, WorkOutcome};

pub const TOXICOLOGY_BATCH: &str = "toxicology-batch";

/// Checkpoint step holding `{ "completed": n }`.
pub const BATCH_STEP: &str = "toxicology.batch";

pub struct ToxicologyBatch {
    calculator: Arc<dyn PropertyCalculator>,
    chunk_size: Option<usize>,
}

impl std::fmt::Debug for ToxicologyBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToxicologyBatch")
            .field("calculator", &self.calculator.name())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl Default for ToxicologyBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ToxicologyBatch {
    pub fn new() -> Self {
        Self::with_calculator(Arc::new(ToxicityModel::new()))
    }

    pub fn with_calculator(calculator: Arc<dyn PropertyCalculator>) -> Self {
        Self {
            calculator,
            chunk_size: None,
        }
    }

    /// Compute at most `chunk_size` compounds per attempt, suspending in between.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }
}

fn smiles_list(payload: &JsonValue) -> Result<Vec<String>, ValidationError> {
    let list = payload
        .as_object()
        .ok_or_else(|| ValidationError::new("payload must be a JSON object"))?
        .get("smiles_list")
        .ok_or_else(|| ValidationError::new("missing required field 'smiles_list'"))?
        .as_array()
        .ok_or_else(|| ValidationError::new("'smiles_list' must be an array"))?;

    if list.is_empty() {
        return Err(ValidationError::new("'smiles_list' must not be empty"));
    }

    list.iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| ValidationError::new(format!("'smiles_list[{i}]' must be a string")))
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One result slot. A calculator error or panic marks only this compound.
fn item_result(calculator: &dyn PropertyCalculator, index: usize, smiles: &str) -> JsonValue {
    let outcome = catch_unwind(AssertUnwindSafe(|| calculator.calculate(smiles)))
        .map_err(|payload| format!("calculator panicked: {}", panic_message(payload.as_ref())))
        .and_then(|result| result.map_err(|e| e.to_string()));

    match outcome {
        Ok(properties) => json!({
            "index": index,
            "smiles": smiles,
            "status": "ok",
            "properties": properties,
        }),
        Err(error) => json!({
            "index": index,
            "smiles": smiles,
            "status": "error",
            "error": error,
            "properties": JsonValue::Null,
        }),
    }
}

#[async_trait]
impl UnitOfWork for ToxicologyBatch {
    fn name(&self) -> &str {
        TOXICOLOGY_BATCH
    }

    fn validate(&self, payload: &JsonValue) -> Result<(), ValidationError> {
        smiles_list(payload).map(|_| ())
    }

    async fn execute(
        &self,
        mut payload: JsonValue,
        checkpoints: &mut CheckpointAccessor,
    ) -> Result<WorkOutcome, WorkError> {
        let smiles = smiles_list(&payload).map_err(|e| WorkError::permanent(e.to_string()))?;
        let total = smiles.len();

        let mut results: Vec<JsonValue> = payload
            .get("results")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let completed = checkpoints
            .latest(BATCH_STEP)
            .and_then(|data| data.get("completed"))
            .and_then(JsonValue::as_u64)
            .map_or(0, |n| n as usize);
        // Results and checkpoint are committed together; trust whichever is shorter.
        let start = completed.min(results.len()).min(total);
        results.truncate(start);

        let end = match self.chunk_size {
            Some(chunk) => (start + chunk).min(total),
            None => total,
        };
        debug!(
            execution_id = %checkpoints.execution_id(),
            start,
            end,
            total,
            "computing toxicology chunk"
        );

        let chunk: Vec<(usize, String)> = smiles
            .into_iter()
            .enumerate()
            .skip(start)
            .take(end - start)
            .collect();
        let calculator = Arc::clone(&self.calculator);
        let computed = tokio::task::spawn_blocking(move || {
            chunk
                .iter()
                .map(|(index, smiles)| item_result(calculator.as_ref(), *index, smiles))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| WorkError::transient(format!("toxicity computation crashed: {e}")))?;
        results.extend(computed);

        let document = payload
            .as_object_mut()
            .ok_or_else(|| WorkError::permanent("payload must be a JSON object"))?;
        document.insert("results".to_string(), JsonValue::Array(results));
        document.insert(
            "calculator".to_string(),
            JsonValue::String(self.calculator.name().to_string()),
        );
        checkpoints.record(BATCH_STEP, json!({ "completed": end }));

        if end < total {
            Ok(WorkOutcome::Suspended(payload))
        } else {
            Ok(WorkOutcome::Completed(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molflow_core::ExecutionId;

    #[test]
    fn validation_requires_a_non_empty_string_list() {
        let batch = ToxicologyBatch::new();
        assert!(batch.validate(&json!({"smiles_list": ["CCO"]})).is_ok());
        assert!(batch.validate(&json!({"smiles_list": []})).is_err());
        assert!(batch.validate(&json!({"smiles_list": "CCO"})).is_err());
        assert!(batch.validate(&json!({"smiles_list": ["CCO", 4]})).is_err());
        assert!(batch.validate(&json!({"compounds": ["CCO"]})).is_err());
        assert!(batch.validate(&json!(["CCO"])).is_err());
    }

    #[tokio::test]
    async fn invalid_compound_is_marked_not_fatal() {
        let batch = ToxicologyBatch::new();
        let mut checkpoints = CheckpointAccessor::empty(ExecutionId::new(), 2);

        let outcome = batch
            .execute(json!({"smiles_list": ["CCO", "C1CC", "c1ccccc1"]}), &mut checkpoints)
            .await
            .unwrap();
        let WorkOutcome::Completed(payload) = outcome else {
            panic!("expected completion");
        };

        let results = payload["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["status"], "ok");
        assert!(results[0]["properties"]["LD50"].is_number());
        assert_eq!(results[1]["status"], "error");
        assert!(results[1]["properties"].is_null());
        assert_eq!(results[2]["index"], 2);
        assert_eq!(checkpoints.latest(BATCH_STEP), Some(&json!({"completed": 3})));
    }

    struct Exploding;

    impl PropertyCalculator for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn calculate(
            &self,
            smiles: &str,
        ) -> Result<serde_json::Map<String, JsonValue>, molflow_chem::ChemError> {
            if smiles == "boom" {
                panic!("calculator bug");
            }
            ToxicityModel::new().calculate(smiles)
        }
    }

    #[tokio::test]
    async fn calculator_panic_is_confined_to_its_item() {
        let batch = ToxicologyBatch::with_calculator(Arc::new(Exploding));
        let mut checkpoints = CheckpointAccessor::empty(ExecutionId::new(), 2);

        let outcome = batch
            .execute(json!({"smiles_list": ["CCO", "boom", "CCN"]}), &mut checkpoints)
            .await
            .unwrap();
        let WorkOutcome::Completed(payload) = outcome else {
            panic!("expected completion");
        };

        let results = payload["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1]["status"], "error");
        assert!(results[1]["error"].as_str().unwrap().contains("calculator bug"));
        assert_eq!(results[0]["status"], "ok");
        assert_eq!(results[2]["status"], "ok");
    }

    #[tokio::test]
    async fn chunked_batch_suspends_and_resumes_from_checkpoint() {
        let batch = ToxicologyBatch::new().with_chunk_size(2);
        let id = ExecutionId::new();
        let mut first = CheckpointAccessor::empty(id, 2);

        let outcome = batch
            .execute(json!({"smiles_list": ["C", "CC", "CCC"]}), &mut first)
            .await
            .unwrap();
        let WorkOutcome::Suspended(partial) = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(partial["results"].as_array().unwrap().len(), 2);

        let mut second = CheckpointAccessor::empty(id, 4);
        second.record(BATCH_STEP, first.latest(BATCH_STEP).unwrap().clone());
        let outcome = batch.execute(partial, &mut second).await.unwrap();
        let WorkOutcome::Completed(done) = outcome else {
            panic!("expected completion");
        };
        let smiles: Vec<_> = done["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["smiles"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(smiles, vec!["C", "CC", "CCC"]);
    }
}
