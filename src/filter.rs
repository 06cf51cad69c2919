//! The filter facade and pipeline.
//!
//! Parallel filters run concurrently against the resource with no upstream
//! data; sequential filters run in configured order, each receiving a copy
//! of the previous sequential stage's output. Both append to one
//! append-safe shared result list.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use crate::protocol::FilterRecord;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FilterError(pub String);

/// A named transform applied to a dispatched resource.
///
/// Implementations must be cheap to construct per connection and safe to
/// share across the parallel/sequential stages of one pipeline run (`Arc`'d
/// by the caller).
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// `upstream_data` is `None` for a parallel filter and `Some` (possibly
    /// an empty object for the first stage) for a sequential filter.
    async fn apply(
        &self,
        resource_id: &str,
        response_code: Option<&str>,
        annotation: Option<&str>,
        upstream_data: Option<&Value>,
    ) -> Result<Value, FilterError>;
}

/// Run the configured parallel and sequential filters against one resource
/// and return the combined, order-tagged result list.
pub async fn run_pipeline(
    resource_id: &str,
    response_code: Option<&str>,
    annotation: Option<&str>,
    parallel: &[Arc<dyn Filter>],
    sequential: &[Arc<dyn Filter>],
) -> Result<Vec<FilterRecord>, FilterError> {
    let results = Arc::new(AsyncMutex::new(Vec::with_capacity(
        parallel.len() + sequential.len(),
    )));

    let mut parallel_tasks = JoinSet::new();
    for filter in parallel {
        let filter = Arc::clone(filter);
        let results = Arc::clone(&results);
        let resource_id = resource_id.to_string();
        let response_code = response_code.map(str::to_string);
        let annotation = annotation.map(str::to_string);

        parallel_tasks.spawn(async move {
            let data = filter
                .apply(
                    &resource_id,
                    response_code.as_deref(),
                    annotation.as_deref(),
                    None,
                )
                .await?;
            results.lock().await.push(FilterRecord {
                name: filter.name().to_string(),
                order: None,
                data,
            });
            Ok::<(), FilterError>(())
        });
    }

    // Run the sequential chain concurrently with the parallel tasks above.
    let mut previous = Value::Object(serde_json::Map::new());
    for (index, filter) in sequential.iter().enumerate() {
        let data = filter
            .apply(resource_id, response_code, annotation, Some(&previous))
            .await?;
        results.lock().await.push(FilterRecord {
            name: filter.name().to_string(),
            order: Some(index),
            data: data.clone(),
        });
        previous = data;
    }

    while let Some(outcome) = parallel_tasks.join_next().await {
        match outcome {
            Ok(result) => result?,
            Err(join_err) => return Err(FilterError(format!("filter task panicked: {join_err}"))),
        }
    }

    Ok(Arc::try_unwrap(results)
        .expect("all pipeline tasks have completed by this point")
        .into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl Filter for Echo {
        fn name(&self) -> &str {
            self.0
        }

        async fn apply(
            &self,
            resource_id: &str,
            _response_code: Option<&str>,
            _annotation: Option<&str>,
            upstream_data: Option<&Value>,
        ) -> Result<Value, FilterError> {
            Ok(serde_json::json!({
                "resource": resource_id,
                "upstream": upstream_data,
            }))
        }
    }

    struct Counter(&'static str);

    #[async_trait]
    impl Filter for Counter {
        fn name(&self) -> &str {
            self.0
        }

        async fn apply(
            &self,
            _resource_id: &str,
            _response_code: Option<&str>,
            _annotation: Option<&str>,
            upstream_data: Option<&Value>,
        ) -> Result<Value, FilterError> {
            let prev = upstream_data
                .and_then(|v| v.get("count"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(serde_json::json!({ "count": prev + 1 }))
        }
    }

    #[tokio::test]
    async fn sequential_entries_are_strictly_increasing_and_chained() {
        let sequential: Vec<Arc<dyn Filter>> =
            vec![Arc::new(Counter("inc1")), Arc::new(Counter("inc2"))];
        let records = run_pipeline("r1", None, None, &[], &sequential)
            .await
            .unwrap();

        let mut orders: Vec<usize> = records.iter().filter_map(|r| r.order).collect();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1]);

        let last = records.iter().find(|r| r.order == Some(1)).unwrap();
        assert_eq!(last.data["count"], 2);
    }

    #[tokio::test]
    async fn each_parallel_filter_name_appears_exactly_once_with_no_order() {
        let parallel: Vec<Arc<dyn Filter>> = vec![Arc::new(Echo("a")), Arc::new(Echo("b"))];
        let records = run_pipeline("r1", None, None, &parallel, &[]).await.unwrap();

        assert_eq!(records.len(), 2);
        for name in ["a", "b"] {
            assert_eq!(records.iter().filter(|r| r.name == name).count(), 1);
        }
        assert!(records.iter().all(|r| r.order.is_none()));
    }

    #[tokio::test]
    async fn parallel_filters_receive_no_upstream_data() {
        let parallel: Vec<Arc<dyn Filter>> = vec![Arc::new(Echo("only"))];
        let records = run_pipeline("r1", None, None, &parallel, &[]).await.unwrap();
        assert_eq!(records[0].data["upstream"], Value::Null);
    }
}
