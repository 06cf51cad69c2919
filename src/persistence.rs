//! The persistence facade: the abstract contract for resource selection,
//! update and counting that the dispatcher drives.
//!
//! The concrete backend is deliberately out of scope; this module defines
//! the contract plus one in-memory reference implementation used by the
//! default binary and by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// A resource status. The core only assigns meaning to the three symbolic
/// names below; a backend may track additional opaque statuses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceStatus(pub String);

impl ResourceStatus {
    pub fn available() -> Self {
        Self("AVAILABLE".to_string())
    }

    pub fn in_progress() -> Self {
        Self("INPROGRESS".to_string())
    }

    pub fn succeeded() -> Self {
        Self("SUCCEEDED".to_string())
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The next candidate for checkout, as returned by [`Persistence::select_resource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedResource {
    pub id: String,
    pub response_code: Option<String>,
    pub annotation: Option<String>,
}

/// Errors a backend may raise. Propagated to the caller as
/// [`crate::error::Error::Backend`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PersistenceError(pub String);

/// Abstract contract consumed by the dispatcher.
///
/// `select_resource` must be safe to call from one task at a time; the core
/// serializes calls to it with the selection lock rather than requiring
/// internal synchronization here. `update_resource` must be idempotent with
/// respect to redundant writes of the same values.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Returns the next candidate for checkout, or `None` if no more work
    /// will ever be available.
    async fn select_resource(&self) -> Result<Option<SelectedResource>, PersistenceError>;

    /// Transition `id` to `new_status`, recording the submitting client's
    /// response code / annotation / name.
    async fn update_resource(
        &self,
        id: &str,
        new_status: ResourceStatus,
        response_code: Option<String>,
        annotation: Option<String>,
        client_name: Option<String>,
    ) -> Result<(), PersistenceError>;

    /// Total number of resources known to the backend.
    async fn total_resources_count(&self) -> Result<u64, PersistenceError>;

    /// Number of resources in the `SUCCEEDED` state.
    async fn resources_collected_count(&self) -> Result<u64, PersistenceError>;
}

#[derive(Debug, Clone)]
struct StoredResource {
    status: ResourceStatus,
    response_code: Option<String>,
    annotation: Option<String>,
}

/// Simple in-memory reference backend. Resources are handed out in
/// insertion order; dispatch ordering is otherwise unspecified.
#[derive(Debug)]
pub struct InMemoryPersistence {
    order: Vec<String>,
    resources: Mutex<HashMap<String, StoredResource>>,
}

impl InMemoryPersistence {
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let order: Vec<String> = ids.into_iter().map(Into::into).collect();
        let resources = order
            .iter()
            .cloned()
            .map(|id| {
                (
                    id,
                    StoredResource {
                        status: ResourceStatus::available(),
                        response_code: None,
                        annotation: None,
                    },
                )
            })
            .collect();
        Self {
            order,
            resources: Mutex::new(resources),
        }
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn select_resource(&self) -> Result<Option<SelectedResource>, PersistenceError> {
        let resources = self.resources.lock().unwrap();
        for id in &self.order {
            if let Some(entry) = resources.get(id) {
                if entry.status == ResourceStatus::available() {
                    return Ok(Some(SelectedResource {
                        id: id.clone(),
                        response_code: entry.response_code.clone(),
                        annotation: entry.annotation.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn update_resource(
        &self,
        id: &str,
        new_status: ResourceStatus,
        response_code: Option<String>,
        annotation: Option<String>,
        _client_name: Option<String>,
    ) -> Result<(), PersistenceError> {
        let mut resources = self.resources.lock().unwrap();
        let entry = resources
            .get_mut(id)
            .ok_or_else(|| PersistenceError(format!("unknown resource `{id}`")))?;
        entry.status = new_status;
        if response_code.is_some() {
            entry.response_code = response_code;
        }
        if annotation.is_some() {
            entry.annotation = annotation;
        }
        Ok(())
    }

    async fn total_resources_count(&self) -> Result<u64, PersistenceError> {
        Ok(self.order.len() as u64)
    }

    async fn resources_collected_count(&self) -> Result<u64, PersistenceError> {
        let resources = self.resources.lock().unwrap();
        Ok(resources
            .values()
            .filter(|r| r.status == ResourceStatus::succeeded())
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_then_mark_in_progress_then_succeeded() {
        let backend = InMemoryPersistence::new(["a", "b"]);

        let selected = backend.select_resource().await.unwrap().unwrap();
        assert_eq!(selected.id, "a");

        backend
            .update_resource(
                "a",
                ResourceStatus::in_progress(),
                None,
                None,
                Some("client-1".into()),
            )
            .await
            .unwrap();

        // "a" is no longer available; "b" is the next candidate.
        let selected = backend.select_resource().await.unwrap().unwrap();
        assert_eq!(selected.id, "b");

        backend
            .update_resource(
                "a",
                ResourceStatus::succeeded(),
                Some("200".into()),
                Some("ok".into()),
                Some("client-1".into()),
            )
            .await
            .unwrap();

        assert_eq!(backend.resources_collected_count().await.unwrap(), 1);
        assert_eq!(backend.total_resources_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn select_returns_none_when_exhausted() {
        let backend = InMemoryPersistence::new(["a"]);
        backend
            .update_resource("a", ResourceStatus::in_progress(), None, None, None)
            .await
            .unwrap();
        assert!(backend.select_resource().await.unwrap().is_none());
    }
}
