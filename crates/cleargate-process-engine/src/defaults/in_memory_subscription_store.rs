//! In-memory subscription store for testing and single-process usage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::SubscriptionStoreError;
use crate::traits::SubscriptionStore;
use crate::types::{EventSubscription, NewSubscription, SubscriptionOwner};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// id → (insertion sequence, subscription)
    by_id: HashMap<String, (u64, EventSubscription)>,
}

impl Inner {
    fn insert(&mut self, sub: EventSubscription) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(sub.id.clone(), (seq, sub));
    }

    /// Matching subscriptions in creation order.
    fn select(&self, pred: impl Fn(&EventSubscription) -> bool) -> Vec<EventSubscription> {
        let mut found: Vec<&(u64, EventSubscription)> =
            self.by_id.values().filter(|(_, s)| pred(s)).collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, s)| s.clone()).collect()
    }

    fn remove_where(&mut self, pred: impl Fn(&EventSubscription) -> bool) -> Vec<EventSubscription> {
        let mut ids: Vec<(u64, String)> = self
            .by_id
            .iter()
            .filter(|(_, (_, s))| pred(s))
            .map(|(id, (seq, _))| (*seq, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|(_, id)| self.by_id.remove(&id).map(|(_, s)| s))
            .collect()
    }
}

/// In-memory implementation of [`SubscriptionStore`].
///
/// All reads clone under the lock, so callers always work on a consistent
/// snapshot. Lookups return subscriptions in creation order.
#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned_by_execution(sub: &EventSubscription, execution_id: &str) -> bool {
    sub.execution_id() == Some(execution_id)
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn create(&self, new: NewSubscription) -> Result<EventSubscription, SubscriptionStoreError> {
        if new.event_type.trim().is_empty() {
            return Err(SubscriptionStoreError::Invalid {
                message: "event type must not be empty".into(),
            });
        }

        let mut inner = self.inner.write().await;
        if let SubscriptionOwner::Execution { execution_id, .. } = &new.owner {
            let duplicate = inner.by_id.values().any(|(_, s)| {
                owned_by_execution(s, execution_id)
                    && s.event_type == new.event_type
                    && s.correlation == new.correlation
            });
            if duplicate {
                return Err(SubscriptionStoreError::Duplicate {
                    owner: new.owner.to_string(),
                    event_type: new.event_type,
                });
            }
        }

        let sub = EventSubscription::from_new(new);
        tracing::debug!(
            subscription_id = %sub.id,
            event_type = %sub.event_type,
            owner = %sub.owner,
            "subscription created"
        );
        inner.insert(sub.clone());
        Ok(sub)
    }

    async fn get(&self, id: &str) -> Result<Option<EventSubscription>, SubscriptionStoreError> {
        Ok(self.inner.read().await.by_id.get(id).map(|(_, s)| s.clone()))
    }

    async fn find_by_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError> {
        Ok(self.inner.read().await.select(|s| s.event_type == event_type))
    }

    async fn find_by_owner_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError> {
        Ok(self
            .inner
            .read()
            .await
            .select(|s| owned_by_execution(s, execution_id)))
    }

    async fn find_by_process_definition(
        &self,
        process_definition_id: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError> {
        Ok(self
            .inner
            .read()
            .await
            .select(|s| s.process_definition_id() == Some(process_definition_id)))
    }

    async fn consume(&self, id: &str) -> Result<Option<EventSubscription>, SubscriptionStoreError> {
        let mut inner = self.inner.write().await;
        match inner.by_id.get(id) {
            Some((_, s)) if s.process_definition_id().is_some() => {
                Err(SubscriptionStoreError::Invalid {
                    message: format!("subscription {id} starts processes and cannot be consumed"),
                })
            }
            Some(_) => Ok(inner.by_id.remove(id).map(|(_, s)| s)),
            None => Ok(None),
        }
    }

    async fn delete_by_owner_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<EventSubscription>, SubscriptionStoreError> {
        let removed = self
            .inner
            .write()
            .await
            .remove_where(|s| owned_by_execution(s, execution_id));
        if !removed.is_empty() {
            tracing::debug!(
                execution_id = %execution_id,
                count = removed.len(),
                "execution subscriptions deleted"
            );
        }
        Ok(removed)
    }

    async fn delete_by_process_definition(
        &self,
        process_definition_id: &str,
    ) -> Result<usize, SubscriptionStoreError> {
        let removed = self
            .inner
            .write()
            .await
            .remove_where(|s| s.process_definition_id() == Some(process_definition_id));
        Ok(removed.len())
    }

    async fn restore(&self, subscriptions: Vec<EventSubscription>) -> Result<(), SubscriptionStoreError> {
        let mut inner = self.inner.write().await;
        for sub in subscriptions {
            if !inner.by_id.contains_key(&sub.id) {
                inner.insert(sub);
            }
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, SubscriptionStoreError> {
        Ok(self.inner.read().await.by_id.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_sub(event_type: &str, execution_id: &str) -> NewSubscription {
        NewSubscription::for_execution(event_type, execution_id, "inst-1")
    }

    #[tokio::test]
    async fn create_rejects_duplicate_execution_subscription() {
        let store = InMemorySubscriptionStore::new();
        store
            .create(exec_sub("myEvent", "e1").correlate("customerId", "kermit"))
            .await
            .unwrap();

        let err = store
            .create(exec_sub("myEvent", "e1").correlate("customerId", "kermit"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionStoreError::Duplicate { .. }));

        // Different correlation value or different execution is fine.
        store
            .create(exec_sub("myEvent", "e1").correlate("customerId", "fozzie"))
            .await
            .unwrap();
        store
            .create(exec_sub("myEvent", "e2").correlate("customerId", "kermit"))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_event_type_is_invalid() {
        let store = InMemorySubscriptionStore::new();
        let err = store.create(exec_sub("", "e1")).await.unwrap_err();
        assert!(matches!(err, SubscriptionStoreError::Invalid { .. }));
    }

    #[tokio::test]
    async fn definition_subscriptions_may_repeat() {
        let store = InMemorySubscriptionStore::new();
        store
            .create(NewSubscription::for_process_definition("myEvent", "process:1"))
            .await
            .unwrap();
        store
            .create(NewSubscription::for_process_definition("myEvent", "process:1"))
            .await
            .unwrap();
        assert_eq!(store.find_by_process_definition("process:1").await.unwrap().len(), 2);
        assert_eq!(store.delete_by_process_definition("process:1").await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_by_event_type_returns_creation_order() {
        let store = InMemorySubscriptionStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let sub = store.create(exec_sub("myEvent", &format!("e{i}"))).await.unwrap();
            ids.push(sub.id);
        }
        store.create(exec_sub("other", "e9")).await.unwrap();

        let found: Vec<String> = store
            .find_by_event_type("myEvent")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(found, ids);
    }

    #[tokio::test]
    async fn consume_is_delete_once() {
        let store = InMemorySubscriptionStore::new();
        let sub = store.create(exec_sub("myEvent", "e1")).await.unwrap();

        let first = store.consume(&sub.id).await.unwrap();
        let second = store.consume(&sub.id).await.unwrap();
        assert_eq!(first.map(|s| s.id), Some(sub.id.clone()));
        assert!(second.is_none());

        store.restore(vec![sub.clone()]).await.unwrap();
        assert!(store.get(&sub.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_consume_has_one_winner() {
        let store = InMemorySubscriptionStore::new();
        let sub = store.create(exec_sub("myEvent", "e1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = sub.id.clone();
            handles.push(tokio::spawn(async move { store.consume(&id).await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn definition_subscription_cannot_be_consumed() {
        let store = InMemorySubscriptionStore::new();
        let sub = store
            .create(NewSubscription::for_process_definition("myEvent", "process:1"))
            .await
            .unwrap();
        assert!(store.consume(&sub.id).await.is_err());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_owner_execution_is_idempotent() {
        let store = InMemorySubscriptionStore::new();
        store.create(exec_sub("a", "e1")).await.unwrap();
        store.create(exec_sub("b", "e1")).await.unwrap();
        store.create(exec_sub("a", "e2")).await.unwrap();

        let removed = store.delete_by_owner_execution("e1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.delete_by_owner_execution("e1").await.unwrap().is_empty());
        assert_eq!(store.find_by_owner_execution("e2").await.unwrap().len(), 1);
    }
}
