//! In-memory collaborators for tests. Built with the `test-utils` feature.
//!
//! Each fake records the calls made against it so tests can assert on the
//! exact remote traffic a migration or reversal produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::gateway::{
    Contact, ContactDirectory, GatewayError, Messageset, NewSubscription, Subscription,
    SubscriptionFilter, SubscriptionGateway,
};
use crate::model::RunId;
use crate::sequence::Sequence;
use crate::source::{IdentityCursor, IdentitySource};
use crate::store::RunStore;
use crate::task::{CancellationCheck, StatusCheck};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Identity source
// ============================================================================

#[derive(Default)]
struct SourceState {
    fetches: Vec<usize>,
    open_cursors: usize,
}

/// Identity source over a sorted list of identities.
#[derive(Clone, Default)]
pub struct MemoryIdentitySource {
    identities: Arc<Vec<Uuid>>,
    state: Arc<Mutex<SourceState>>,
}

impl MemoryIdentitySource {
    /// Source holding the given identities, sorted like `ORDER BY column`.
    pub fn new(mut identities: Vec<Uuid>) -> Self {
        identities.sort();
        Self {
            identities: Arc::new(identities),
            state: Arc::default(),
        }
    }

    /// Source holding `count` random identities.
    pub fn with_count(count: usize) -> Self {
        Self::new((0..count).map(|_| Uuid::new_v4()).collect())
    }

    /// All identities in read order.
    pub fn identities(&self) -> Vec<Uuid> {
        self.identities.as_ref().clone()
    }

    /// Size of every batch returned so far, including the final empty one.
    pub fn fetches(&self) -> Vec<usize> {
        lock(&self.state).fetches.clone()
    }

    /// Cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        lock(&self.state).open_cursors
    }
}

#[async_trait]
impl IdentitySource for MemoryIdentitySource {
    async fn count(&self, _table: &str) -> Result<u64> {
        Ok(self.identities.len() as u64)
    }

    async fn open(
        &self,
        _table: &str,
        _column: &str,
        offset: u64,
    ) -> Result<Box<dyn IdentityCursor>> {
        lock(&self.state).open_cursors += 1;
        Ok(Box::new(MemoryCursor {
            identities: self.identities.clone(),
            position: usize::try_from(offset).unwrap_or(usize::MAX),
            state: self.state.clone(),
        }))
    }
}

struct MemoryCursor {
    identities: Arc<Vec<Uuid>>,
    position: usize,
    state: Arc<Mutex<SourceState>>,
}

#[async_trait]
impl IdentityCursor for MemoryCursor {
    async fn fetch(&mut self, count: usize) -> Result<Vec<Uuid>> {
        let start = self.position.min(self.identities.len());
        let end = start.saturating_add(count).min(self.identities.len());
        self.position = end;

        let batch = self.identities[start..end].to_vec();
        lock(&self.state).fetches.push(batch.len());
        Ok(batch)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_cursors = state.open_cursors.saturating_sub(1);
        Ok(())
    }
}

// ============================================================================
// Subscription gateway
// ============================================================================

#[derive(Default)]
struct GatewayState {
    messagesets: Vec<Messageset>,
    subscriptions: Vec<Subscription>,
    deactivated: Vec<String>,
    created: Vec<NewSubscription>,
    messageset_lookups: usize,
    failing_identities: Vec<Uuid>,
}

/// Subscription service holding messagesets and subscriptions in memory.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl MemoryGateway {
    /// Empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a messageset.
    pub fn with_messageset(self, id: i64, short_name: &str, default_schedule: i64) -> Self {
        lock(&self.state).messagesets.push(Messageset {
            id,
            short_name: short_name.to_string(),
            default_schedule,
        });
        self
    }

    /// Add an active subscription and return its id.
    pub fn subscribe(
        &self,
        identity: Uuid,
        messageset: i64,
        next_sequence_number: Sequence,
        lang: &str,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        lock(&self.state).subscriptions.push(Subscription {
            id: id.clone(),
            identity,
            messageset,
            next_sequence_number,
            lang: lang.to_string(),
            schedule: None,
            active: true,
            extra: Default::default(),
        });
        id
    }

    /// Make every subscription listing for `identity` fail with a 503.
    pub fn fail_for(&self, identity: Uuid) {
        lock(&self.state).failing_identities.push(identity);
    }

    /// Ids passed to `set_subscription_active(_, false)`, in call order.
    pub fn deactivated(&self) -> Vec<String> {
        lock(&self.state).deactivated.clone()
    }

    /// Payloads passed to `create_subscription`, in call order.
    pub fn created(&self) -> Vec<NewSubscription> {
        lock(&self.state).created.clone()
    }

    /// Every stored subscription.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.state).subscriptions.clone()
    }

    /// Number of messageset lookups served (by id or by short name).
    pub fn messageset_lookups(&self) -> usize {
        lock(&self.state).messageset_lookups
    }
}

#[async_trait]
impl SubscriptionGateway for MemoryGateway {
    async fn subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> std::result::Result<Vec<Subscription>, GatewayError> {
        let state = lock(&self.state);
        if let Some(identity) = filter.identity {
            if state.failing_identities.contains(&identity) {
                return Err(GatewayError::Status {
                    status: 503,
                    message: "service unavailable".to_string(),
                });
            }
        }
        Ok(state
            .subscriptions
            .iter()
            .filter(|sub| filter.matches(sub))
            .cloned()
            .collect())
    }

    async fn set_subscription_active(
        &self,
        id: &str,
        active: bool,
    ) -> std::result::Result<(), GatewayError> {
        let mut state = lock(&self.state);
        let sub = state
            .subscriptions
            .iter_mut()
            .find(|sub| sub.id == id)
            .ok_or_else(|| GatewayError::NotFound(format!("subscription {id}")))?;
        sub.active = active;
        if !active {
            state.deactivated.push(id.to_string());
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> std::result::Result<Subscription, GatewayError> {
        let mut state = lock(&self.state);
        let created = Subscription {
            id: Uuid::new_v4().to_string(),
            identity: subscription.identity,
            messageset: subscription.messageset,
            next_sequence_number: subscription.next_sequence_number,
            lang: subscription.lang.clone(),
            schedule: Some(subscription.schedule),
            active: true,
            extra: Default::default(),
        };
        state.created.push(subscription.clone());
        state.subscriptions.push(created.clone());
        Ok(created)
    }

    async fn messageset(&self, id: i64) -> std::result::Result<Messageset, GatewayError> {
        let mut state = lock(&self.state);
        state.messageset_lookups += 1;
        state
            .messagesets
            .iter()
            .find(|ms| ms.id == id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("messageset {id}")))
    }

    async fn messagesets(
        &self,
        short_name: Option<&str>,
    ) -> std::result::Result<Vec<Messageset>, GatewayError> {
        let mut state = lock(&self.state);
        state.messageset_lookups += 1;
        Ok(state
            .messagesets
            .iter()
            .filter(|ms| short_name.map_or(true, |name| ms.short_name == name))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Contact directory
// ============================================================================

/// Contact directory backed by a map.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    contacts: Arc<Mutex<HashMap<Uuid, Contact>>>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact whose `field` holds `identity`; returns the contact UUID.
    pub fn add_contact(&self, field: &str, identity: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), serde_json::Value::from(identity));
        lock(&self.contacts).insert(uuid, Contact { uuid, fields });
        uuid
    }

    /// Add a contact with no custom fields.
    pub fn add_bare_contact(&self) -> Uuid {
        let uuid = Uuid::new_v4();
        lock(&self.contacts).insert(
            uuid,
            Contact {
                uuid,
                fields: Default::default(),
            },
        );
        uuid
    }
}

#[async_trait]
impl ContactDirectory for MemoryDirectory {
    async fn contact(&self, uuid: Uuid) -> std::result::Result<Option<Contact>, GatewayError> {
        Ok(lock(&self.contacts).get(&uuid).cloned())
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancels the run through the store right before the identity at ordinal
/// `at` (zero based, counted from where this execution started) is processed.
pub struct CancelBefore {
    at: usize,
    checks: AtomicUsize,
}

impl CancelBefore {
    /// Cancel before the `at`-th identity.
    pub fn new(at: usize) -> Self {
        Self {
            at,
            checks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CancellationCheck for CancelBefore {
    async fn should_stop(&self, store: &RunStore, run_id: RunId, task_id: Uuid) -> Result<bool> {
        if self.checks.fetch_add(1, Ordering::SeqCst) == self.at {
            store.cancel(run_id).await?;
        }
        StatusCheck.should_stop(store, run_id, task_id).await
    }
}
