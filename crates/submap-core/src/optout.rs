//! Reversal of a migration for a single identity.
//!
//! Triggered by an optout from the contact directory: the identity is moved
//! back from the target messageset of its most recent migration to that
//! migration's source messageset, at the backward-mapped position.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::Error;
use crate::gateway::{
    ContactDirectory, GatewayError, MessagesetCache, NewSubscription, Subscription,
    SubscriptionFilter, SubscriptionGateway,
};
use crate::sequence::{MappingError, SequenceMapper};
use crate::store::RunStore;

/// Default contact field holding the identity key.
pub const DEFAULT_IDENTITY_FIELD: &str = "seed_uuid";

/// Reversal request errors.
#[derive(Debug, Error)]
pub enum OptoutError {
    /// The contact directory has no such contact.
    #[error("Rapidpro contact {0} does not exist")]
    ContactNotFound(Uuid),

    /// The contact cannot be reverted; the message says why.
    #[error("{0}")]
    InvalidContact(String),

    /// Store or remote failure not attributable to the request.
    #[error(transparent)]
    Internal(#[from] Error),
}

impl From<GatewayError> for OptoutError {
    fn from(err: GatewayError) -> Self {
        OptoutError::Internal(Error::Gateway(err))
    }
}

impl From<MappingError> for OptoutError {
    fn from(err: MappingError) -> Self {
        OptoutError::InvalidContact(err.to_string())
    }
}

/// Which messageset's default schedule a reverted subscription gets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSource {
    /// The messageset being reverted from.
    #[default]
    Target,
    /// The messageset the identity is returned to.
    Source,
}

impl fmt::Display for ScheduleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScheduleSource::Target => "target",
            ScheduleSource::Source => "source",
        })
    }
}

impl FromStr for ScheduleSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "target" => Ok(ScheduleSource::Target),
            "source" => Ok(ScheduleSource::Source),
            other => Err(format!("unknown schedule source {other:?}, expected target or source")),
        }
    }
}

/// Subscriptions touched by a reversal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptoutSummary {
    pub cancelled_subscriptions: Vec<Subscription>,
    pub created_subscriptions: Vec<Subscription>,
}

/// Reverts identities to the messageset they were migrated from.
pub struct OptoutService {
    store: RunStore,
    gateway: Arc<dyn SubscriptionGateway>,
    directory: Arc<dyn ContactDirectory>,
    mapper: Arc<SequenceMapper>,
    identity_field: String,
    schedule_source: ScheduleSource,
}

impl OptoutService {
    pub fn new(
        store: RunStore,
        gateway: Arc<dyn SubscriptionGateway>,
        directory: Arc<dyn ContactDirectory>,
        mapper: Arc<SequenceMapper>,
    ) -> Self {
        Self {
            store,
            gateway,
            directory,
            mapper,
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            schedule_source: ScheduleSource::default(),
        }
    }

    /// Contact field read for the identity key.
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    pub fn with_schedule_source(mut self, schedule_source: ScheduleSource) -> Self {
        self.schedule_source = schedule_source;
        self
    }

    /// Revert the most recent migration of the contact's identity.
    ///
    /// Not idempotent: a second call finds no active subscriptions on the
    /// target messageset and fails with [`OptoutError::InvalidContact`].
    #[instrument(skip(self))]
    pub async fn revert(&self, contact_uuid: Uuid) -> Result<OptoutSummary, OptoutError> {
        let contact = self
            .directory
            .contact(contact_uuid)
            .await?
            .ok_or(OptoutError::ContactNotFound(contact_uuid))?;

        let identity = contact.identity_field(&self.identity_field).ok_or_else(|| {
            OptoutError::InvalidContact(format!(
                "Rapidpro contact {} has an invalid {} field.",
                contact.uuid, self.identity_field
            ))
        })?;

        let run = self
            .store
            .latest_migration_for(identity)
            .await?
            .ok_or_else(|| {
                OptoutError::InvalidContact(format!(
                    "Seed identity {identity} does not have any migrations."
                ))
            })?;

        let gateway = self.gateway.as_ref();
        let existing = gateway
            .subscriptions(&SubscriptionFilter::active_for(identity).messageset(run.to_messageset))
            .await?;
        let Some(last) = existing.last() else {
            return Err(OptoutError::InvalidContact(format!(
                "Seed identity {identity} has no active subscriptions to revert"
            )));
        };

        let mut cache = MessagesetCache::new();
        let target = cache.get(gateway, run.to_messageset).await?;
        // Map before touching remote state so an unmapped messageset has no side effects.
        let (source_name, sequence) = self
            .mapper
            .map_backward(&target.short_name, last.next_sequence_number)?;
        let source = cache.by_short_name(gateway, &source_name).await?;
        let schedule = match self.schedule_source {
            ScheduleSource::Target => target.default_schedule,
            ScheduleSource::Source => source.default_schedule,
        };

        for subscription in &existing {
            gateway.set_subscription_active(&subscription.id, false).await?;
        }

        let created = gateway
            .create_subscription(&NewSubscription {
                identity,
                messageset: source.id,
                initial_sequence_number: sequence,
                next_sequence_number: sequence,
                lang: last.lang.clone(),
                schedule,
            })
            .await?;

        self.store.record_reverted(run.id, identity).await?;
        info!(
            run_id = run.id,
            %identity,
            cancelled = existing.len(),
            messageset = source.id,
            sequence,
            "reverted identity migration"
        );

        Ok(OptoutSummary {
            cancelled_subscriptions: existing,
            created_subscriptions: vec![created],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRun;
    use crate::sequence::{SequenceRule, Transform};
    use crate::testing::{MemoryDirectory, MemoryGateway};

    struct Fixture {
        store: RunStore,
        gateway: MemoryGateway,
        directory: MemoryDirectory,
        service: OptoutService,
    }

    async fn fixture(schedule_source: ScheduleSource) -> Fixture {
        let store = RunStore::in_memory().await.unwrap();
        let gateway = MemoryGateway::new()
            .with_messageset(1, "gates_prebirth", 11)
            .with_messageset(2, "gates_postbirth", 22);
        let directory = MemoryDirectory::new();
        let mapper = SequenceMapper::new()
            .with_rule(SequenceRule::new(
                "gates_prebirth",
                "gates_postbirth",
                Transform::affine(2, 1, -1),
                Transform::affine(1, 2, 1),
            ))
            .unwrap();
        let service = OptoutService::new(
            store.clone(),
            Arc::new(gateway.clone()),
            Arc::new(directory.clone()),
            Arc::new(mapper),
        )
        .with_schedule_source(schedule_source);

        Fixture {
            store,
            gateway,
            directory,
            service,
        }
    }

    async fn migrated(store: &RunStore, identity: Uuid) -> i64 {
        let run = store
            .create_run(&NewRun {
                from_messageset: 1,
                to_messageset: 2,
                table_name: "identities".to_string(),
                column_name: "identity_id".to_string(),
            })
            .await
            .unwrap();
        store.record_migrated(run.id, identity).await.unwrap();
        run.id
    }

    #[tokio::test]
    async fn test_schedule_source_choice() {
        let identity = Uuid::new_v4();
        let f = fixture(ScheduleSource::Source).await;
        migrated(&f.store, identity).await;
        f.gateway.subscribe(identity, 2, 8, "eng_ZA");
        let contact = f.directory.add_contact(DEFAULT_IDENTITY_FIELD, &identity.to_string());

        let summary = f.service.revert(contact).await.unwrap();
        assert_eq!(summary.created_subscriptions[0].schedule, Some(11));
        assert_eq!(summary.created_subscriptions[0].next_sequence_number, 5);
    }

    #[tokio::test]
    async fn test_unknown_contact() {
        let f = fixture(ScheduleSource::Target).await;
        let contact = Uuid::new_v4();
        let err = f.service.revert(contact).await.unwrap_err();
        assert!(matches!(err, OptoutError::ContactNotFound(uuid) if uuid == contact));
    }

    #[tokio::test]
    async fn test_contact_without_identity_field() {
        let f = fixture(ScheduleSource::Target).await;
        let contact = f.directory.add_bare_contact();
        let err = f.service.revert(contact).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Rapidpro contact {contact} has an invalid seed_uuid field.")
        );

        let bad = f.directory.add_contact(DEFAULT_IDENTITY_FIELD, "not-a-uuid");
        assert!(matches!(
            f.service.revert(bad).await,
            Err(OptoutError::InvalidContact(_))
        ));
    }

    #[tokio::test]
    async fn test_identity_without_migration() {
        let f = fixture(ScheduleSource::Target).await;
        let identity = Uuid::new_v4();
        let contact = f.directory.add_contact(DEFAULT_IDENTITY_FIELD, &identity.to_string());

        let err = f.service.revert(contact).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Seed identity {identity} does not have any migrations.")
        );
    }

    #[tokio::test]
    async fn test_unmapped_messageset_is_invalid_contact_without_side_effects() {
        let f = fixture(ScheduleSource::Target).await;
        let identity = Uuid::new_v4();
        let run = f
            .store
            .create_run(&NewRun {
                from_messageset: 2,
                to_messageset: 1,
                table_name: "identities".to_string(),
                column_name: "identity_id".to_string(),
            })
            .await
            .unwrap();
        f.store.record_migrated(run.id, identity).await.unwrap();
        f.gateway.subscribe(identity, 1, 4, "eng_ZA");
        let contact = f.directory.add_contact(DEFAULT_IDENTITY_FIELD, &identity.to_string());

        let err = f.service.revert(contact).await.unwrap_err();
        assert!(err.to_string().starts_with("No mapping can be found for messageset gates_prebirth"));
        assert!(f.gateway.deactivated().is_empty());
        assert!(f.gateway.created().is_empty());
        assert!(f.store.reverted_identities(run.id).await.unwrap().is_empty());
    }

    #[test]
    fn test_schedule_source_parse() {
        assert_eq!("target".parse::<ScheduleSource>().unwrap(), ScheduleSource::Target);
        assert_eq!("Source".parse::<ScheduleSource>().unwrap(), ScheduleSource::Source);
        assert!("both".parse::<ScheduleSource>().is_err());
        assert_eq!(ScheduleSource::default().to_string(), "target");
    }
}
