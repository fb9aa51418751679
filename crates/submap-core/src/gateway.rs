//! Contracts for the remote subscription service and the contact directory.
//!
//! The HTTP implementations live in `submap-client`; the orchestrators only
//! see these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::sequence::Sequence;

/// Errors returned by remote collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The request could not be sent or no response was received.
    #[error("request failed: {0}")]
    Transport(String),

    /// The remote answered with a non-success status.
    #[error("remote returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or extracted detail.
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),

    /// A looked-up resource does not exist.
    #[error("{0} not found")]
    NotFound(String),
}

/// A messageset on the remote subscription service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Messageset {
    pub id: i64,
    pub short_name: String,
    pub default_schedule: i64,
}

/// A subscription on the remote service. Fields the core does not use are
/// kept in `extra` so they survive a round trip back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub identity: Uuid,
    pub messageset: i64,
    pub next_sequence_number: Sequence,
    pub lang: String,
    #[serde(default)]
    pub schedule: Option<i64>,
    #[serde(default)]
    pub active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload for creating a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub identity: Uuid,
    pub messageset: i64,
    pub initial_sequence_number: Sequence,
    pub next_sequence_number: Sequence,
    pub lang: String,
    pub schedule: i64,
}

/// Filter for listing subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub identity: Option<Uuid>,
    pub messageset: Option<i64>,
    pub active: Option<bool>,
}

impl SubscriptionFilter {
    /// Active subscriptions of an identity.
    pub fn active_for(identity: Uuid) -> Self {
        Self {
            identity: Some(identity),
            messageset: None,
            active: Some(true),
        }
    }

    /// Restrict to one messageset.
    pub fn messageset(mut self, messageset: i64) -> Self {
        self.messageset = Some(messageset);
        self
    }

    /// Whether a subscription passes the filter.
    pub fn matches(&self, subscription: &Subscription) -> bool {
        self.identity.map_or(true, |id| subscription.identity == id)
            && self
                .messageset
                .map_or(true, |ms| subscription.messageset == ms)
            && self.active.map_or(true, |active| subscription.active == active)
    }

    /// Query string pairs understood by the remote service.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(identity) = self.identity {
            pairs.push(("identity", identity.to_string()));
        }
        if let Some(messageset) = self.messageset {
            pairs.push(("messageset", messageset.to_string()));
        }
        if let Some(active) = self.active {
            pairs.push(("active", if active { "True" } else { "False" }.to_string()));
        }
        pairs
    }
}

/// Remote subscription service.
#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    /// List subscriptions matching the filter.
    async fn subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, GatewayError>;

    /// Set a subscription's active flag.
    async fn set_subscription_active(&self, id: &str, active: bool) -> Result<(), GatewayError>;

    /// Create a subscription.
    async fn create_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, GatewayError>;

    /// Fetch one messageset by id.
    async fn messageset(&self, id: i64) -> Result<Messageset, GatewayError>;

    /// List messagesets, optionally restricted to a short name.
    async fn messagesets(&self, short_name: Option<&str>) -> Result<Vec<Messageset>, GatewayError>;
}

/// A contact in the external contact directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub uuid: Uuid,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Contact {
    /// Identity key stored in a custom field, if present and well formed.
    pub fn identity_field(&self, field: &str) -> Option<Uuid> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }
}

/// External contact directory.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Resolve a contact by UUID.
    async fn contact(&self, uuid: Uuid) -> Result<Option<Contact>, GatewayError>;
}

/// Messageset metadata memoized for the lifetime of one run or request.
#[derive(Debug, Default)]
pub struct MessagesetCache {
    by_id: HashMap<i64, Messageset>,
    by_short_name: HashMap<String, i64>,
}

impl MessagesetCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messageset by id, fetched on first use.
    pub async fn get(
        &mut self,
        gateway: &dyn SubscriptionGateway,
        id: i64,
    ) -> Result<Messageset, GatewayError> {
        if let Some(messageset) = self.by_id.get(&id) {
            return Ok(messageset.clone());
        }
        let messageset = gateway.messageset(id).await?;
        self.insert(messageset.clone());
        Ok(messageset)
    }

    /// Messageset by short name, fetched on first use.
    pub async fn by_short_name(
        &mut self,
        gateway: &dyn SubscriptionGateway,
        short_name: &str,
    ) -> Result<Messageset, GatewayError> {
        if let Some(messageset) = self
            .by_short_name
            .get(short_name)
            .and_then(|id| self.by_id.get(id))
        {
            return Ok(messageset.clone());
        }
        let messageset = gateway
            .messagesets(Some(short_name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::NotFound(format!("messageset {short_name}")))?;
        self.insert(messageset.clone());
        Ok(messageset)
    }

    /// Number of cached messagesets.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, messageset: Messageset) {
        self.by_short_name
            .insert(messageset.short_name.clone(), messageset.id);
        self.by_id.insert(messageset.id, messageset);
    }
}
