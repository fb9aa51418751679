//! Stage-based messaging service client.

use async_trait::async_trait;
use serde_json::{json, Value};
use submap_core::{
    GatewayError, Messageset, NewSubscription, Subscription, SubscriptionFilter,
    SubscriptionGateway,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::HttpApi;

/// Subscription gateway over the stage-based messaging REST API.
#[derive(Debug, Clone)]
pub struct StageBasedMessagingClient {
    api: HttpApi,
}

impl StageBasedMessagingClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: HttpApi::new(config)?,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.api.config()
    }
}

#[async_trait]
impl SubscriptionGateway for StageBasedMessagingClient {
    async fn subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, GatewayError> {
        Ok(self.api.get_all("subscriptions/", &filter.query_pairs()).await?)
    }

    async fn set_subscription_active(&self, id: &str, active: bool) -> Result<(), GatewayError> {
        self.api
            .patch::<_, Value>(&format!("subscriptions/{id}/"), &json!({ "active": active }))
            .await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, GatewayError> {
        Ok(self.api.post("subscriptions/", subscription).await?)
    }

    async fn messageset(&self, id: i64) -> Result<Messageset, GatewayError> {
        match self.api.get(&format!("messageset/{id}/"), &[]).await {
            Ok(messageset) => Ok(messageset),
            Err(err) if err.status() == Some(404) => {
                Err(GatewayError::NotFound(format!("messageset {id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn messagesets(&self, short_name: Option<&str>) -> Result<Vec<Messageset>, GatewayError> {
        let query: Vec<(&str, String)> = short_name
            .map(|name| vec![("short_name", name.to_string())])
            .unwrap_or_default();
        Ok(self.api.get_all("messageset/", &query).await?)
    }
}
