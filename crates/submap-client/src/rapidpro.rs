//! RapidPro contact directory client.

use async_trait::async_trait;
use submap_core::{Contact, ContactDirectory, GatewayError};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::{HttpApi, Page};

/// Contact lookups against the RapidPro v2 API.
#[derive(Debug, Clone)]
pub struct RapidProClient {
    api: HttpApi,
}

impl RapidProClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: HttpApi::new(config)?,
        })
    }
}

#[async_trait]
impl ContactDirectory for RapidProClient {
    async fn contact(&self, uuid: Uuid) -> Result<Option<Contact>, GatewayError> {
        let page: Page<Contact> = self
            .api
            .get("api/v2/contacts.json", &[("uuid", uuid.to_string())])
            .await?;
        Ok(page.results.into_iter().next())
    }
}
