//! HTTP implementations of the submap gateway contracts.
//!
//! - [`StageBasedMessagingClient`] implements
//!   [`SubscriptionGateway`](submap_core::SubscriptionGateway) over the
//!   stage-based messaging REST API.
//! - [`RapidProClient`] implements
//!   [`ContactDirectory`](submap_core::ContactDirectory) over RapidPro's
//!   contacts endpoint.
//!
//! Both authenticate with `Authorization: Token <token>` and follow `next`
//! links on paginated listings.

pub mod config;
pub mod error;
mod http;
pub mod rapidpro;
pub mod sbm;

pub use config::{ClientConfig, DEFAULT_TIMEOUT};
pub use error::ClientError;
pub use rapidpro::RapidProClient;
pub use sbm::StageBasedMessagingClient;
