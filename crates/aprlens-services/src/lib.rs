//! Collaborator services for APR Lens workers.
//!
//! REST clients for the metrics warehouse, the issue tracker, the code host
//! and the wiki, plus the feature rankings file. [`register_capabilities`]
//! exposes them to workers through a capability registry.

pub mod capabilities;
pub mod codehost;
pub mod error;
pub mod publishing;
pub mod rankings;
pub mod tabular;
pub mod ticket;

pub use capabilities::{metrics_capability, register_capabilities, Services};
pub use codehost::{CodeHostClient, CodeHostConfig, ControlPlanRow};
pub use error::ServiceError;
pub use publishing::{PublishedPage, PublishingClient, PublishingConfig};
pub use rankings::FeatureRankings;
pub use tabular::{MetricRow, TabularClient, TabularConfig, TabularResult};
pub use ticket::{TicketClient, TicketConfig};
