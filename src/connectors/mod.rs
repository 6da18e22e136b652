pub mod adapter;
pub mod demo_site;
pub mod registry;

pub use adapter::{
    ActionOutcome, LoginContext, LoginOutcome, PerformContext, SessionHandle, SiteConnector,
};
pub use registry::{build_default_connector_registry, ConnectorRegistry};
