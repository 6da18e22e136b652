use crate::connectors::adapter::SiteConnector;
use crate::connectors::demo_site::DemoConnector;
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Site identifier → connector implementation. Adding a site means
/// registering here, never branching on the site name in the dispatcher.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: Arc<RwLock<HashMap<String, Arc<dyn SiteConnector>>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connector: Arc<dyn SiteConnector>) -> Result<()> {
        let key = connector.site().trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(anyhow!("connector site key is empty"));
        }
        let mut guard = self.connectors.write();
        if guard.contains_key(&key) {
            return Err(anyhow!("connector already registered: {key}"));
        }
        guard.insert(key, connector);
        Ok(())
    }

    pub fn register_replace(&self, connector: Arc<dyn SiteConnector>) {
        let key = connector.site().trim().to_ascii_lowercase();
        if key.is_empty() {
            return;
        }
        let mut guard = self.connectors.write();
        guard.insert(key, connector);
    }

    pub fn get(&self, site: &str) -> Option<Arc<dyn SiteConnector>> {
        let key = site.trim().to_ascii_lowercase();
        if key.is_empty() {
            return None;
        }
        let guard = self.connectors.read();
        guard.get(&key).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let guard = self.connectors.read();
        let mut items: Vec<String> = guard.keys().cloned().collect();
        items.sort_unstable();
        items
    }
}

pub fn build_default_connector_registry() -> ConnectorRegistry {
    let registry = ConnectorRegistry::new();
    registry.register_replace(Arc::new(DemoConnector));
    registry
}
