// src/core/context.rs

//! The shared dependency bundle handed to the subarray workers and their
//! state-machine entry actions.

use crate::config::Config;
use crate::core::alerts::Alerts;
use crate::core::analyzer::ProcessControl;
use crate::core::client::KeyValueStore;
use crate::core::gateway::Gateway;
use crate::core::instance::InstancePool;
use crate::core::metadata::MetadataResolver;
use std::sync::Arc;

/// Explicitly initialized shared state; no hidden module-level singletons.
/// Wrapped in an `Arc` and shared by the supervisor, every subarray worker
/// and all deferred tasks.
pub struct Context {
    pub store: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
    pub alerts: Alerts,
    pub gateway: Gateway,
    pub resolver: MetadataResolver,
    pub pool: Arc<InstancePool>,
    pub control: Arc<dyn ProcessControl>,
}

impl Context {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: Arc<Config>,
        control: Arc<dyn ProcessControl>,
    ) -> Arc<Self> {
        let alerts = Alerts::new(store.clone(), &config.slack_channel, &config.grafana_url);
        let gateway = Gateway::new(store.clone(), alerts.clone(), &config.gateway_domain);
        let resolver = MetadataResolver::new(store.clone());
        let pool = Arc::new(InstancePool::new(config.instances()));
        Arc::new(Self {
            store,
            config,
            alerts,
            gateway,
            resolver,
            pool,
            control,
        })
    }
}
