// src/core/gateway.rs

//! Hashpipe-Redis gateway plumbing: channel naming, `KEY=VALUE` publishes
//! with delivery verification, and gateway group membership.
//!
//! Array-wide keys travel through per-instance-number groups named
//! `<array>-<n>` so that keys differing per buffer (such as `DATADIR`) can be
//! addressed to all instances sharing an index in one publish.

use crate::core::CoordinatorError;
use crate::core::alerts::Alerts;
use crate::core::client::KeyValueStore;
use crate::core::instance::Instance;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Spacing between re-publishes of an under-delivered group key.
const GROUP_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Publish attempts per group key before proceeding with a warning.
const GROUP_RETRIES: usize = 3;
/// Pause between dropping and re-arming DWELL on an early stop.
const DWELL_RESET_PAUSE: Duration = Duration::from_millis(1500);

#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn KeyValueStore>,
    alerts: Alerts,
    domain: String,
}

impl Gateway {
    pub fn new(store: Arc<dyn KeyValueStore>, alerts: Alerts, domain: &str) -> Self {
        Self {
            store,
            alerts,
            domain: domain.to_string(),
        }
    }

    pub fn instance_set_channel(&self, instance: &Instance) -> String {
        format!("{}://{}/set", self.domain, instance)
    }

    pub fn instance_gateway_channel(&self, instance: &Instance) -> String {
        format!("{}://{}/gateway", self.domain, instance)
    }

    pub fn group_set_channel(&self, group: &str) -> String {
        format!("{}:{}///set", self.domain, group)
    }

    pub fn group_gateway_channel(&self, group: &str) -> String {
        format!("{}:{}///gateway", self.domain, group)
    }

    /// The status hash maintained by the gateway for one DAQ instance.
    pub fn status_key(&self, instance: &Instance) -> String {
        format!("{}://{}/status", self.domain, instance)
    }

    /// The distinct instance numbers among `instances`, i.e. the gateway
    /// groups a subarray spans.
    pub fn group_numbers(instances: &BTreeSet<Instance>) -> BTreeSet<u8> {
        instances.iter().map(|i| i.number()).collect()
    }

    /// Formats and publishes one gateway message, optionally mirroring it
    /// into a hash for the reconfigure tooling. Returns the listener count.
    pub async fn publish_key(
        &self,
        channel: &str,
        key: &str,
        value: &str,
        write: bool,
    ) -> Result<usize> {
        let msg = format!("{key}={value}");
        let listeners = self.store.publish(channel, &msg).await?;
        info!("Published {msg} to channel {channel}");
        if write {
            self.store.hset(channel, key, value).await?;
        }
        Ok(listeners)
    }

    /// Instructs every instance's gateway to join its `<array>-<n>` group.
    pub async fn join_groups(&self, array: &str, instances: &BTreeSet<Instance>) -> Result<()> {
        for instance in instances {
            let channel = self.instance_gateway_channel(instance);
            let msg = format!("join={}-{}", array, instance.number());
            self.store.publish(&channel, &msg).await?;
        }
        info!("Instances instructed to join gateway groups for {array}");
        Ok(())
    }

    /// Disbands the subarray's gateway groups.
    pub async fn destroy_groups(&self, array: &str, numbers: &BTreeSet<u8>) -> Result<()> {
        for n in numbers {
            let group = format!("{array}-{n}");
            let channel = self.group_gateway_channel(&group);
            self.store.publish(&channel, &format!("leave={group}")).await?;
        }
        info!("Disbanded gateway groups for {array}");
        Ok(())
    }

    /// Publishes an array-wide key to every instance-number group, verifying
    /// that at least `instances.len()` listeners received it. Under-delivery
    /// is retried with a group re-join in between; persistent failure warns
    /// without aborting the caller.
    pub async fn set_array_key(
        &self,
        array: &str,
        instances: &BTreeSet<Instance>,
        key: &str,
        value: &str,
    ) -> Result<usize> {
        let expected = instances.len();
        let numbers = Self::group_numbers(instances);
        let mut listeners = 0;
        for attempt in 0..GROUP_RETRIES {
            listeners = 0;
            for n in &numbers {
                let channel = self.group_set_channel(&format!("{array}-{n}"));
                listeners += self.publish_key(&channel, key, value, false).await?;
            }
            if listeners >= expected {
                if attempt > 0 {
                    self.alerts
                        .alert(&format!(
                            ":ballot_box_with_check: `{array}` retry `{key}` success"
                        ))
                        .await;
                }
                return Ok(listeners);
            }
            self.alerts
                .alert(&format!(":fast_forward: `{array}` retry `{key}`"))
                .await;
            tokio::time::sleep(GROUP_RETRY_DELAY).await;
            self.join_groups(array, instances).await?;
        }
        self.alerts
            .alert(&format!(
                ":warning: `{array}` `{key}` delivered to {listeners}/{expected}"
            ))
            .await;
        Ok(listeners)
    }

    /// Publishes a key on one instance's private channel.
    pub async fn set_instance_key(
        &self,
        instance: &Instance,
        key: &str,
        value: &str,
    ) -> Result<usize> {
        let channel = self.instance_set_channel(instance);
        self.publish_key(&channel, key, value, false).await
    }

    /// Drops DWELL and PKTSTART on each instance, then re-arms DWELL so the
    /// DAQ is ready for the next track.
    pub async fn reset_dwell(
        &self,
        instances: &BTreeSet<Instance>,
        dwell: u64,
    ) -> Result<()> {
        for instance in instances {
            let channel = self.instance_set_channel(instance);
            info!("Resetting DWELL for {channel}, new dwell: {dwell}");
            self.store.publish(&channel, "DWELL=0").await?;
            self.store.publish(&channel, "PKTSTART=0").await?;
            tokio::time::sleep(DWELL_RESET_PAUSE).await;
            self.store.publish(&channel, &format!("DWELL={dwell}")).await?;
        }
        Ok(())
    }
}
