//! Instance ownership across nodes.
//!
//! Two layers decide who drives an instance:
//!
//! - The **hash ring** spreads `namespace/workflow_id` keys over the live
//!   nodes. Adding or removing a node moves only the keys adjacent to its
//!   virtual points. The ring is a routing hint: two nodes may briefly
//!   disagree about it while membership converges.
//! - The **instance lease** (see `coordinator`) is taken for every activation.
//!   Even that is not relied on for safety; the history store's
//!   compare-and-append rejects the loser of any overlap.
//!
//! Membership is itself lease-based: every runtime keeps a `node/<id>` lease
//! alive by heartbeat, and the ring is rebuilt from the unexpired node leases.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::limits::NODE_LEASE_PREFIX;
use crate::InstanceId;
use crate::providers::{Lease, Provider, ProviderError};

fn ring_point(label: &str) -> u64 {
    let hash = blake3::hash(label.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

/// Consistent-hash ring with virtual nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    vnodes: u32,
    points: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    pub fn new(vnodes: u32) -> Self {
        Self {
            vnodes: vnodes.max(1),
            points: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    pub fn with_nodes<I, S>(vnodes: u32, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(vnodes);
        for n in nodes {
            ring.add_node(n.as_ref());
        }
        ring
    }

    pub fn add_node(&mut self, node: &str) {
        if !self.nodes.insert(node.to_string()) {
            return;
        }
        for v in 0..self.vnodes {
            self.points.insert(ring_point(&format!("{node}#{v}")), node.to_string());
        }
    }

    pub fn remove_node(&mut self, node: &str) {
        if self.nodes.remove(node) {
            self.points.retain(|_, owner| owner != node);
        }
    }

    /// Node owning `key`: the first virtual point clockwise from the key's hash.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let p = ring_point(key);
        self.points
            .range(p..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// This runtime's view of the cluster.
pub struct Membership {
    provider: Arc<dyn Provider>,
    node_id: String,
    ttl: Duration,
    lease: tokio::sync::Mutex<Option<Lease>>,
    ring: RwLock<HashRing>,
}

impl Membership {
    pub fn new(provider: Arc<dyn Provider>, node_id: impl Into<String>, ttl: Duration, vnodes: u32) -> Self {
        Self {
            provider,
            node_id: node_id.into(),
            ttl,
            lease: tokio::sync::Mutex::new(None),
            ring: RwLock::new(HashRing::new(vnodes)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn lease_key(&self) -> String {
        format!("{NODE_LEASE_PREFIX}{}", self.node_id)
    }

    /// Renew (or take) this node's lease and rebuild the ring from live nodes.
    pub async fn heartbeat(&self) -> Result<(), ProviderError> {
        {
            let mut held = self.lease.lock().await;
            let renewed = match held.as_ref() {
                Some(lease) => self.provider.renew_lease(lease, self.ttl).await?,
                None => None,
            };
            *held = match renewed {
                Some(lease) => Some(lease),
                None => {
                    let acquired = self
                        .provider
                        .acquire_lease(&self.lease_key(), &self.node_id, self.ttl)
                        .await?;
                    if acquired.is_none() {
                        warn!(
                            target: "duraflow::runtime::ownership",
                            node = %self.node_id,
                            "node lease held by another process with the same node id"
                        );
                    }
                    acquired
                }
            };
        }

        let live: BTreeSet<String> = self
            .provider
            .list_leases(NODE_LEASE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|l| l.key.strip_prefix(NODE_LEASE_PREFIX).map(str::to_string))
            .collect();

        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let current: BTreeSet<String> = ring.nodes().into_iter().collect();
        if current == live {
            return Ok(());
        }
        for gone in current.difference(&live) {
            ring.remove_node(gone);
        }
        for joined in live.difference(&current) {
            ring.add_node(joined);
        }
        info!(
            target: "duraflow::runtime::ownership",
            node = %self.node_id,
            members = live.len(),
            "membership changed"
        );
        Ok(())
    }

    /// Whether this node should drive `instance`. With no membership
    /// information yet, every node considers itself the owner.
    pub fn owns(&self, instance: &InstanceId) -> bool {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        if ring.is_empty() {
            return true;
        }
        ring.owner(&instance.ownership_key()) == Some(self.node_id.as_str())
    }

    pub fn members(&self) -> Vec<String> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).nodes()
    }

    /// Give up the node lease so peers rebalance without waiting for expiry.
    pub async fn leave(&self) {
        if let Some(lease) = self.lease.lock().await.take() {
            if let Err(e) = self.provider.release_lease(&lease).await {
                debug!(
                    target: "duraflow::runtime::ownership",
                    node = %self.node_id,
                    error = %e,
                    "failed to release node lease"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryProvider;

    fn keys() -> Vec<String> {
        (0..2_000).map(|i| format!("billing/order-{i}")).collect()
    }

    #[test]
    fn every_key_has_exactly_one_owner() {
        let ring = HashRing::with_nodes(64, ["a", "b", "c"]);
        for k in keys() {
            let owner = ring.owner(&k).unwrap();
            assert!(["a", "b", "c"].contains(&owner));
        }
        assert!(HashRing::new(8).owner("x").is_none());
    }

    #[test]
    fn removing_a_node_moves_only_its_keys() {
        let before = HashRing::with_nodes(64, ["a", "b", "c"]);
        let mut after = before.clone();
        after.remove_node("b");
        for k in keys() {
            let was = before.owner(&k).unwrap();
            let now = after.owner(&k).unwrap();
            if was != "b" {
                assert_eq!(was, now, "key {k} moved without its owner leaving");
            } else {
                assert_ne!(now, "b");
            }
        }
    }

    #[test]
    fn keys_spread_over_all_nodes() {
        let ring = HashRing::with_nodes(64, ["a", "b", "c", "d"]);
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for k in keys() {
            *counts.entry(ring.owner(&k).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|c| *c > 200), "skewed distribution: {counts:?}");
    }

    #[tokio::test]
    async fn membership_follows_node_leases() {
        let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        let a = Membership::new(store.clone(), "a", Duration::from_secs(5), 16);
        let b = Membership::new(store.clone(), "b", Duration::from_secs(5), 16);
        let id = InstanceId::new("ns", "wf", "r");
        assert!(a.owns(&id));

        a.heartbeat().await.unwrap();
        b.heartbeat().await.unwrap();
        a.heartbeat().await.unwrap();
        assert_eq!(a.members(), vec!["a".to_string(), "b".to_string()]);
        assert_ne!(a.owns(&id), b.owns(&id));

        b.leave().await;
        a.heartbeat().await.unwrap();
        assert_eq!(a.members(), vec!["a".to_string()]);
        assert!(a.owns(&id));
    }
}
