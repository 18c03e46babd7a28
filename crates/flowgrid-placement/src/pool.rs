//! Offer pool — the arena of offers currently held by the scheduler.
//!
//! Offers enter with [`OfferPool::add`] and leave on rescind, expiry or
//! decline. The allocator carves grants out of them with
//! [`OfferPool::acquire`]; a grant keeps its source offers *held* (never
//! declined) until it is either settled (launched) or released back.

use std::collections::{BTreeMap, HashMap};

use flowgrid_core::{
    Grant, Infeasible, NodeId, NodeResources, Offer, OfferId, ResourceRequest, Scalars,
};
use tracing::debug;

#[derive(Debug, Clone)]
struct OfferEntry {
    node: NodeId,
    received_at: u64,
    holds: u32,
}

/// All offers the scheduler currently holds, grouped by node.
#[derive(Debug, Clone, Default)]
pub struct OfferPool {
    nodes: BTreeMap<NodeId, NodeResources>,
    entries: HashMap<OfferId, OfferEntry>,
}

impl OfferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an offer received at `now` (epoch ms). Re-adding an id replaces it.
    pub fn add(&mut self, offer: Offer, now: u64) {
        let holds = match self.entries.get(&offer.id) {
            Some(entry) if entry.node == offer.node => entry.holds,
            Some(_) => {
                self.remove(&offer.id);
                0
            }
            None => 0,
        };
        self.entries.insert(
            offer.id.clone(),
            OfferEntry {
                node: offer.node.clone(),
                received_at: now,
                holds,
            },
        );
        self.nodes
            .entry(offer.node.clone())
            .or_insert_with(|| NodeResources::new(offer.node.clone()))
            .add_offer(offer);
    }

    pub fn add_batch(&mut self, offers: impl IntoIterator<Item = Offer>, now: u64) {
        for offer in offers {
            self.add(offer, now);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Offer> {
        let entry = self.entries.remove(id)?;
        let node = self.nodes.get_mut(&entry.node)?;
        let offer = node.remove_offer(id);
        if node.is_empty() {
            self.nodes.remove(&entry.node);
        }
        offer
    }

    /// The framework withdrew an offer. Grants drawn from it stay with
    /// their tasks; the driver checks [`OfferPool::contains`] before
    /// launching and returns such tasks to pending.
    pub fn rescind(&mut self, id: &str) -> Option<Offer> {
        self.remove(id)
    }

    /// Drop every offer expired at `now`, returning their ids.
    pub fn drop_expired(&mut self, now: u64) -> Vec<OfferId> {
        let mut expired = Vec::new();
        for node in self.nodes.values_mut() {
            expired.extend(node.drop_expired(now).into_iter().map(|o| o.id));
        }
        self.nodes.retain(|_, n| !n.is_empty());
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    pub fn node(&self, node: &str) -> Option<&NodeResources> {
        self.nodes.get(node)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeResources> {
        self.nodes.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| e.holds > 0)
    }

    pub fn offer_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_scalars(&self) -> Scalars {
        self.nodes.values().map(NodeResources::scalars).sum()
    }

    fn hold(&mut self, grant: &Grant) {
        for id in grant.offer_ids() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.holds += 1;
            }
        }
    }

    fn unhold(&mut self, grant: &Grant) {
        for id in grant.offer_ids() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.holds = entry.holds.saturating_sub(1);
            }
        }
    }

    /// Carve `request` out of `node`, removing the granted resources.
    pub fn acquire(&mut self, node: &str, request: &ResourceRequest) -> Result<Grant, Infeasible> {
        let mut grants = self.acquire_all(node, &[request])?;
        Ok(grants.remove(0))
    }

    /// Carve every request out of `node`, all or nothing.
    pub fn acquire_all(
        &mut self,
        node: &str,
        requests: &[&ResourceRequest],
    ) -> Result<Vec<Grant>, Infeasible> {
        let mut view = match self.nodes.get(node) {
            Some(resources) => resources.clone(),
            None => NodeResources::new(node),
        };
        let mut grants = Vec::with_capacity(requests.len());
        for request in requests {
            let sub = view.subtract(request)?;
            view = sub.remainder;
            grants.push(sub.grant);
        }
        if self.nodes.contains_key(node) {
            self.nodes.insert(node.to_string(), view);
        }
        for grant in &grants {
            self.hold(grant);
        }
        Ok(grants)
    }

    /// The grant was handed to the framework; its offers are no longer held
    /// on its behalf.
    pub fn settle(&mut self, grant: &Grant) {
        self.unhold(grant);
    }

    /// Return an unused grant to its source offers. Fragments whose offer
    /// is gone are dropped. Returns how many fragments were restored.
    pub fn release(&mut self, grant: &Grant) -> usize {
        self.unhold(grant);
        let Some(node) = self.nodes.get_mut(&grant.node) else {
            return 0;
        };
        let restored = grant.fragments.iter().filter(|f| node.restore(f)).count();
        debug!(node = %grant.node, restored, "released grant back to pool");
        restored
    }

    /// Remove and return unheld offers received at or before `now - window`.
    pub fn take_declinable(&mut self, now: u64, window_ms: u64) -> Vec<OfferId> {
        let mut ids: Vec<OfferId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.holds == 0 && e.received_at.saturating_add(window_ms) <= now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    /// Remove and return every unheld offer.
    pub fn take_unheld(&mut self) -> Vec<OfferId> {
        self.take_declinable(u64::MAX, 0)
    }
}

#[cfg(test)]
mod tests {
    use flowgrid_core::ResourceSet;

    use super::*;

    fn offer(id: &str, node: &str, millicores: u64) -> Offer {
        Offer::new(
            id,
            node,
            ResourceSet {
                scalars: Scalars::new(millicores, 0, 0),
                ..Default::default()
            },
        )
    }

    #[test]
    fn add_and_rescind() {
        let mut pool = OfferPool::new();
        pool.add(offer("o1", "n1", 1000), 0);
        pool.add(offer("o2", "n1", 1000), 0);
        assert_eq!(pool.node("n1").unwrap().scalars().millicores, 2000);

        assert!(pool.rescind("o1").is_some());
        assert_eq!(pool.node("n1").unwrap().scalars().millicores, 1000);
        assert!(pool.rescind("o2").is_some());
        assert!(pool.node("n1").is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn acquire_removes_and_release_restores() {
        let mut pool = OfferPool::new();
        pool.add(offer("o1", "n1", 2000), 0);

        let grant = pool
            .acquire("n1", &ResourceRequest::new().with_cores(1500))
            .unwrap();
        assert_eq!(pool.total_scalars().millicores, 500);
        assert!(pool.is_held("o1"));

        assert_eq!(pool.release(&grant), 1);
        assert_eq!(pool.total_scalars().millicores, 2000);
        assert!(!pool.is_held("o1"));
    }

    #[test]
    fn acquire_all_is_atomic() {
        let mut pool = OfferPool::new();
        pool.add(offer("o1", "n1", 3000), 0);
        let two = ResourceRequest::new().with_cores(2000);

        assert!(pool.acquire_all("n1", &[&two, &two]).is_err());
        assert_eq!(pool.total_scalars().millicores, 3000);
        assert!(!pool.is_held("o1"));
    }

    #[test]
    fn held_offers_are_not_declined() {
        let mut pool = OfferPool::new();
        pool.add(offer("o1", "n1", 2000), 0);
        pool.add(offer("o2", "n2", 2000), 0);
        let grant = pool
            .acquire("n1", &ResourceRequest::new().with_cores(100))
            .unwrap();

        assert!(pool.take_declinable(4_999, 5_000).is_empty());
        assert_eq!(pool.take_declinable(5_000, 5_000), vec!["o2".to_string()]);
        assert!(pool.contains("o1"));

        pool.settle(&grant);
        assert_eq!(pool.take_unheld(), vec!["o1".to_string()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn expired_offers_leave_the_pool() {
        let mut pool = OfferPool::new();
        pool.add(offer("o1", "n1", 1000).with_expiry(10), 0);
        pool.add(offer("o2", "n2", 1000), 0);

        assert_eq!(pool.drop_expired(10), vec!["o1".to_string()]);
        assert!(!pool.contains("o1"));
        assert!(pool.node("n1").is_none());
        assert_eq!(pool.offer_count(), 1);
    }

    #[test]
    fn release_after_rescind_drops_fragment() {
        let mut pool = OfferPool::new();
        pool.add(offer("o1", "n1", 1000), 0);
        pool.add(offer("o2", "n1", 1000), 0);
        let grant = pool
            .acquire("n1", &ResourceRequest::new().with_cores(1500))
            .unwrap();
        pool.rescind("o1");

        assert_eq!(pool.release(&grant), 1);
        assert_eq!(pool.total_scalars().millicores, 1000);
    }
}
