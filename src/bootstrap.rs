//! Joining the network.

use std::collections::HashSet;

use futures::future::join_all;
use rand::{thread_rng, Rng};
use tracing::{debug, info, warn};

use crate::{
    core::{
        id::Id,
        routing_table::{Addr, InsertOutcome, PeerRecord},
        traits::{Storage, Transport},
    },
    node::Node,
};

/// What a bootstrap achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// The seeds that answered the initial probe.
    pub contacted: Vec<PeerRecord>,
    /// The distinct peers the self-lookup learned about.
    pub discovered: usize,
    /// How many of them made it into the routing table.
    pub inserted: usize,
}

impl<T: Transport, S: Storage> Node<T, S> {
    /// Populates the routing table through the seeds.
    ///
    /// The seeds are probed, the ones that answer seed a lookup of the local identifier and every
    /// peer it turns up is offered to the routing table. If no seed answers the node keeps running
    /// on its own with an empty table.
    pub async fn bootstrap(&self, seeds: &[Addr]) -> BootstrapReport {
        let probes = seeds
            .iter()
            .filter(|addr| **addr != self.addr)
            .map(|addr| self.probe_seed(addr));
        let contacted: Vec<PeerRecord> = join_all(probes).await.into_iter().flatten().collect();

        if contacted.is_empty() {
            warn!(seeds = seeds.len(), "no seed reachable, running standalone");
            return BootstrapReport::default();
        }

        for peer in &contacted {
            self.routing_table.insert_node(peer.clone(), self).await;
        }

        let mut session = self.session(self.id, contacted.clone());
        self.discover_nodes(&mut session).await;

        let mut seen = HashSet::new();
        let discovered: Vec<PeerRecord> = session
            .known()
            .iter()
            .filter(|peer| peer.id != self.id && seen.insert(peer.id))
            .cloned()
            .collect();

        let mut inserted = 0;
        for peer in discovered.iter().cloned() {
            match self.routing_table.insert_node(peer, self).await {
                InsertOutcome::Appended | InsertOutcome::Replaced => inserted += 1,
                InsertOutcome::Refreshed | InsertOutcome::Rejected | InsertOutcome::SelfEntry => {}
            }
        }

        info!(
            contacted = contacted.len(),
            discovered = discovered.len(),
            inserted,
            peers = self.routing_table.len(),
            "bootstrap finished"
        );

        BootstrapReport {
            contacted,
            discovered: discovered.len(),
            inserted,
        }
    }

    async fn probe_seed(&self, addr: &Addr) -> Option<PeerRecord> {
        let ping = self.transport.ping(addr, self.contact());

        match tokio::time::timeout(self.config.request_timeout, ping).await {
            Ok(Ok(id)) if id == self.id => {
                debug!(%addr, "seed answered with our own identifier");
                None
            }
            Ok(Ok(id)) => Some(PeerRecord::new(id, addr.clone())),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "seed unreachable");
                None
            }
            Err(_) => {
                debug!(%addr, "seed timed out");
                None
            }
        }
    }

    /// Looks up a random identifier in the given bucket, learning about peers the table doesn't
    /// know of yet. Returns how many peers were added.
    pub async fn refresh_bucket(&self, index: usize) -> usize {
        let target = random_id_in_bucket(self.id, index);
        let before = self.routing_table.len();
        self.find_node(target).await;

        self.routing_table.len().saturating_sub(before)
    }
}

// Returns an identifier at a distance from `local` whose most significant bit is `index`.
fn random_id_in_bucket(local: Id, index: usize) -> Id {
    let index = index.min(Id::BITS - 1);
    let mut distance: [u8; Id::BYTES] = thread_rng().gen();

    let byte = Id::BYTES - 1 - index / 8;
    let bit = index % 8;
    for b in distance.iter_mut().take(byte) {
        *b = 0;
    }
    distance[byte] &= (1u8 << bit).wrapping_sub(1) | (1u8 << bit);
    distance[byte] |= 1u8 << bit;

    let mut bytes = local.bytes();
    for (b, d) in bytes.iter_mut().zip(distance) {
        *b ^= d;
    }

    Id::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_lands_in_bucket() {
        let local = Id::rand();

        for index in [0, 1, 7, 8, 9, 63, 100, 159] {
            for _ in 0..16 {
                let id = random_id_in_bucket(local, index);
                assert_eq!(local.bucket_index(&id), index);
            }
        }
    }
}
