//! The k-bucket routing table.

use std::{collections::VecDeque, fmt, fs, net::SocketAddr, path::Path};

use bincode::{Decode, Encode};
use time::OffsetDateTime;

use crate::core::{
    error::{Error, Result},
    id::Id,
};

/// A logical peer address, opaque to the routing logic (a socket address, a peer handle...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct Addr(String);

impl Addr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Addr {
    fn from(addr: &str) -> Self {
        Self(addr.to_owned())
    }
}

impl From<String> for Addr {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// A known peer: its identifier, address and the last time we heard from it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PeerRecord {
    pub id: Id,
    pub addr: Addr,
    #[bincode(with_serde)]
    pub last_seen: OffsetDateTime,
}

impl PeerRecord {
    /// Creates a record for a peer seen just now.
    pub fn new(id: Id, addr: impl Into<Addr>) -> Self {
        Self {
            id,
            addr: addr.into(),
            last_seen: OffsetDateTime::now_utc(),
        }
    }
}

/// The result of [`SyncRoutingTable::insert_node`](crate::SyncRoutingTable::insert_node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was already present and moved to the most-recent position.
    Refreshed,
    /// The bucket had space and the peer was appended.
    Appended,
    /// The bucket was full, its least-recently-seen entry failed the liveness probe and was
    /// evicted in favour of the new peer.
    Replaced,
    /// The bucket was full and its least-recently-seen entry is alive, the new peer was dropped.
    Rejected,
    /// An attempt was made to insert our local identifier.
    SelfEntry,
}

/// The first half of an insertion, decided without any network access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Touch {
    Refreshed,
    Appended,
    /// The bucket is full, the oldest entry must be probed before the peer can go in.
    Full { oldest: PeerRecord },
    SelfEntry,
}

/// The core routing table: 160 buckets of at most `k` peers, ordered least- to most-recently
/// seen.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The node's local identifier.
    local_id: Id,
    // The maximum number of peers that can be contained in a bucket.
    k: usize,
    // Indexed by `local_id.bucket_index(peer)`.
    buckets: Vec<VecDeque<PeerRecord>>,
}

impl RoutingTable {
    /// Creates an empty routing table.
    pub fn new(local_id: Id, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![VecDeque::new(); Id::BITS],
        }
    }

    /// Returns this table's local identifier.
    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// Returns the maximum bucket size.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Returns the total number of peers in the table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Returns the bucket at the index, least-recently seen first.
    pub fn bucket(&self, i: usize) -> impl Iterator<Item = &PeerRecord> {
        self.buckets.get(i).into_iter().flatten()
    }

    /// Returns every peer in the table.
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.buckets.iter().flatten()
    }

    /// Returns the peer with the identifier, if present.
    pub fn get(&self, id: &Id) -> Option<&PeerRecord> {
        self.buckets[self.local_id.bucket_index(id)]
            .iter()
            .find(|peer| peer.id == *id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Refreshes or appends the peer, or reports the oldest entry of its full bucket.
    pub(crate) fn touch(&mut self, mut peer: PeerRecord) -> Touch {
        if peer.id == self.local_id {
            return Touch::SelfEntry;
        }

        let k = self.k;
        let bucket = &mut self.buckets[self.local_id.bucket_index(&peer.id)];

        if let Some(pos) = bucket.iter().position(|entry| entry.id == peer.id) {
            // Remove and re-append, the peer becomes the most recent. The address is updated as
            // peers may rebind.
            bucket.remove(pos);
            peer.last_seen = OffsetDateTime::now_utc();
            bucket.push_back(peer);

            return Touch::Refreshed;
        }

        if bucket.len() < k {
            bucket.push_back(peer);
            return Touch::Appended;
        }

        match bucket.front() {
            Some(oldest) => Touch::Full {
                oldest: oldest.clone(),
            },
            // Only reachable with k == 0, nothing can ever be inserted.
            None => Touch::Full { oldest: peer },
        }
    }

    /// Evicts `oldest` and appends `peer`, provided `oldest` is still the least-recently-seen
    /// entry of the full bucket. Returns `false` if the bucket changed in the meantime.
    pub(crate) fn replace(&mut self, oldest: &Id, peer: PeerRecord) -> bool {
        let k = self.k;
        let bucket = &mut self.buckets[self.local_id.bucket_index(&peer.id)];

        if bucket.len() < k
            || bucket.front().map(|entry| entry.id) != Some(*oldest)
            || bucket.iter().any(|entry| entry.id == peer.id)
        {
            return false;
        }

        bucket.pop_front();
        bucket.push_back(peer);

        true
    }

    /// Moves the peer to the most-recent position of its bucket, returns `false` if absent.
    pub fn refresh(&mut self, id: &Id) -> bool {
        let bucket = &mut self.buckets[self.local_id.bucket_index(id)];

        match bucket.iter().position(|entry| entry.id == *id) {
            Some(pos) => {
                if let Some(mut peer) = bucket.remove(pos) {
                    peer.last_seen = OffsetDateTime::now_utc();
                    bucket.push_back(peer);
                }
                true
            }
            None => false,
        }
    }

    /// Removes the peer from the table.
    pub fn remove(&mut self, id: &Id) -> Option<PeerRecord> {
        let bucket = &mut self.buckets[self.local_id.bucket_index(id)];
        let pos = bucket.iter().position(|entry| entry.id == *id)?;

        bucket.remove(pos)
    }

    /// Returns up to `count` peers sorted by increasing XOR distance to the target.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<PeerRecord> {
        // There is a total order over the id-space, so distances never tie between distinct
        // identifiers and an unstable sort is deterministic.
        let mut peers: Vec<_> = self.peers().cloned().collect();
        peers.sort_unstable_by_key(|peer| peer.id.distance(target));
        peers.truncate(count);

        peers
    }

    // SNAPSHOTS

    /// Captures the full bucket structure.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            local_id: self.local_id,
            k: self.k,
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.iter().cloned().collect())
                .collect(),
        }
    }

    /// Rebuilds a table from a snapshot, checking the bucket invariants.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        if snapshot.buckets.len() != Id::BITS {
            return Err(Error::Snapshot(format!(
                "expected {} buckets, found {}",
                Id::BITS,
                snapshot.buckets.len()
            )));
        }

        let mut table = Self::new(snapshot.local_id, snapshot.k);

        for (i, bucket) in snapshot.buckets.into_iter().enumerate() {
            if bucket.len() > table.k {
                return Err(Error::Snapshot(format!("bucket {i} exceeds k")));
            }

            for peer in bucket {
                if peer.id == table.local_id || table.local_id.bucket_index(&peer.id) != i {
                    return Err(Error::Snapshot(format!("peer {} in wrong bucket {i}", peer.id)));
                }

                if table.contains(&peer.id) {
                    return Err(Error::Snapshot(format!("duplicate peer {}", peer.id)));
                }

                table.buckets[i].push_back(peer);
            }
        }

        Ok(table)
    }

    /// Writes the table to a file.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = bincode::encode_to_vec(self.snapshot(), bincode::config::standard())?;
        fs::write(path, bytes)?;

        Ok(())
    }

    /// Reads a table from a file written by [`RoutingTable::save_snapshot`].
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path)?;
        let (snapshot, _length): (Snapshot, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;

        Self::from_snapshot(snapshot)
    }
}

/// The serialized form of a [`RoutingTable`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Snapshot {
    pub local_id: Id,
    pub k: usize,
    pub buckets: Vec<Vec<PeerRecord>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Produces a peer record with a small identifier and a matching local address.
    fn peer(raw: u16) -> PeerRecord {
        PeerRecord::new(Id::from_u16(raw), format!("127.0.0.1:{raw}"))
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kadstore-{name}-{}", Id::rand()))
    }

    #[test]
    fn new_is_empty() {
        let rt = RoutingTable::new(Id::from_u16(0), 20);

        assert!(rt.is_empty());
        assert_eq!(rt.len(), 0);
        assert_eq!(rt.k(), 20);
        assert_eq!(rt.snapshot().buckets.len(), Id::BITS);
    }

    #[test]
    fn touch_self() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 1);
        assert_eq!(rt.touch(peer(0)), Touch::SelfEntry);
        assert!(rt.is_empty());
    }

    #[test]
    fn touch_appends_into_bucket() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 1);
        // ... 0001 -> bucket i = 0
        assert_eq!(rt.touch(peer(1)), Touch::Appended);
        // ... 0010 -> bucket i = 1
        assert_eq!(rt.touch(peer(2)), Touch::Appended);
        // ... 0011 -> bucket i = 1, full.
        assert_eq!(
            rt.touch(peer(3)),
            Touch::Full {
                oldest: rt.get(&Id::from_u16(2)).unwrap().clone()
            }
        );

        assert_eq!(rt.bucket(0).count(), 1);
        assert_eq!(rt.bucket(1).count(), 1);
        assert_eq!(rt.len(), 2);
    }

    #[test]
    fn touch_refreshes_existing() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 5);
        assert_eq!(rt.touch(peer(2)), Touch::Appended);
        assert_eq!(rt.touch(peer(3)), Touch::Appended);

        // 2 was least recently seen, touching it again moves it to the back.
        assert_eq!(rt.touch(peer(2)), Touch::Refreshed);
        let order: Vec<_> = rt.bucket(1).map(|p| p.id).collect();
        assert_eq!(order, [Id::from_u16(3), Id::from_u16(2)]);
        assert_eq!(rt.len(), 2);
    }

    #[test]
    fn touch_refresh_updates_addr() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 5);
        rt.touch(peer(1));
        rt.touch(PeerRecord::new(Id::from_u16(1), "127.0.0.1:9"));

        assert_eq!(rt.get(&Id::from_u16(1)).unwrap().addr.as_str(), "127.0.0.1:9");
    }

    #[test]
    fn replace_evicts_oldest() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 1);
        rt.touch(peer(2));

        assert!(rt.replace(&Id::from_u16(2), peer(3)));
        assert!(!rt.contains(&Id::from_u16(2)));
        assert!(rt.contains(&Id::from_u16(3)));
    }

    #[test]
    fn replace_rejects_stale_decision() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 2);
        rt.touch(peer(4));
        rt.touch(peer(5));
        // 4 was refreshed by someone else while we were probing it.
        rt.touch(peer(4));

        assert!(!rt.replace(&Id::from_u16(4), peer(6)));
        assert_eq!(rt.len(), 2);
    }

    #[test]
    fn remove() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 5);
        rt.touch(peer(1));

        assert_eq!(rt.remove(&Id::from_u16(1)).map(|p| p.id), Some(Id::from_u16(1)));
        assert!(rt.remove(&Id::from_u16(1)).is_none());
        assert!(rt.is_empty());
    }

    #[test]
    fn find_closest() {
        let mut rt = RoutingTable::new(Id::from_u16(0), 5);
        for i in 1..=5 {
            assert_eq!(rt.touch(peer(i)), Touch::Appended);
        }

        let closest = rt.find_closest(&Id::from_u16(0), 3);
        let ids: Vec<_> = closest.iter().map(|p| p.id).collect();
        assert_eq!(ids, [Id::from_u16(1), Id::from_u16(2), Id::from_u16(3)]);

        // Relative to 4 the distances are 4 -> 0, 5 -> 1, 1 -> 5, 2 -> 6, 3 -> 7.
        let closest = rt.find_closest(&Id::from_u16(4), 5);
        let ids: Vec<_> = closest.iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            [
                Id::from_u16(4),
                Id::from_u16(5),
                Id::from_u16(1),
                Id::from_u16(2),
                Id::from_u16(3)
            ]
        );
    }

    #[test]
    fn find_closest_sorted_and_sized() {
        let mut rt = RoutingTable::new(Id::rand(), 20);
        for _ in 0..100 {
            rt.touch(PeerRecord::new(Id::rand(), "127.0.0.1:0"));
        }

        let target = Id::rand();
        let closest = rt.find_closest(&target, 20);
        assert_eq!(closest.len(), 20.min(rt.len()));
        assert!(closest
            .windows(2)
            .all(|w| w[0].id.distance(&target) <= w[1].id.distance(&target)));

        // Asking for more than we hold returns everything.
        assert_eq!(rt.find_closest(&target, 1000).len(), rt.len());
    }

    #[test]
    fn find_closest_empty() {
        let rt = RoutingTable::new(Id::from_u16(0), 5);
        assert!(rt.find_closest(&Id::from_u16(0), 3).is_empty());
    }

    #[test]
    fn bucket_invariants_hold_under_random_inserts() {
        let local = Id::rand();
        let mut rt = RoutingTable::new(local, 3);
        for _ in 0..500 {
            rt.touch(PeerRecord::new(Id::rand(), "127.0.0.1:0"));
        }

        let mut seen = std::collections::HashSet::new();
        for i in 0..Id::BITS {
            assert!(rt.bucket(i).count() <= 3);
            for peer in rt.bucket(i) {
                assert_eq!(local.bucket_index(&peer.id), i);
                assert!(seen.insert(peer.id));
            }
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let mut rt = RoutingTable::new(Id::rand(), 4);
        for _ in 0..50 {
            rt.touch(PeerRecord::new(Id::rand(), "10.0.0.1:4000"));
        }

        let path = temp_path("snapshot");
        rt.save_snapshot(&path).unwrap();
        let loaded = RoutingTable::load_snapshot(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.snapshot(), rt.snapshot());
    }

    #[test]
    fn snapshot_malformed_file() {
        let path = temp_path("garbage");
        fs::write(&path, b"definitely not a routing table").unwrap();
        let res = RoutingTable::load_snapshot(&path);
        let _ = fs::remove_file(&path);

        assert!(res.is_err());
    }

    #[test]
    fn snapshot_rejects_misplaced_peer() {
        let mut snapshot = RoutingTable::new(Id::from_u16(0), 4).snapshot();
        // Identifier 3 belongs to bucket 1.
        snapshot.buckets[0].push(peer(3));

        assert!(matches!(
            RoutingTable::from_snapshot(snapshot),
            Err(Error::Snapshot(_))
        ));
    }
}
