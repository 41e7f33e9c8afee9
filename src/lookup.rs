//! The iterative lookup engine.
//!
//! A lookup repeatedly asks the α closest not-yet-queried peers it knows of about a target,
//! merges the peers they return and stops once the k closest known peers have stayed the same for
//! two consecutive rounds. The same driver serves node discovery (FIND_NODE), value discovery
//! (FIND_VALUE, which stops once enough replicas returned their copies) and the store and delete
//! drivers (which stop once enough peers confirmed).

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    time::Duration,
};

use bytes::Bytes;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use tokio::time::error::Elapsed;
use tracing::{debug, trace, warn};

use crate::{
    core::{
        config::Config,
        error::{Error, Result},
        id::Id,
        message::{FindNode, FindValue, Message, Route},
        record::{bucket_floor, bucket_width, record_key, Record, StoredRecord, TimeWindow},
        routing_table::{Addr, PeerRecord},
        traits::{Storage, Transport},
    },
    node::{nonce, Node},
};

/// The number of consecutive rounds the closest set must stay unchanged for a lookup to converge.
pub const STABLE_ROUNDS: u8 = 2;

/// The answer of a single peer to a lookup query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome<V> {
    /// The peer holds what we are looking for.
    Found(V),
    /// The peer points us at peers closer to the target.
    Redirect(Vec<PeerRecord>),
}

/// What a session wants done next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send a query to each of these peers.
    Query(Vec<PeerRecord>),
    /// Nobody is left to ask this round.
    Idle,
    /// The closest set has been stable for [`STABLE_ROUNDS`] rounds.
    Converged(Vec<PeerRecord>),
}

/// The state of a single lookup: the peers it knows of, the addresses it has contacted and its
/// convergence counter.
#[derive(Debug, Clone)]
pub struct LookupSession {
    target: Id,
    local_id: Id,
    k: usize,
    alpha: usize,
    known: Vec<PeerRecord>,
    queried: HashSet<Addr>,
    responded: Vec<PeerRecord>,
    previous: Vec<Id>,
    stable_rounds: u8,
    rounds: usize,
    exhaustive: bool,
}

impl LookupSession {
    /// Starts a session towards `target`, seeded with the supplied peers. The local identifier is
    /// never added to the known set.
    pub fn new(target: Id, local_id: Id, seeds: Vec<PeerRecord>, k: usize, alpha: usize) -> Self {
        let mut session = Self {
            target,
            local_id,
            k,
            alpha,
            known: Vec::new(),
            queried: HashSet::new(),
            responded: Vec::new(),
            previous: Vec::new(),
            stable_rounds: 0,
            rounds: 0,
            exhaustive: false,
        };
        session.merge(seeds);

        session
    }

    /// Keeps the session from converging while members of the closest set haven't been queried.
    pub fn exhaustive(mut self) -> Self {
        self.exhaustive = true;
        self
    }

    pub fn target(&self) -> Id {
        self.target
    }

    /// The number of rounds started so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Every distinct peer learnt of during the session.
    pub fn known(&self) -> &[PeerRecord] {
        &self.known
    }

    /// The addresses that have been sent a query.
    pub fn queried(&self) -> &HashSet<Addr> {
        &self.queried
    }

    /// The peers that answered a query.
    pub fn responded(&self) -> &[PeerRecord] {
        &self.responded
    }

    /// The k known peers closest to the target, closest first.
    pub fn closest(&self) -> Vec<PeerRecord> {
        let mut closest = self.known.clone();
        closest.sort_unstable_by_key(|peer| peer.id.distance(&self.target));
        closest.truncate(self.k);

        closest
    }

    /// Adds peers to the known set, deduplicated by identifier.
    pub fn merge(&mut self, peers: impl IntoIterator<Item = PeerRecord>) {
        for peer in peers {
            if peer.id == self.local_id || self.known.iter().any(|known| known.id == peer.id) {
                continue;
            }

            self.known.push(peer);
        }
    }

    pub(crate) fn record_responders(&mut self, peers: impl IntoIterator<Item = PeerRecord>) {
        for peer in peers {
            if !self.responded.iter().any(|responded| responded.id == peer.id) {
                self.responded.push(peer);
            }
        }
    }

    /// Starts a new round: checks for convergence and picks up to α unqueried peers among the
    /// current closest set, marking them as queried.
    pub fn next_step(&mut self) -> Step {
        self.rounds += 1;

        let current = self.closest();
        let ids: Vec<Id> = current.iter().map(|peer| peer.id).collect();

        if ids == self.previous {
            self.stable_rounds = self.stable_rounds.saturating_add(1);
        } else {
            self.stable_rounds = 0;
            self.previous = ids;
        }

        let selected: Vec<PeerRecord> = current
            .iter()
            .filter(|peer| !self.queried.contains(&peer.addr))
            .take(self.alpha)
            .cloned()
            .collect();

        let settled = !self.exhaustive || selected.is_empty();
        if self.stable_rounds >= STABLE_ROUNDS && settled {
            return Step::Converged(current);
        }

        if selected.is_empty() {
            return Step::Idle;
        }

        for peer in &selected {
            self.queried.insert(peer.addr.clone());
        }

        Step::Query(selected)
    }
}

/// The outcome of a driven lookup.
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    /// The closest known peers when the lookup stopped, closest first.
    pub closest: Vec<PeerRecord>,
    /// The peers that reported a hit, with what they returned.
    pub found: Vec<(PeerRecord, V)>,
    pub rounds: usize,
}

// The merged results of one round.
struct Round<V> {
    found: Vec<(PeerRecord, V)>,
    redirects: Vec<PeerRecord>,
    responders: Vec<PeerRecord>,
}

impl<V> Round<V> {
    fn new() -> Self {
        Self {
            found: Vec::new(),
            redirects: Vec::new(),
            responders: Vec::new(),
        }
    }

    fn absorb(
        &mut self,
        peer: PeerRecord,
        result: std::result::Result<Result<QueryOutcome<V>>, Elapsed>,
    ) {
        match result {
            Err(_) => debug!(peer = %peer.addr, "request timed out"),
            Ok(Err(e)) => debug!(peer = %peer.addr, error = %e, "request failed"),
            Ok(Ok(QueryOutcome::Found(value))) => {
                self.responders.push(peer.clone());
                self.found.push((peer, value));
            }
            Ok(Ok(QueryOutcome::Redirect(nodes))) => {
                trace!(peer = %peer.addr, nodes = nodes.len(), "redirected");
                self.responders.push(peer);
                self.redirects.extend(nodes);
            }
        }
    }
}

/// Runs the session to completion.
///
/// Each round dispatches one request per selected peer, each bounded by the request timeout, and
/// waits for all of them before merging. The peers that answered are handed to `observe` once the
/// round is merged. Once `until` peers have reported a hit, the requests still in flight are
/// dropped and no further rounds are started.
pub async fn drive<V, F, Fut, O, OFut>(
    session: &mut LookupSession,
    config: &Config,
    until: usize,
    mut query: F,
    mut observe: O,
) -> Lookup<V>
where
    F: FnMut(PeerRecord) -> Fut,
    Fut: Future<Output = Result<QueryOutcome<V>>>,
    O: FnMut(Vec<PeerRecord>) -> OFut,
    OFut: Future<Output = ()>,
{
    let mut found = Vec::new();

    loop {
        if session.rounds() >= config.max_rounds {
            warn!(key = %session.target(), rounds = session.rounds(), "lookup hit the round cap");
            break;
        }

        match session.next_step() {
            Step::Converged(closest) => {
                debug!(
                    key = %session.target(),
                    rounds = session.rounds(),
                    closest = closest.len(),
                    queried = session.queried().len(),
                    "lookup converged"
                );
                break;
            }
            Step::Idle => {
                trace!(key = %session.target(), "no peers left to query, backing off");
                tokio::time::sleep(config.round_backoff).await;
            }
            Step::Query(peers) => {
                let round = run_round(
                    peers,
                    config.request_timeout,
                    until.saturating_sub(found.len()),
                    &mut query,
                )
                .await;

                session.merge(round.redirects);
                observe(round.responders.clone()).await;
                session.record_responders(round.responders);
                found.extend(round.found);

                if found.len() >= until {
                    debug!(key = %session.target(), hits = found.len(), "lookup satisfied");
                    break;
                }
            }
        }
    }

    Lookup {
        closest: session.closest(),
        found,
        rounds: session.rounds(),
    }
}

async fn run_round<V, F, Fut>(
    peers: Vec<PeerRecord>,
    timeout: Duration,
    until: usize,
    query: &mut F,
) -> Round<V>
where
    F: FnMut(PeerRecord) -> Fut,
    Fut: Future<Output = Result<QueryOutcome<V>>>,
{
    let mut pending: FuturesUnordered<_> = peers
        .into_iter()
        .map(|peer| {
            let request = query(peer.clone());
            async move { (peer, tokio::time::timeout(timeout, request).await) }
        })
        .collect();

    let mut round = Round::new();

    while let Some((peer, result)) = pending.next().await {
        round.absorb(peer, result);

        if round.found.len() >= until {
            // Keep whatever already settled, drop the rest.
            while let Some(Some((peer, result))) = pending.next().now_or_never() {
                round.absorb(peer, result);
            }

            if !pending.is_empty() {
                debug!(cancelled = pending.len(), "cancelling in-flight requests");
            }
            break;
        }
    }

    round
}

/// Merges the records returned by several replicas, dropping the ones too many replicas flagged
/// as deleted.
///
/// A record is excluded when the share of responding copies marked deleted is strictly greater
/// than `threshold`. The result is sorted by timestamp.
pub fn filter_deleted(
    responses: impl IntoIterator<Item = Vec<StoredRecord>>,
    threshold: f64,
) -> Vec<Record> {
    // signature -> (record, copies, deleted copies)
    let mut tally: HashMap<Bytes, (Record, usize, usize)> = HashMap::new();

    for values in responses {
        let mut seen = HashSet::new();
        for stored in values {
            if !seen.insert(stored.record.signature.clone()) {
                continue;
            }

            let entry = tally
                .entry(stored.record.signature.clone())
                .or_insert_with(|| (stored.record.clone(), 0, 0));
            entry.1 += 1;
            if stored.deleted {
                entry.2 += 1;
            }
        }
    }

    let mut records: Vec<Record> = tally
        .into_values()
        .filter(|(_, copies, deleted)| (*deleted as f64) / (*copies as f64) <= threshold)
        .map(|(record, _, _)| record)
        .collect();
    records.sort_by(|a, b| (a.timestamp, &a.signature).cmp(&(b.timestamp, &b.signature)));

    records
}

impl<T: Transport, S: Storage> Node<T, S> {
    /// Finds the k closest peers to the target, starting from the routing table.
    pub async fn find_node(&self, target: Id) -> Vec<PeerRecord> {
        let seeds = self.routing_table.find_closest(&target, self.config.k);
        self.find_node_from(target, seeds).await
    }

    /// Finds the k closest peers to the target, starting from the supplied seeds.
    pub async fn find_node_from(&self, target: Id, seeds: Vec<PeerRecord>) -> Vec<PeerRecord> {
        let mut session = self.session(target, seeds);
        self.discover_nodes(&mut session).await
    }

    pub(crate) fn session(&self, target: Id, seeds: Vec<PeerRecord>) -> LookupSession {
        LookupSession::new(target, self.id, seeds, self.config.k, self.config.alpha)
    }

    pub(crate) async fn discover_nodes(&self, session: &mut LookupSession) -> Vec<PeerRecord> {
        let target = session.target();
        let lookup: Lookup<()> = drive(
            session,
            &self.config,
            usize::MAX,
            |peer| self.query_find_node(peer, target),
            |peers| self.observe(peers),
        )
        .await;

        lookup.closest
    }

    async fn query_find_node(&self, peer: PeerRecord, target: Id) -> Result<QueryOutcome<()>> {
        let nonce = nonce();
        let request = Message::FindNode(FindNode {
            nonce,
            sender: self.contact(),
            id: target,
        });

        match self.transport.request(&peer.addr, request).await? {
            Message::Nodes(nodes) if nodes.nonce == nonce => Ok(QueryOutcome::Redirect(nodes.nodes)),
            Message::Nodes(_) => Err(Error::NonceMismatch),
            other => Err(Error::UnexpectedResponse {
                expected: Route::FindNode,
                got: other.variant_as_str(),
            }),
        }
    }

    /// Fetches the records stored under the key, optionally restricted to a time window.
    ///
    /// A local copy counts towards the read quorum, the network is only asked for the rest.
    pub async fn find_value(&self, key: Id, window: Option<TimeWindow>) -> Vec<Record> {
        let local = self.storage.get(&key, window);
        let seeds = self.routing_table.find_closest(&key, self.config.k);

        if local.is_empty() {
            self.collect_values(key, window, seeds, Vec::new()).await
        } else {
            trace!(%key, copies = local.len(), "value held locally");
            self.collect_values(key, window, seeds, vec![local]).await
        }
    }

    /// Fetches the records stored under the key from the network, starting from the supplied
    /// seeds.
    pub async fn find_value_from(
        &self,
        key: Id,
        window: Option<TimeWindow>,
        seeds: Vec<PeerRecord>,
    ) -> Vec<Record> {
        self.collect_values(key, window, seeds, Vec::new()).await
    }

    async fn collect_values(
        &self,
        key: Id,
        window: Option<TimeWindow>,
        seeds: Vec<PeerRecord>,
        mut responses: Vec<Vec<StoredRecord>>,
    ) -> Vec<Record> {
        let quorum = self.config.read_quorum.max(1);

        if responses.len() < quorum {
            let mut session = self.session(key, seeds);
            let lookup = drive(
                &mut session,
                &self.config,
                quorum - responses.len(),
                |peer| self.query_find_value(peer, key, window),
                |peers| self.observe(peers),
            )
            .await;

            debug!(
                %key,
                replicas = lookup.found.len(),
                rounds = lookup.rounds,
                "value lookup finished"
            );
            responses.extend(lookup.found.into_iter().map(|(_, values)| values));
        }

        let mut records = filter_deleted(responses, self.config.delete_threshold);
        if let Some(window) = window {
            records.retain(|record| window.contains(record.timestamp));
        }

        records
    }

    /// Fetches every record whose timestamp falls in the window, one lookup per time bucket.
    pub async fn fetch_window(&self, window: TimeWindow) -> Result<Vec<Record>> {
        let bucket_secs = self.config.time_bucket;
        let mut bucket_start = bucket_width(bucket_secs)
            .and_then(|width| bucket_floor(window.start, width))
            .ok_or(Error::InvalidTimestamp(window.start))?;
        let mut records = Vec::new();

        while bucket_start <= window.end {
            let key = record_key(bucket_start, bucket_secs)?;
            records.extend(self.find_value(key, Some(window)).await);

            match bucket_width(bucket_secs).and_then(|width| bucket_start.checked_add(width)) {
                Some(next) => bucket_start = next,
                None => break,
            }
        }

        Ok(records)
    }

    async fn query_find_value(
        &self,
        peer: PeerRecord,
        key: Id,
        window: Option<TimeWindow>,
    ) -> Result<QueryOutcome<Vec<StoredRecord>>> {
        let nonce = nonce();
        let request = Message::FindValue(FindValue {
            nonce,
            sender: self.contact(),
            key,
            window,
        });

        match self.transport.request(&peer.addr, request).await? {
            Message::Found(found) if found.nonce == nonce => Ok(QueryOutcome::Found(found.values)),
            Message::Redirect(redirect) if redirect.nonce == nonce => {
                Ok(QueryOutcome::Redirect(redirect.nodes))
            }
            Message::Found(_) | Message::Redirect(_) => Err(Error::NonceMismatch),
            other => Err(Error::UnexpectedResponse {
                expected: Route::FindValue,
                got: other.variant_as_str(),
            }),
        }
    }
}
