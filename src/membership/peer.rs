//! Peer cache implementation.
//!
//! The cache is an owning map keyed by an internal entry id; peers are
//! addressed by bus id, stable identifier or name, and entries holding a
//! partial identity are healed as the missing pieces are learned from
//! incoming messages.

use std::collections::HashMap;
use std::time::SystemTime;

use slog::{debug, info, warn, Logger};
use tokio::sync::broadcast;

/// Liveness of a peer as reported by the process group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Member,
    Lost,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Member => "member",
            Liveness::Lost => "lost",
        }
    }
}

/// Cluster join phase, meaningful only while the local node is leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JoinPhase {
    Nack,
    None,
    Welcomed,
    Integrated,
    Finalized,
    Confirmed,
}

impl JoinPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinPhase::Nack => "nack",
            JoinPhase::None => "none",
            JoinPhase::Welcomed => "welcomed",
            JoinPhase::Integrated => "integrated",
            JoinPhase::Finalized => "finalized",
            JoinPhase::Confirmed => "confirmed",
        }
    }
}

/// Which subset of the cache a lookup applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerFilter {
    /// Cluster nodes only (entries not flagged remote).
    Cluster,
    /// Remote/guest nodes only.
    Remote,
    /// Any entry.
    Any,
}

/// One node known to the cluster.
#[derive(Clone, Debug)]
pub struct PeerNode {
    /// Stable identifier, unique across the cache.
    pub uuid: Option<String>,
    /// Node name as known to the cluster, unique across the cache.
    pub uname: Option<String>,
    /// Numeric id on the messaging bus, when known.
    pub id: Option<u32>,
    pub state: Liveness,
    /// Remote/guest node: never enters `Member` via the membership
    /// protocol, only via explicit configuration.
    pub remote: bool,
    /// Entry is stale and due for reap on the next sweep.
    pub dirty: bool,
    pub join: JoinPhase,
    pub last_seen: Option<SystemTime>,
    /// Expected follow-up state, tracked by the leader only.
    pub expected: Option<String>,
}

impl PeerNode {
    fn new_cluster(id: Option<u32>, uname: Option<&str>) -> Self {
        PeerNode {
            uuid: id.map(|n| n.to_string()),
            uname: uname.map(str::to_string),
            id,
            state: Liveness::Lost,
            remote: false,
            dirty: false,
            join: JoinPhase::None,
            last_seen: None,
            expected: None,
        }
    }

    fn new_remote(uname: &str) -> Self {
        PeerNode {
            // Remote nodes have no bus id; the name doubles as identifier.
            uuid: Some(uname.to_string()),
            uname: Some(uname.to_string()),
            id: None,
            state: Liveness::Lost,
            remote: true,
            dirty: false,
            join: JoinPhase::None,
            last_seen: None,
            expected: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == Liveness::Member
    }

    fn display_name(&self) -> &str {
        self.uname.as_deref().unwrap_or("<unknown>")
    }
}

/// What changed about a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerChange {
    State { old: Liveness, new: Liveness },
    Join { old: JoinPhase, new: JoinPhase },
    Flags,
}

/// Status-change notification dispatched to subscribers.
#[derive(Clone, Debug)]
pub struct PeerEvent {
    pub uname: Option<String>,
    pub id: Option<u32>,
    pub change: PeerChange,
}

/// Owning cache of every node the cluster has ever told us about.
pub struct PeerCache {
    entries: HashMap<u64, PeerNode>,
    next_key: u64,
    autoreap: bool,
    events: broadcast::Sender<PeerEvent>,
    log: Logger,
}

impl PeerCache {
    pub fn new(log: Logger) -> Self {
        let (events, _) = broadcast::channel(256);
        PeerCache {
            entries: HashMap::new(),
            next_key: 1,
            autoreap: true,
            events,
            log,
        }
    }

    /// Subscribe to peer status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Toggle automatic removal of departed peers. The transition engine
    /// turns this off around fencing so the stonith bookkeeping does not
    /// race with the sweep.
    pub fn set_autoreap(&mut self, autoreap: bool) {
        if self.autoreap != autoreap {
            debug!(self.log, "Peer auto-reap changed"; "enabled" => autoreap);
        }
        self.autoreap = autoreap;
    }

    pub fn autoreap(&self) -> bool {
        self.autoreap
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn emit(&self, key: u64, change: PeerChange) {
        if let Some(node) = self.entries.get(&key) {
            let _ = self.events.send(PeerEvent {
                uname: node.uname.clone(),
                id: node.id,
                change,
            });
        }
    }

    fn matches_filter(node: &PeerNode, filter: PeerFilter) -> bool {
        match filter {
            PeerFilter::Cluster => !node.remote,
            PeerFilter::Remote => node.remote,
            PeerFilter::Any => true,
        }
    }

    fn key_by_id(&self, id: u32, filter: PeerFilter) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, n)| Self::matches_filter(n, filter) && n.id == Some(id))
            .map(|(k, _)| *k)
    }

    fn key_by_name(&self, uname: &str, filter: PeerFilter) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, n)| Self::matches_filter(n, filter) && n.uname.as_deref() == Some(uname))
            .map(|(k, _)| *k)
    }

    /// Find a peer without creating it, healing partial identities on the
    /// way: an entry known only by name gains its bus id the first time a
    /// message carrying both arrives, and vice versa. Two entries found to
    /// describe the same physical node are merged, the older entry's fields
    /// copied into the newer one only where the newer is empty.
    pub fn find(
        &mut self,
        id: Option<u32>,
        uname: Option<&str>,
        filter: PeerFilter,
    ) -> Option<&mut PeerNode> {
        let by_id = id.and_then(|n| self.key_by_id(n, filter));
        let by_name = uname.and_then(|u| self.key_by_name(u, filter));

        let key = match (by_id, by_name) {
            (Some(a), Some(b)) if a == b => a,
            (Some(a), Some(b)) => self.merge(a, b),
            (Some(a), None) => {
                if let Some(u) = uname {
                    let node = self.entries.get_mut(&a).expect("entry exists");
                    if node.uname.is_none() {
                        info!(self.log, "Learned name for peer";
                            "id" => node.id, "uname" => u);
                        node.uname = Some(u.to_string());
                    } else if node.uname.as_deref() != Some(u) {
                        warn!(self.log, "Peer renamed";
                            "id" => node.id,
                            "old" => node.uname.as_deref().unwrap_or(""),
                            "new" => u);
                        node.uname = Some(u.to_string());
                    }
                }
                a
            }
            (None, Some(b)) => {
                if let Some(n) = id {
                    let node = self.entries.get_mut(&b).expect("entry exists");
                    if node.id.is_none() && !node.remote {
                        info!(self.log, "Learned bus id for peer";
                            "uname" => node.display_name().to_string(), "id" => n);
                        node.id = Some(n);
                        if node.uuid.is_none() {
                            node.uuid = Some(n.to_string());
                        }
                    }
                }
                b
            }
            (None, None) => return None,
        };
        self.entries.get_mut(&key)
    }

    /// Find-or-create. Remote entries are never created here; they only
    /// come from the configuration via [`PeerCache::refresh_remote`].
    pub fn get(
        &mut self,
        id: Option<u32>,
        uname: Option<&str>,
        filter: PeerFilter,
    ) -> Option<&mut PeerNode> {
        if id.is_none() && uname.is_none() {
            return None;
        }
        // Split borrow: probe first, then create.
        let found = self.find(id, uname, filter).is_some();
        if !found {
            if filter == PeerFilter::Remote {
                return None;
            }
            let key = self.next_key;
            self.next_key += 1;
            let node = PeerNode::new_cluster(id, uname);
            debug!(self.log, "Created peer cache entry";
                "uname" => node.display_name().to_string(), "id" => node.id);
            self.entries.insert(key, node);
            return self.entries.get_mut(&key);
        }
        self.find(id, uname, filter)
    }

    /// Merge two entries referring to the same physical node. Keeps the
    /// newer entry (the higher key), fills its empty fields from the older
    /// one, and removes the older. Returns the surviving key.
    fn merge(&mut self, a: u64, b: u64) -> u64 {
        let (older_key, newer_key) = if a < b { (a, b) } else { (b, a) };
        let older = self.entries.remove(&older_key).expect("entry exists");
        let newer = self.entries.get_mut(&newer_key).expect("entry exists");

        warn!(self.log, "Merging duplicate peer cache entries";
            "kept" => newer.display_name().to_string(),
            "removed" => older.display_name().to_string());

        if newer.uuid.is_none() {
            newer.uuid = older.uuid;
        }
        if newer.uname.is_none() {
            newer.uname = older.uname;
        }
        if newer.id.is_none() {
            newer.id = older.id;
        }
        if newer.last_seen.is_none() {
            newer.last_seen = older.last_seen;
        }
        if newer.expected.is_none() {
            newer.expected = older.expected;
        }
        newer_key
    }

    /// Record that the process group reported this node gone: liveness to
    /// `Lost`, join phase to `None`. The entry survives, marked dirty, so
    /// the next sweep can decide whether to reap it.
    pub fn process_group_left(&mut self, id: Option<u32>, uname: Option<&str>) {
        let key = match self.find(id, uname, PeerFilter::Cluster) {
            Some(_) => self
                .entry_key(id, uname, PeerFilter::Cluster)
                .expect("just found"),
            None => return,
        };
        self.set_liveness_key(key, Liveness::Lost);
        self.set_join_key(key, JoinPhase::None);
        let node = self.entries.get_mut(&key).expect("entry exists");
        if !node.dirty {
            node.dirty = true;
            self.emit(key, PeerChange::Flags);
        }
    }

    fn entry_key(&self, id: Option<u32>, uname: Option<&str>, filter: PeerFilter) -> Option<u64> {
        id.and_then(|n| self.key_by_id(n, filter))
            .or_else(|| uname.and_then(|u| self.key_by_name(u, filter)))
    }

    fn set_liveness_key(&mut self, key: u64, state: Liveness) {
        let node = self.entries.get_mut(&key).expect("entry exists");
        let old = node.state;
        if old == state {
            return;
        }
        node.state = state;
        if state == Liveness::Member {
            node.last_seen = Some(SystemTime::now());
            node.dirty = false;
        }
        info!(self.log, "Peer state change";
            "uname" => node.display_name().to_string(),
            "old" => old.as_str(), "new" => state.as_str());
        self.emit(key, PeerChange::State { old, new: state });
    }

    fn set_join_key(&mut self, key: u64, join: JoinPhase) {
        let node = self.entries.get_mut(&key).expect("entry exists");
        let old = node.join;
        if old == join {
            return;
        }
        node.join = join;
        debug!(self.log, "Peer join phase change";
            "uname" => node.display_name().to_string(),
            "old" => old.as_str(), "new" => join.as_str());
        self.emit(key, PeerChange::Join { old, new: join });
    }

    /// Update a peer's liveness, creating the entry if necessary.
    pub fn update_liveness(&mut self, id: Option<u32>, uname: Option<&str>, state: Liveness) {
        if self.get(id, uname, PeerFilter::Any).is_none() {
            return;
        }
        if let Some(key) = self.entry_key(id, uname, PeerFilter::Any) {
            self.set_liveness_key(key, state);
        }
    }

    /// Update a peer's join phase.
    pub fn update_join(&mut self, uname: &str, join: JoinPhase) {
        if let Some(key) = self.key_by_name(uname, PeerFilter::Any) {
            self.set_join_key(key, join);
        }
    }

    /// Record the expected follow-up state for a peer (leader bookkeeping).
    pub fn update_expected(&mut self, uname: &str, expected: &str) {
        if let Some(key) = self.key_by_name(uname, PeerFilter::Any) {
            let node = self.entries.get_mut(&key).expect("entry exists");
            node.expected = Some(expected.to_string());
        }
    }

    /// Explicitly mark matching entries dirty and remove them, regardless of
    /// the auto-reap setting. Returns how many entries were removed.
    pub fn mark_dirty_and_reap(&mut self, id: Option<u32>, uname: Option<&str>) -> usize {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, n)| {
                (id.is_some() && n.id == id)
                    || (uname.is_some() && n.uname.as_deref() == uname)
            })
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(node) = self.entries.remove(key) {
                info!(self.log, "Reaped peer cache entry";
                    "uname" => node.display_name().to_string(), "id" => node.id);
            }
        }
        keys.len()
    }

    /// Sweep: remove dirty entries that are not remote. A no-op while
    /// auto-reap is disabled.
    pub fn sweep(&mut self) -> usize {
        if !self.autoreap {
            return 0;
        }
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, n)| n.dirty && !n.remote)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(node) = self.entries.remove(key) {
                info!(self.log, "Swept departed peer";
                    "uname" => node.display_name().to_string(), "id" => node.id);
            }
        }
        keys.len()
    }

    /// Iterate peers currently in the `Member` state.
    pub fn active_peers(&self) -> impl Iterator<Item = &PeerNode> {
        self.entries.values().filter(|n| n.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_peers().count()
    }

    /// Re-sync the remote-node subset against the names currently present
    /// in the configuration: missing entries are added, entries for names
    /// no longer configured are removed.
    pub fn refresh_remote(&mut self, configured: &[&str]) {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, n)| {
                n.remote
                    && n.uname
                        .as_deref()
                        .map(|u| !configured.contains(&u))
                        .unwrap_or(true)
            })
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(node) = self.entries.remove(&key) {
                info!(self.log, "Removed unconfigured remote peer";
                    "uname" => node.display_name().to_string());
            }
        }

        for name in configured {
            if self.key_by_name(name, PeerFilter::Remote).is_none() {
                let key = self.next_key;
                self.next_key += 1;
                info!(self.log, "Added remote peer from configuration"; "uname" => *name);
                self.entries.insert(key, PeerNode::new_remote(name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Drain};

    fn create_test_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    }

    #[test]
    fn test_create_and_find_by_either_key() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.get(Some(1), Some("alpha"), PeerFilter::Cluster).unwrap();

        assert!(cache.find(Some(1), None, PeerFilter::Cluster).is_some());
        assert!(cache.find(None, Some("alpha"), PeerFilter::Cluster).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_heal_name_and_id() {
        let mut cache = PeerCache::new(create_test_logger());
        // First sighting: membership event, id only.
        cache.get(Some(2), None, PeerFilter::Cluster).unwrap();
        // Second sighting: a message carrying both.
        let node = cache.find(Some(2), Some("beta"), PeerFilter::Cluster).unwrap();
        assert_eq!(node.uname.as_deref(), Some("beta"));

        // Name-first entry gains its id.
        cache.get(None, Some("gamma"), PeerFilter::Cluster).unwrap();
        let node = cache.find(Some(3), Some("gamma"), PeerFilter::Cluster).unwrap();
        assert_eq!(node.id, Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_merge_duplicate_entries() {
        let mut cache = PeerCache::new(create_test_logger());
        // Entry known only by name, then a separate entry by id.
        cache.get(None, Some("delta"), PeerFilter::Cluster).unwrap();
        cache.get(Some(4), None, PeerFilter::Cluster).unwrap();
        assert_eq!(cache.len(), 2);

        // A lookup naming both reveals they are the same node.
        let node = cache.find(Some(4), Some("delta"), PeerFilter::Cluster).unwrap();
        assert_eq!(node.id, Some(4));
        assert_eq!(node.uname.as_deref(), Some("delta"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_group_leave_marks_lost_and_dirty() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.get(Some(5), Some("eps"), PeerFilter::Cluster).unwrap();
        cache.update_liveness(Some(5), Some("eps"), Liveness::Member);
        cache.update_join("eps", JoinPhase::Confirmed);

        cache.process_group_left(Some(5), Some("eps"));
        let node = cache.find(Some(5), None, PeerFilter::Cluster).unwrap();
        assert_eq!(node.state, Liveness::Lost);
        assert_eq!(node.join, JoinPhase::None);
        assert!(node.dirty);
        // Entry survives until the sweep.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_respects_autoreap() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.get(Some(6), Some("zeta"), PeerFilter::Cluster).unwrap();
        cache.process_group_left(Some(6), Some("zeta"));

        cache.set_autoreap(false);
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);

        cache.set_autoreap(true);
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remote_nodes_survive_sweep() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.refresh_remote(&["guest1"]);
        let node = cache.find(None, Some("guest1"), PeerFilter::Remote).unwrap();
        node.dirty = true;

        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refresh_remote_adds_and_removes() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.refresh_remote(&["guest1", "guest2"]);
        assert_eq!(cache.len(), 2);

        cache.refresh_remote(&["guest2"]);
        assert!(cache.find(None, Some("guest1"), PeerFilter::Remote).is_none());
        assert!(cache.find(None, Some("guest2"), PeerFilter::Remote).is_some());
    }

    #[test]
    fn test_remote_filter_never_creates() {
        let mut cache = PeerCache::new(create_test_logger());
        assert!(cache.get(None, Some("ghost"), PeerFilter::Remote).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_status_events() {
        let mut cache = PeerCache::new(create_test_logger());
        let mut rx = cache.subscribe();

        cache.get(Some(7), Some("eta"), PeerFilter::Cluster).unwrap();
        cache.update_liveness(Some(7), None, Liveness::Member);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.uname.as_deref(), Some("eta"));
        assert_eq!(
            event.change,
            PeerChange::State { old: Liveness::Lost, new: Liveness::Member }
        );
    }

    #[test]
    fn test_mark_dirty_and_reap_ignores_autoreap() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.set_autoreap(false);
        cache.get(Some(8), Some("theta"), PeerFilter::Cluster).unwrap();

        assert_eq!(cache.mark_dirty_and_reap(Some(8), None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_active_peers_iteration() {
        let mut cache = PeerCache::new(create_test_logger());
        cache.get(Some(1), Some("a"), PeerFilter::Cluster).unwrap();
        cache.get(Some(2), Some("b"), PeerFilter::Cluster).unwrap();
        cache.update_liveness(Some(1), None, Liveness::Member);

        assert_eq!(cache.active_count(), 1);
        let names: Vec<_> = cache
            .active_peers()
            .map(|n| n.uname.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
    }
}
