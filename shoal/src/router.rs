//! Consistent-hash routing across shard connections.
//!
//! The router owns one connection actor per configured server and an
//! immutable ring snapshot mapping keys to shards. When a connection's
//! durable state changes (a reconnect round exhausts, an auth failure,
//! a recovery), a background task rebuilds the snapshot wholesale and
//! swaps it in. Readers never see a half-updated ring.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::select_all;
use tokio::sync::watch;
use tracing::debug;

use shoal_ring::{HashRing, RingBuilder};

use crate::config::Config;
use crate::connection::{ConnState, ConnectionHandle};
use crate::error::Error;

/// Immutable view of ring membership. `members[ring.route(key)]` is the
/// index of the owning shard in config order.
struct RingSnapshot {
    ring: Option<HashRing>,
    members: Vec<usize>,
}

pub(crate) struct Router {
    shards: Vec<ConnectionHandle>,
    /// Ring over every configured server, used to name the owning shard
    /// when the live membership is empty.
    full_ring: HashRing,
    snapshot: Arc<ArcSwap<RingSnapshot>>,
}

impl Router {
    /// Spawn a connection per configured server and start the membership
    /// watcher.
    pub fn new(config: Arc<Config>) -> Self {
        let shards: Vec<ConnectionHandle> = config
            .servers
            .iter()
            .map(|&(addr, _)| ConnectionHandle::spawn(addr, config.clone()))
            .collect();

        let servers = config.servers.clone();
        let full_ring = build_member_ring(&servers, &(0..servers.len()).collect::<Vec<_>>());
        let initial = build_snapshot(&servers, &vec![false; servers.len()]);
        let snapshot = Arc::new(ArcSwap::from_pointee(initial));

        let watches: Vec<(usize, watch::Receiver<ConnState>)> = shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| (idx, shard.watch_state()))
            .collect();
        tokio::spawn(watch_membership(servers, watches, snapshot.clone()));

        Self {
            shards,
            full_ring,
            snapshot,
        }
    }

    /// The connection owning `key`'s shard.
    ///
    /// A shard whose connection is not ready fails with
    /// [`Error::ShardUnavailable`]; keys are never silently redirected to
    /// another shard while their owner is merely reconnecting.
    pub fn route(&self, key: &[u8]) -> Result<ConnectionHandle, Error> {
        let snapshot = self.snapshot.load();
        let shard = match &snapshot.ring {
            Some(ring) => &self.shards[snapshot.members[ring.route(key)]],
            None => &self.shards[self.full_ring.route(key)],
        };
        if shard.state().is_ready() {
            Ok(shard.clone())
        } else {
            Err(Error::ShardUnavailable(shard.addr))
        }
    }

    /// Route a key set that must live on one shard.
    pub fn route_same(&self, keys: &[impl AsRef<[u8]>]) -> Result<ConnectionHandle, Error> {
        let mut keys = keys.iter();
        let first = keys
            .next()
            .ok_or_else(|| Error::Config("empty key list".into()))?;
        let shard = self.route(first.as_ref())?;
        for key in keys {
            let other = self.route(key.as_ref())?;
            if other.addr != shard.addr {
                return Err(Error::Config(
                    "multi-get keys must hash to the same shard".into(),
                ));
            }
        }
        Ok(shard)
    }

    /// Every currently ready connection, in config order. Broadcasts use
    /// the set returned here as their snapshot for the whole round, so a
    /// concurrent membership change never splices old and new results.
    pub fn route_all(&self) -> Result<Vec<ConnectionHandle>, Error> {
        let ready: Vec<ConnectionHandle> = self
            .shards
            .iter()
            .filter(|shard| shard.state().is_ready())
            .cloned()
            .collect();
        if ready.is_empty() {
            return Err(Error::ShardUnavailable(self.shards[0].addr));
        }
        Ok(ready)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Wait until at least one shard is ready.
    ///
    /// Fails fast with the authentication error if any shard's handshake
    /// failed, since waiting longer cannot help.
    pub async fn wait_any_ready(&self) -> Result<(), Error> {
        self.wait(|states| states.iter().any(ConnState::is_ready)).await
    }

    /// Wait until every shard is ready.
    pub async fn wait_all_ready(&self) -> Result<(), Error> {
        self.wait(|states| states.iter().all(ConnState::is_ready)).await
    }

    async fn wait(&self, done: impl Fn(&[ConnState]) -> bool) -> Result<(), Error> {
        let mut states: Vec<ConnState> = self.shards.iter().map(|s| s.state()).collect();
        let mut watches: Vec<(usize, watch::Receiver<ConnState>)> = self
            .shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| (idx, shard.watch_state()))
            .collect();
        loop {
            for (idx, watch) in &watches {
                states[*idx] = *watch.borrow();
            }
            if states.contains(&ConnState::AuthFailed) {
                return Err(Error::Authentication(
                    "a shard failed authentication".into(),
                ));
            }
            if done(&states) {
                return Ok(());
            }
            if watches.is_empty() || states.iter().all(|state| *state == ConnState::Closed) {
                return Err(Error::Closed);
            }

            let changes = watches
                .iter_mut()
                .map(|(_, watch)| Box::pin(watch.changed()))
                .collect::<Vec<_>>();
            let (result, which, _) = select_all(changes).await;
            if result.is_err() {
                // Actor gone; record its terminal state and stop polling.
                let (idx, watch) = watches.remove(which);
                states[idx] = *watch.borrow();
            }
        }
    }
}

/// Rebuild the snapshot whenever a shard enters or leaves the excluded
/// states.
async fn watch_membership(
    servers: Vec<(SocketAddr, u32)>,
    mut watches: Vec<(usize, watch::Receiver<ConnState>)>,
    snapshot: Arc<ArcSwap<RingSnapshot>>,
) {
    let mut excluded = vec![false; servers.len()];
    loop {
        let mut changed = false;
        for (idx, watch) in &watches {
            let now = watch.borrow().is_excluded();
            if excluded[*idx] != now {
                excluded[*idx] = now;
                changed = true;
            }
        }
        if changed {
            let members: Vec<usize> = (0..servers.len()).filter(|&i| !excluded[i]).collect();
            debug!(?members, "ring membership changed");
            snapshot.store(Arc::new(build_snapshot(&servers, &excluded)));
        }

        if watches.is_empty() {
            return;
        }
        let changes = watches
            .iter_mut()
            .map(|(_, watch)| Box::pin(watch.changed()))
            .collect::<Vec<_>>();
        let (result, which, _) = select_all(changes).await;
        if result.is_err() {
            // Actor gone; its last state was terminal. Stop polling it.
            let (idx, watch) = watches.remove(which);
            excluded[idx] = watch.borrow().is_excluded();
            snapshot.store(Arc::new(build_snapshot(&servers, &excluded)));
        }
    }
}

fn build_snapshot(servers: &[(SocketAddr, u32)], excluded: &[bool]) -> RingSnapshot {
    let members: Vec<usize> = (0..servers.len()).filter(|&i| !excluded[i]).collect();
    if members.is_empty() {
        return RingSnapshot {
            ring: None,
            members,
        };
    }
    let ring = build_member_ring(servers, &members);
    RingSnapshot {
        ring: Some(ring),
        members,
    }
}

fn build_member_ring(servers: &[(SocketAddr, u32)], members: &[usize]) -> HashRing {
    let mut builder = RingBuilder::new();
    for &idx in members {
        let (addr, weight) = servers[idx];
        builder.shard(&addr.to_string(), weight);
    }
    builder.build()
}
