//! Connections by address and connection id, and the server session cache.
//!
//! One short lock guards all indexes so they always describe the same set of
//! connections. Connections themselves carry their own lock. The store never
//! takes a connection lock, a caller holding one may call into the store.
//!
//! A handshake that skipped the address check does not end the connection
//! bound to its address. That one is parked: it leaves the address index but
//! keeps its connection id and session until the new handshake settles.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Error;
use crate::message::{ConnectionId, SessionId};
use crate::session::Session;

/// Stable handle of a stored connection. Never reused.
pub(crate) type ConnKey = u64;

#[derive(Debug)]
struct Entry<T> {
    connection: Arc<Mutex<T>>,
    peer: SocketAddr,
    cid: Option<ConnectionId>,
    session: Option<SessionId>,
    last_activity: Instant,
    /// Resumption that skipped the address check and has not finished yet.
    unverified: bool,
    /// Connection parked for this one, see [`ConnectionStore::predecessor`].
    predecessor: Option<ConnKey>,
}

#[derive(Debug)]
struct Inner<T> {
    next_key: ConnKey,
    entries: HashMap<ConnKey, Entry<T>>,
    by_addr: HashMap<SocketAddr, ConnKey>,
    by_cid: HashMap<ConnectionId, ConnKey>,
    sessions: HashMap<SessionId, (Session, ConnKey)>,
    /// Least recently active first.
    lru: BTreeSet<(Instant, ConnKey)>,
    unverified: usize,
}

/// A connection dropped from the store to make room or on request.
#[derive(Debug)]
pub(crate) struct Removed<T> {
    pub key: ConnKey,
    pub peer: SocketAddr,
    pub connection: Arc<Mutex<T>>,
    pub session: Option<SessionId>,
}

/// Outcome of [`ConnectionStore::put`].
#[derive(Debug)]
pub(crate) struct Inserted<T> {
    pub key: ConnKey,
    pub connection: Arc<Mutex<T>>,
    /// Connections previously bound to the same address.
    pub replaced: Vec<Removed<T>>,
    /// A stale connection evicted for capacity.
    pub evicted: Option<Removed<T>>,
}

#[derive(Debug)]
pub(crate) struct ConnectionStore<T> {
    capacity: usize,
    stale_threshold: Duration,
    inner: Mutex<Inner<T>>,
}

impl<T> ConnectionStore<T> {
    pub fn new(capacity: usize, stale_threshold: Duration) -> Self {
        ConnectionStore {
            capacity,
            stale_threshold,
            inner: Mutex::new(Inner {
                next_key: 1,
                entries: HashMap::new(),
                by_addr: HashMap::new(),
                by_cid: HashMap::new(),
                sessions: HashMap::new(),
                lru: BTreeSet::new(),
                unverified: 0,
            }),
        }
    }

    pub fn find_by_address(&self, peer: SocketAddr) -> Option<(ConnKey, Arc<Mutex<T>>)> {
        let inner = self.inner.lock();
        let key = *inner.by_addr.get(&peer)?;
        inner.entries.get(&key).map(|e| (key, e.connection.clone()))
    }

    pub fn find_by_cid(&self, cid: &ConnectionId) -> Option<(ConnKey, Arc<Mutex<T>>)> {
        let inner = self.inner.lock();
        let key = *inner.by_cid.get(cid)?;
        inner.entries.get(&key).map(|e| (key, e.connection.clone()))
    }

    pub fn get(&self, key: ConnKey) -> Option<Arc<Mutex<T>>> {
        self.inner.lock().entries.get(&key).map(|e| e.connection.clone())
    }

    pub fn find_session(&self, id: &SessionId) -> Option<Session> {
        if id.is_empty() {
            return None;
        }
        self.inner.lock().sessions.get(id).map(|(s, _)| s.clone())
    }

    /// Session of the connection bound to `peer`, or of the one parked for it.
    pub fn address_session(&self, peer: SocketAddr) -> Option<SessionId> {
        let inner = self.inner.lock();
        let key = *inner.by_addr.get(&peer)?;
        let entry = inner.entries.get(&key)?;
        entry.session.or_else(|| {
            let parked = inner.predecessor_of(key)?;
            inner.entries.get(&parked).and_then(|e| e.session)
        })
    }

    /// The connection parked while `key` runs an unverified handshake.
    pub fn predecessor(&self, key: ConnKey) -> Option<(ConnKey, Arc<Mutex<T>>)> {
        let inner = self.inner.lock();
        let parked = inner.predecessor_of(key)?;
        inner.entries.get(&parked).map(|e| (parked, e.connection.clone()))
    }

    /// Insert a connection for `peer`, built by `make` from its key.
    ///
    /// A verified connection replaces the ones bound to `peer` and takes over
    /// their cached session. An unverified one parks the connection bound to
    /// `peer` instead, or takes over the parked one of an earlier unverified
    /// handshake. A full store evicts its least recently active connection if
    /// that one is stale, otherwise the insert is rejected.
    pub fn put(
        &self,
        now: Instant,
        peer: SocketAddr,
        unverified: bool,
        make: impl FnOnce(ConnKey) -> T,
    ) -> Result<Inserted<T>, Error> {
        let mut inner = self.inner.lock();

        let grows = match inner.by_addr.get(&peer).copied() {
            None => true,
            Some(current) => unverified && inner.predecessor_of(current).is_none(),
        };

        let mut evicted = None;
        if grows && inner.entries.len() >= self.capacity {
            let oldest = inner.lru.iter().next().copied();
            match oldest {
                Some((last_activity, key)) if now.saturating_duration_since(last_activity) >= self.stale_threshold => {
                    debug!("Evict stale connection {}", key);
                    evicted = inner.remove(key, None);
                }
                _ => {
                    debug!("Store full, reject connection from {}", peer);
                    return Err(Error::ConnectionRejected);
                }
            }
        }

        let key = inner.next_key;
        inner.next_key += 1;

        let current = inner.by_addr.get(&peer).copied();
        let parked = current.and_then(|c| inner.predecessor_of(c));

        let mut replaced = Vec::new();
        let predecessor = match current {
            None => None,
            Some(current) if unverified => {
                if parked.is_some() {
                    replaced.extend(inner.remove(current, None));
                    parked
                } else {
                    debug!("Park connection {} for {}", current, key);
                    inner.by_addr.remove(&peer);
                    Some(current)
                }
            }
            Some(current) => {
                replaced.extend(inner.remove(current, Some(key)));
                replaced.extend(parked.and_then(|p| inner.remove(p, Some(key))));
                None
            }
        };
        let session = replaced
            .iter()
            .filter_map(|r| r.session)
            .find(|id| inner.sessions.get(id).map(|(_, owner)| *owner) == Some(key));

        let connection = Arc::new(Mutex::new(make(key)));
        inner.entries.insert(
            key,
            Entry {
                connection: connection.clone(),
                peer,
                cid: None,
                session,
                last_activity: now,
                unverified,
                predecessor,
            },
        );
        inner.by_addr.insert(peer, key);
        inner.lru.insert((now, key));
        if unverified {
            inner.unverified += 1;
        }

        Ok(Inserted {
            key,
            connection,
            replaced,
            evicted,
        })
    }

    pub fn touch(&self, key: ConnKey, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return;
        };
        let previous = entry.last_activity;
        if now <= previous {
            return;
        }
        entry.last_activity = now;
        inner.lru.remove(&(previous, key));
        inner.lru.insert((now, key));
    }

    /// Drop `key`. A connection parked for it gets its address back.
    pub fn remove(&self, key: ConnKey) -> Option<Removed<T>> {
        let mut inner = self.inner.lock();
        let parked = inner.predecessor_of(key);
        let removed = inner.remove(key, None)?;
        if let Some(parked) = parked {
            let peer = inner.entries.get(&parked).map(|e| e.peer);
            if let Some(peer) = peer {
                if !inner.by_addr.contains_key(&peer) {
                    debug!("Connection {} back on {}", parked, peer);
                    inner.by_addr.insert(peer, parked);
                }
            }
        }
        Some(removed)
    }

    /// Rebind a connection to `peer`. Another connection holding that address
    /// is removed and returned.
    pub fn update_address(&self, key: ConnKey, peer: SocketAddr) -> Option<Removed<T>> {
        let mut inner = self.inner.lock();
        let old_peer = inner.entries.get(&key)?.peer;
        if old_peer == peer {
            return None;
        }

        let displaced = match inner.by_addr.get(&peer).copied() {
            Some(other) if other != key => inner.remove(other, None),
            _ => None,
        };

        if inner.by_addr.get(&old_peer) == Some(&key) {
            inner.by_addr.remove(&old_peer);
        }
        inner.by_addr.insert(peer, key);
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.peer = peer;
        }
        debug!("Connection {} moved from {} to {}", key, old_peer, peer);
        displaced
    }

    /// Set or clear the connection id peers use to reach this connection.
    pub fn update_cid(&self, key: ConnKey, cid: Option<ConnectionId>) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return;
        };
        let old = std::mem::replace(&mut entry.cid, cid);
        if let Some(old) = old {
            if inner.by_cid.get(&old) == Some(&key) {
                inner.by_cid.remove(&old);
            }
        }
        if let Some(cid) = cid {
            inner.by_cid.insert(cid, key);
        }
    }

    /// Cache the session established on a connection, replacing the one it
    /// held before. Ends the unverified state of the connection.
    ///
    /// Returns the connection that was parked for this one, now dropped.
    pub fn put_session(&self, key: ConnKey, session: &Session) -> Option<Removed<T>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key)?;
        let unverified = std::mem::replace(&mut entry.unverified, false);
        let previous = if session.is_resumable() {
            std::mem::replace(&mut entry.session, Some(*session.id()))
        } else {
            entry.session.take()
        };
        if unverified {
            inner.unverified -= 1;
        }
        if let Some(previous) = previous {
            if inner.sessions.get(&previous).map(|(_, owner)| *owner) == Some(key) {
                inner.sessions.remove(&previous);
            }
        }
        if session.is_resumable() {
            inner.sessions.insert(*session.id(), (session.clone(), key));
        }
        inner.settle(key)
    }

    /// A connection's handshake ended without a session to cache.
    pub fn set_verified(&self, key: ConnKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            if std::mem::replace(&mut entry.unverified, false) {
                inner.unverified -= 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Resumption handshakes in progress that skipped the address check.
    pub fn pending_unverified_resumptions(&self) -> usize {
        self.inner.lock().unverified
    }
}

impl<T> Inner<T> {
    fn predecessor_of(&self, key: ConnKey) -> Option<ConnKey> {
        let parked = self.entries.get(&key)?.predecessor?;
        self.entries.contains_key(&parked).then_some(parked)
    }

    /// `key` completed its handshake, the connection parked for it goes.
    fn settle(&mut self, key: ConnKey) -> Option<Removed<T>> {
        let parked = self.entries.get_mut(&key)?.predecessor.take()?;
        debug!("Connection {} replaces parked {}", key, parked);
        self.remove(parked, None)
    }

    /// Drop `key` from every index. A cached session it owns moves to `heir`
    /// if given, otherwise it is dropped too.
    fn remove(&mut self, key: ConnKey, heir: Option<ConnKey>) -> Option<Removed<T>> {
        let entry = self.entries.remove(&key)?;
        if self.by_addr.get(&entry.peer) == Some(&key) {
            self.by_addr.remove(&entry.peer);
        }
        if let Some(cid) = entry.cid {
            if self.by_cid.get(&cid) == Some(&key) {
                self.by_cid.remove(&cid);
            }
        }
        if let Some(id) = entry.session {
            let owned = self.sessions.get(&id).map(|(_, owner)| *owner) == Some(key);
            match heir {
                Some(heir) if owned => {
                    if let Some((_, owner)) = self.sessions.get_mut(&id) {
                        *owner = heir;
                    }
                }
                None if owned => {
                    self.sessions.remove(&id);
                }
                _ => {}
            }
        }
        self.lru.remove(&(entry.last_activity, key));
        if entry.unverified {
            self.unverified -= 1;
        }
        Some(Removed {
            key,
            peer: entry.peer,
            connection: entry.connection,
            session: entry.session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CipherSuite;
    use crate::session::{MasterSecret, PeerIdentity};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn session() -> Session {
        Session::new(
            SessionId::random(32),
            CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256,
            None,
            None,
            PeerIdentity::Psk(b"id".to_vec()),
            MasterSecret::new([1; 48]),
            true,
            None,
            Instant::now(),
        )
    }

    fn store(capacity: usize) -> ConnectionStore<u16> {
        ConnectionStore::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn lookups_by_address_and_cid() {
        let s = store(10);
        let now = Instant::now();
        let ins = s.put(now, addr(1), false, |_| 1).unwrap();
        let cid = ConnectionId::try_new(&[1, 2, 3, 4]).unwrap();
        s.update_cid(ins.key, Some(cid));

        assert_eq!(s.find_by_address(addr(1)).unwrap().0, ins.key);
        assert_eq!(s.find_by_cid(&cid).unwrap().0, ins.key);
        assert_eq!(*s.get(ins.key).unwrap().lock(), 1);

        s.remove(ins.key).unwrap();
        assert!(s.find_by_address(addr(1)).is_none());
        assert!(s.find_by_cid(&cid).is_none());
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn full_store_evicts_only_stale() {
        let s = store(2);
        let t0 = Instant::now();
        let a = s.put(t0, addr(1), false, |_| 1).unwrap();
        s.put(t0 + Duration::from_secs(10), addr(2), false, |_| 2).unwrap();

        let err = s.put(t0 + Duration::from_secs(30), addr(3), false, |_| 3);
        assert!(matches!(err, Err(Error::ConnectionRejected)));

        let ins = s.put(t0 + Duration::from_secs(61), addr(3), false, |_| 3).unwrap();
        assert_eq!(ins.evicted.unwrap().key, a.key);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn touch_protects_from_eviction() {
        let s = store(2);
        let t0 = Instant::now();
        let a = s.put(t0, addr(1), false, |_| 1).unwrap();
        let b = s.put(t0, addr(2), false, |_| 2).unwrap();
        s.touch(a.key, t0 + Duration::from_secs(50));

        let ins = s.put(t0 + Duration::from_secs(70), addr(3), false, |_| 3).unwrap();
        assert_eq!(ins.evicted.unwrap().key, b.key);
    }

    #[test]
    fn session_follows_replacement_at_same_address() {
        let s = store(10);
        let now = Instant::now();
        let a = s.put(now, addr(1), false, |_| 1).unwrap();
        let sess = session();
        s.put_session(a.key, &sess);
        assert!(s.find_session(sess.id()).is_some());
        assert_eq!(s.address_session(addr(1)), Some(*sess.id()));

        let b = s.put(now, addr(1), false, |_| 2).unwrap();
        assert_eq!(b.replaced[0].key, a.key);
        assert!(s.find_session(sess.id()).is_some());

        s.remove(b.key);
        assert!(s.find_session(sess.id()).is_none());
    }

    #[test]
    fn address_update_displaces_other_connection() {
        let s = store(10);
        let now = Instant::now();
        let a = s.put(now, addr(1), false, |_| 1).unwrap();
        let b = s.put(now, addr(2), false, |_| 2).unwrap();

        let displaced = s.update_address(a.key, addr(2)).unwrap();
        assert_eq!(displaced.key, b.key);
        assert_eq!(s.find_by_address(addr(2)).unwrap().0, a.key);
        assert!(s.find_by_address(addr(1)).is_none());
        assert_eq!(displaced.peer, addr(2));
    }

    #[test]
    fn unverified_count() {
        let s = store(10);
        let now = Instant::now();
        let a = s.put(now, addr(1), true, |_| 1).unwrap();
        let b = s.put(now, addr(2), true, |_| 2).unwrap();
        assert_eq!(s.pending_unverified_resumptions(), 2);

        s.put_session(a.key, &session());
        assert_eq!(s.pending_unverified_resumptions(), 1);
        s.remove(b.key);
        assert_eq!(s.pending_unverified_resumptions(), 0);
    }

    #[test]
    fn unverified_handshake_parks_current_connection() {
        let s = store(10);
        let now = Instant::now();
        let a = s.put(now, addr(1), false, |_| 1).unwrap();
        let cid = ConnectionId::try_new(&[9, 9, 9, 9]).unwrap();
        s.update_cid(a.key, Some(cid));
        let sess = session();
        s.put_session(a.key, &sess);

        let b = s.put(now, addr(1), true, |_| 2).unwrap();
        assert!(b.replaced.is_empty());
        assert_eq!(s.len(), 2);
        assert_eq!(s.find_by_address(addr(1)).unwrap().0, b.key);
        assert_eq!(s.find_by_cid(&cid).unwrap().0, a.key);
        assert_eq!(s.predecessor(b.key).unwrap().0, a.key);
        assert_eq!(s.address_session(addr(1)), Some(*sess.id()));
        assert!(s.find_session(sess.id()).is_some());

        // Completing the handshake drops the parked connection, not the session.
        let parked = s.put_session(b.key, &sess).unwrap();
        assert_eq!(parked.key, a.key);
        assert_eq!(s.len(), 1);
        assert!(s.find_by_cid(&cid).is_none());
        assert!(s.predecessor(b.key).is_none());
        assert!(s.find_session(sess.id()).is_some());
        assert_eq!(s.pending_unverified_resumptions(), 0);
    }

    #[test]
    fn failed_unverified_handshake_restores_parked() {
        let s = store(10);
        let now = Instant::now();
        let a = s.put(now, addr(1), false, |_| 1).unwrap();
        let sess = session();
        s.put_session(a.key, &sess);

        let b = s.put(now, addr(1), true, |_| 2).unwrap();
        // A second one takes over the parked connection.
        let c = s.put(now, addr(1), true, |_| 3).unwrap();
        assert_eq!(c.replaced.len(), 1);
        assert_eq!(c.replaced[0].key, b.key);
        assert_eq!(s.predecessor(c.key).unwrap().0, a.key);

        s.remove(c.key);
        assert_eq!(s.find_by_address(addr(1)).unwrap().0, a.key);
        assert_eq!(s.address_session(addr(1)), Some(*sess.id()));
        assert!(s.find_session(sess.id()).is_some());
        assert_eq!(s.pending_unverified_resumptions(), 0);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn verified_handshake_replaces_parked_too() {
        let s = store(10);
        let now = Instant::now();
        let a = s.put(now, addr(1), false, |_| 1).unwrap();
        let sess = session();
        s.put_session(a.key, &sess);
        let b = s.put(now, addr(1), true, |_| 2).unwrap();

        let c = s.put(now, addr(1), false, |_| 3).unwrap();
        let mut gone: Vec<_> = c.replaced.iter().map(|r| r.key).collect();
        gone.sort();
        assert_eq!(gone, vec![a.key, b.key]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.address_session(addr(1)), Some(*sess.id()));
    }

    #[test]
    fn replacement_inherits_only_owned_session() {
        let s = store(10);
        let now = Instant::now();
        let sess = session();
        let a = s.put(now, addr(1), false, |_| 1).unwrap();
        s.put_session(a.key, &sess);
        let b = s.put(now, addr(2), false, |_| 2).unwrap();
        // The session is resumed on another address and now belongs there.
        s.put_session(b.key, &sess);

        let c = s.put(now, addr(1), false, |_| 3).unwrap();
        assert_eq!(c.replaced[0].key, a.key);
        assert_eq!(s.address_session(addr(1)), None);

        // Dropping the connection that replaced the old one leaves the session alone.
        s.remove(c.key);
        assert!(s.find_session(sess.id()).is_some());
        assert_eq!(s.address_session(addr(2)), Some(*sess.id()));
    }
}
