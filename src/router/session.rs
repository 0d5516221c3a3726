//! Per-shard session bookkeeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::transport::{Authenticator, Messenger, SessionHandle};
use crate::error::Result;
use crate::types::ShardId;

struct Session {
    handle: SessionHandle,
    addr: String,
    opened_at: Instant,
    last_activity: Instant,
    outstanding: usize,
}

/// Public view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub shard: ShardId,
    pub addr: String,
    pub conn_id: u64,
    pub outstanding: usize,
    pub age: Duration,
    pub idle: Duration,
}

/// Sessions keyed by shard. At most one per shard.
#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: HashMap<ShardId, Session>,
}

impl SessionTable {
    /// Existing session for `shard`, or a freshly opened one.
    ///
    /// A session whose address no longer matches is replaced.
    pub fn get_or_open(
        &mut self,
        shard: ShardId,
        addr: &str,
        messenger: &dyn Messenger,
        auth: &dyn Authenticator,
        now: Instant,
    ) -> Result<(SessionHandle, bool)> {
        if let Some(existing) = self.sessions.get(&shard) {
            if existing.addr == addr {
                return Ok((existing.handle.clone(), false));
            }
            debug!(%shard, old = %existing.addr, new = %addr, "shard address changed, reopening session");
            if let Some(stale) = self.sessions.remove(&shard) {
                messenger.close_session(&stale.handle);
            }
        }

        let credential = auth.credential_for(shard, addr);
        let handle = messenger.open_session(shard, addr, &credential)?;
        info!(%shard, addr, conn_id = handle.conn_id, "opened session");
        self.sessions.insert(
            shard,
            Session {
                handle: handle.clone(),
                addr: addr.to_string(),
                opened_at: now,
                last_activity: now,
                outstanding: 0,
            },
        );
        Ok((handle, true))
    }

    pub fn attach(&mut self, shard: ShardId, now: Instant) {
        if let Some(s) = self.sessions.get_mut(&shard) {
            s.outstanding += 1;
            s.last_activity = now;
        }
    }

    pub fn release(&mut self, shard: ShardId) {
        if let Some(s) = self.sessions.get_mut(&shard) {
            s.outstanding = s.outstanding.saturating_sub(1);
        }
    }

    pub fn touch(&mut self, shard: ShardId, now: Instant) {
        if let Some(s) = self.sessions.get_mut(&shard) {
            s.last_activity = now;
        }
    }

    pub fn close(&mut self, shard: ShardId, messenger: &dyn Messenger) -> bool {
        match self.sessions.remove(&shard) {
            Some(s) => {
                messenger.close_session(&s.handle);
                true
            }
            None => false,
        }
    }

    pub fn shards(&self) -> Vec<ShardId> {
        self.sessions.keys().copied().collect()
    }

    /// Sessions with nothing outstanding and no traffic for `timeout`.
    pub fn idle(&self, now: Instant, timeout: Duration) -> Vec<ShardId> {
        self.sessions
            .iter()
            .filter(|(_, s)| {
                s.outstanding == 0 && now.saturating_duration_since(s.last_activity) >= timeout
            })
            .map(|(shard, _)| *shard)
            .collect()
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.sessions.contains_key(&shard)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn info(&self, shard: ShardId, now: Instant) -> Option<SessionInfo> {
        self.sessions.get(&shard).map(|s| SessionInfo {
            shard,
            addr: s.addr.clone(),
            conn_id: s.handle.conn_id,
            outstanding: s.outstanding,
            age: now.saturating_duration_since(s.opened_at),
            idle: now.saturating_duration_since(s.last_activity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::op::OsdRequest;
    use crate::router::transport::{Credential, NoAuth};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingMessenger {
        opened: Mutex<Vec<String>>,
        closed: Mutex<Vec<u64>>,
    }

    impl Messenger for CountingMessenger {
        fn open_session(&self, shard: ShardId, addr: &str, _: &Credential) -> Result<SessionHandle> {
            let mut opened = self.opened.lock();
            opened.push(addr.to_string());
            Ok(SessionHandle {
                shard,
                conn_id: opened.len() as u64,
            })
        }

        fn send(&self, _: &SessionHandle, _: OsdRequest) -> Result<()> {
            Ok(())
        }

        fn close_session(&self, session: &SessionHandle) {
            self.closed.lock().push(session.conn_id);
        }
    }

    #[test]
    fn test_session_reused_until_address_changes() {
        let m = CountingMessenger::default();
        let mut table = SessionTable::default();
        let now = Instant::now();

        let (a, fresh) = table.get_or_open(ShardId(1), "mem://1", &m, &NoAuth, now).unwrap();
        assert!(fresh);
        let (b, fresh) = table.get_or_open(ShardId(1), "mem://1", &m, &NoAuth, now).unwrap();
        assert!(!fresh);
        assert_eq!(a, b);

        let (c, fresh) = table.get_or_open(ShardId(1), "mem://1b", &m, &NoAuth, now).unwrap();
        assert!(fresh);
        assert_ne!(a, c);
        assert_eq!(*m.closed.lock(), vec![a.conn_id]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_idle_requires_no_outstanding() {
        let m = CountingMessenger::default();
        let mut table = SessionTable::default();
        let start = Instant::now();
        table.get_or_open(ShardId(1), "mem://1", &m, &NoAuth, start).unwrap();
        table.attach(ShardId(1), start);

        let later = start + Duration::from_secs(10);
        assert!(table.idle(later, Duration::from_secs(5)).is_empty());

        table.release(ShardId(1));
        assert_eq!(table.idle(later, Duration::from_secs(5)), vec![ShardId(1)]);
    }
}
