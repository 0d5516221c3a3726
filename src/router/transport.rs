//! Messaging and authentication seams.
//!
//! The router never talks to sockets. It asks a [`Messenger`] to open
//! sessions and send requests; replies and session failures come back as
//! [`TransportEvent`]s on a channel the router's event pump drains.

use bytes::Bytes;

use super::op::{OsdReply, OsdRequest};
use crate::error::Result;
use crate::types::ShardId;

/// Messenger-level session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub shard: ShardId,
    pub conn_id: u64,
}

/// Asynchronous notifications from the messaging layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Reply(OsdReply),
    SessionBroken(ShardId),
}

/// Message transport used by the router.
///
/// Calls are made with the router's lock held and must not block on I/O;
/// completion is reported through [`TransportEvent`]s.
pub trait Messenger: Send + Sync {
    fn open_session(
        &self,
        shard: ShardId,
        addr: &str,
        credential: &Credential,
    ) -> Result<SessionHandle>;

    fn send(&self, session: &SessionHandle, request: OsdRequest) -> Result<()>;

    fn close_session(&self, session: &SessionHandle);
}

/// Opaque authentication material presented when opening a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential(Bytes);

impl Credential {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Supplies credentials for new sessions.
pub trait Authenticator: Send + Sync {
    fn credential_for(&self, shard: ShardId, addr: &str) -> Credential;
}

/// Anonymous sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn credential_for(&self, _shard: ShardId, _addr: &str) -> Credential {
        Credential::default()
    }
}

/// Same credential for every shard.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    credential: Credential,
}

impl StaticAuth {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

impl Authenticator for StaticAuth {
    fn credential_for(&self, _shard: ShardId, _addr: &str) -> Credential {
        self.credential.clone()
    }
}
