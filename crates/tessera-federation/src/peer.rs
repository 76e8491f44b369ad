//! Server peer records and the pool
//!
//! One record per remote hostname, tracking link and request counts,
//! queued and total byte counters, the peer-advertised version, and a
//! latched error message. The latch clears only on an explicit
//! `errclear`; while set, origin selection skips the peer.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tessera_core::ServerName;
use tracing::debug;

/// Per-hostname peer state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerPeer {
    /// Resolved address, when known.
    pub remote: Option<SocketAddr>,

    /// Open links to the peer.
    pub link_count: u32,

    /// Requests outstanding against the peer.
    pub tag_count: u32,

    /// Bytes queued for write.
    pub write_size: u64,

    /// Bytes queued for read.
    pub read_size: u64,

    /// Bytes written over the peer's lifetime.
    pub write_total: u64,

    /// Bytes read over the peer's lifetime.
    pub read_total: u64,

    /// Latched error; cleared only by `ServerPool::errclear`.
    pub err_msg: Option<String>,

    /// Peer-advertised server version string.
    pub server_version: Option<String>,
}

/// The process-wide set of known peers, keyed by hostname.
///
/// Reads vastly outnumber writes; state lives behind a synchronous
/// RwLock and no method suspends while holding it.
#[derive(Debug, Default)]
pub struct ServerPool {
    peers: RwLock<HashMap<ServerName, ServerPeer>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot one peer's record.
    pub fn peer(&self, host: &ServerName) -> Option<ServerPeer> {
        self.peers.read().get(host).cloned()
    }

    /// Number of known peers.
    pub fn count(&self) -> usize {
        self.peers.read().len()
    }

    /// All known peer names.
    pub fn names(&self) -> Vec<ServerName> {
        self.peers.read().keys().cloned().collect()
    }

    /// The latched error for a host, if any.
    pub fn errmsg(&self, host: &ServerName) -> Option<String> {
        self.peers
            .read()
            .get(host)
            .and_then(|peer| peer.err_msg.clone())
    }

    /// Latch an error against a host. An existing latch is preserved;
    /// the first error tells the story.
    pub fn errset(&self, host: &ServerName, message: impl Into<String>) {
        let mut peers = self.peers.write();
        let peer = peers.entry(host.clone()).or_default();
        if peer.err_msg.is_none() {
            let message = message.into();
            debug!(host = %host, error = %message, "latching peer error");
            peer.err_msg = Some(message);
        }
    }

    /// Clear the latched error for a host.
    pub fn errclear(&self, host: &ServerName) {
        if let Some(peer) = self.peers.write().get_mut(host) {
            if peer.err_msg.take().is_some() {
                debug!(host = %host, "cleared peer error");
            }
        }
    }

    /// Record a resolved address for a host.
    pub fn set_remote(&self, host: &ServerName, remote: SocketAddr) {
        self.peers.write().entry(host.clone()).or_default().remote = Some(remote);
    }

    /// Record the peer-advertised version string.
    pub fn set_version(&self, host: &ServerName, version: impl Into<String>) {
        self.peers
            .write()
            .entry(host.clone())
            .or_default()
            .server_version = Some(version.into());
    }

    /// Account for a request being issued to a host.
    pub fn begin_request(&self, host: &ServerName, write_size: u64) {
        let mut peers = self.peers.write();
        let peer = peers.entry(host.clone()).or_default();
        peer.tag_count += 1;
        peer.link_count = peer.link_count.max(1);
        peer.write_size += write_size;
    }

    /// Account for a request completing against a host.
    pub fn end_request(&self, host: &ServerName, write_size: u64, read_total: u64) {
        let mut peers = self.peers.write();
        let peer = peers.entry(host.clone()).or_default();
        peer.tag_count = peer.tag_count.saturating_sub(1);
        peer.write_size = peer.write_size.saturating_sub(write_size);
        peer.write_total += write_size;
        peer.read_total += read_total;
    }
}
