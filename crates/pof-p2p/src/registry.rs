use std::collections::HashMap;
use std::sync::Arc;

use pof_core::{Address, Role};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::P2pError;
use crate::peer::Peer;

/// Live peer connections keyed by remote address.
///
/// A registered peer is dropped from the map as soon as it closes, so
/// lookups never hand out a dead connection for long.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Fails with [`P2pError::ExistAddress`] while another live
    /// peer holds the same address.
    pub async fn register(self: &Arc<Self>, peer: Arc<Peer>) -> Result<(), P2pError> {
        let address = peer.address();
        {
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.get(&address) {
                if !existing.is_closed() {
                    return Err(P2pError::ExistAddress);
                }
            }
            peers.insert(address, Arc::clone(&peer));
        }
        info!(peer = %peer.name(), role = %peer.role(), "peer registered");

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            peer.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_peer(&peer).await;
            }
        });
        Ok(())
    }

    /// Remove the entry for `address`, if any
    pub async fn unregister(&self, address: &Address) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(address);
        if let Some(peer) = &removed {
            info!(peer = %peer.name(), "peer unregistered");
        }
        removed
    }

    async fn remove_peer(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.write().await;
        let same = peers
            .get(&peer.address())
            .map(|p| Arc::ptr_eq(p, peer))
            .unwrap_or(false);
        if same {
            peers.remove(&peer.address());
            debug!(peer = %peer.name(), "closed peer removed from registry");
        }
    }

    pub async fn get(&self, address: &Address) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .await
            .get(address)
            .filter(|p| !p.is_closed())
            .cloned()
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.get(address).await.is_some()
    }

    pub async fn observer(&self, address: &Address) -> Result<Arc<Peer>, P2pError> {
        self.get_with_role(address, Role::Observer)
            .await
            .ok_or(P2pError::NotExistObserverPeer)
    }

    pub async fn formulator(&self, address: &Address) -> Result<Arc<Peer>, P2pError> {
        self.get_with_role(address, Role::Formulator)
            .await
            .ok_or(P2pError::NotExistFormulatorPeer)
    }

    async fn get_with_role(&self, address: &Address, role: Role) -> Option<Arc<Peer>> {
        self.get(address).await.filter(|p| p.role() == role)
    }

    /// Live peers, optionally restricted to one role
    pub async fn snapshot(&self, role: Option<Role>) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| !p.is_closed())
            .filter(|p| role.map_or(true, |r| p.role() == r))
            .cloned()
            .collect()
    }

    /// Addresses currently reachable, optionally restricted to one role
    pub async fn reachable(&self, role: Option<Role>) -> Vec<Address> {
        self.snapshot(role)
            .await
            .iter()
            .map(|p| p.address())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.snapshot(None).await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Send the same encoded packet to every live peer of `role` (all roles
    /// when `None`). Writes run concurrently; returns once each has finished
    /// or hit its deadline.
    pub async fn broadcast(&self, role: Option<Role>, bytes: &[u8]) -> usize {
        let peers = self.snapshot(role).await;
        let count = peers.len();
        let bytes: Arc<[u8]> = Arc::from(bytes);

        let mut sends = JoinSet::new();
        for peer in peers {
            let bytes = Arc::clone(&bytes);
            sends.spawn(async move { peer.send(&bytes).await });
        }
        while sends.join_next().await.is_some() {}

        count
    }
}
