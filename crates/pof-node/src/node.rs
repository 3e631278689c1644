use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use pof_consensus::{ConsensusError, LedgerApplier, RoundStateMachine};
use pof_core::{Address, ConsensusMessage, Identity, KeyPair, Role};
use pof_p2p::{handshake, Peer, PeerConfig, PeerRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::{NodeConfig, PeerEndpointConfig};
use crate::driver::{ConsensusDriver, DriverEvent};
use crate::ledger::AccountLedger;
use crate::wire;

const EVENT_CAPACITY: usize = 1024;
const OUTBOX_CAPACITY: usize = 256;

/// A configured member of the consensus set
#[derive(Debug, Clone)]
struct Member {
    identity: Identity,
    role: Role,
    name: String,
    endpoint: String,
}

/// A formulator or observer process
pub struct Node {
    config: NodeConfig,
    keypair: KeyPair,
    identity: Identity,
    members: HashMap<Address, Member>,
    registry: Arc<PeerRegistry>,
    peer_config: PeerConfig,
}

impl Node {
    /// Create a new node from configuration
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let keypair = config.keypair()?;
        let identity = Identity::new(keypair.public);

        let mut members = HashMap::new();
        for (entries, role) in [
            (&config.formulators, Role::Formulator),
            (&config.observers, Role::Observer),
        ] {
            for entry in entries {
                let member = member_from(entry, role)?;
                members.insert(member.identity.address, member);
            }
        }

        let peer_config = config.peer_config();
        Ok(Node {
            config,
            keypair,
            identity,
            members,
            registry: Arc::new(PeerRegistry::new()),
            peer_config,
        })
    }

    /// Run the node until interrupted
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting {} {} ({})",
            self.config.role, self.config.name, self.identity.address
        );

        let formulators = self.config.formulator_identities()?;
        let observers = self.config.observer_identities()?;
        let named: Vec<_> = formulators
            .iter()
            .zip(self.config.formulators.iter())
            .map(|(identity, entry)| (*identity, entry.name.clone()))
            .collect();
        let ledger = Arc::new(AccountLedger::for_formulators(&named));
        let machine = RoundStateMachine::new(
            self.config.consensus_config(),
            formulators,
            observers,
            Arc::clone(&ledger) as Arc<dyn LedgerApplier>,
        )?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let driver = ConsensusDriver::new(
            machine,
            self.keypair.clone(),
            Arc::clone(&self.registry),
            events_rx,
            outbox_tx,
            self.config.propose_delay(),
        );

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Listening for peers on {}", self.config.listen_addr);

        let node = Arc::new(self);
        tokio::spawn(Arc::clone(&node).accept_loop(listener, events_tx.clone()));
        tokio::spawn(Arc::clone(&node).dial_loop(events_tx));
        tokio::spawn(gossip(Arc::clone(&node.registry), outbox_rx));

        tokio::select! {
            _ = driver.run() => {}
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        }

        let (height, head) = ledger.head();
        info!("Stopped at height {} ({})", height, head.short());
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, events: mpsc::Sender<DriverEvent>) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("Inbound connection from {}", remote);
                    let node = Arc::clone(&self);
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.establish(stream, events).await {
                            warn!("Inbound connection from {} rejected: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Keep a connection open to every member whose address sorts above ours;
    /// the others dial us.
    async fn dial_loop(self: Arc<Self>, events: mpsc::Sender<DriverEvent>) {
        let mut ticker = tokio::time::interval(self.config.redial_interval());
        loop {
            ticker.tick().await;
            for member in self.members.values() {
                if member.identity.address <= self.identity.address
                    || self.registry.contains(&member.identity.address).await
                {
                    continue;
                }
                match timeout(self.peer_config.handshake_timeout, TcpStream::connect(&member.endpoint)).await {
                    Ok(Ok(stream)) => {
                        if let Err(e) = self.establish(stream, events.clone()).await {
                            warn!("Connection to {} at {} failed: {}", member.name, member.endpoint, e);
                        }
                    }
                    Ok(Err(e)) => debug!("Dial {} at {} failed: {}", member.name, member.endpoint, e),
                    Err(_) => debug!("Dial {} at {} timed out", member.name, member.endpoint),
                }
            }
        }
    }

    /// Authenticate a fresh connection, register it and start forwarding
    /// its messages to the driver
    async fn establish(&self, mut stream: TcpStream, events: mpsc::Sender<DriverEvent>) -> Result<Arc<Peer>> {
        let info = timeout(
            self.peer_config.handshake_timeout,
            handshake(&mut stream, &self.keypair, self.config.role),
        )
        .await
        .map_err(|_| anyhow!("handshake timed out"))??;

        let address = info.identity.address;
        if address == self.identity.address {
            bail!("connected to self");
        }
        let member = self
            .members
            .get(&address)
            .ok_or_else(|| anyhow!("{} is not a configured member", address))?;
        if member.identity != info.identity || member.role != info.role {
            bail!(
                "{} announced itself as {} but is configured as {}",
                member.name,
                info.role,
                member.role
            );
        }

        let info = info.with_name(member.name.clone());
        let peer = Peer::from_tcp(stream, info, self.peer_config.clone());
        if let Err(e) = self.registry.register(Arc::clone(&peer)).await {
            peer.close();
            return Err(e.into());
        }
        tokio::spawn(receive_loop(Arc::clone(&peer), events));
        Ok(peer)
    }
}

fn member_from(entry: &PeerEndpointConfig, role: Role) -> Result<Member> {
    let identity = Identity::from_hex(&entry.pubkey)?;
    let name = if entry.name.is_empty() {
        identity.address.to_hex()
    } else {
        entry.name.clone()
    };
    Ok(Member {
        identity,
        role,
        name,
        endpoint: entry.address.clone(),
    })
}

/// Forward decoded messages from one peer until it closes
async fn receive_loop(peer: Arc<Peer>, events: mpsc::Sender<DriverEvent>) {
    let from = peer.address();
    loop {
        let frame = match peer.receive().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %peer.name(), "Receive loop ended: {}", e);
                break;
            }
        };
        match wire::decode_message(&frame) {
            Ok(message) => {
                if events
                    .send(DriverEvent::Message { from, message })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => warn!(peer = %peer.name(), "{}: {}", ConsensusError::InvalidRequest, e),
        }
    }
}

/// Broadcast driver output to every live peer, one message at a time.
///
/// A stalled peer holds a message back for at most its write timeout; the
/// driver never waits on this loop.
async fn gossip(registry: Arc<PeerRegistry>, mut outbox: mpsc::Receiver<ConsensusMessage>) {
    while let Some(message) = outbox.recv().await {
        match wire::encode_message(&message) {
            Ok(bytes) => {
                let sent = registry.broadcast(None, &bytes).await;
                trace!("Round {} message sent to {} peers", message.round(), sent);
            }
            Err(e) => error!("Failed to encode message: {}", e),
        }
    }
}
