use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use pof_consensus::ConsensusConfig;
use pof_core::{Identity, KeyPair, Role, SecretKey};
use pof_p2p::PeerConfig;
use serde::{Deserialize, Serialize};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name used in peer logs
    pub name: String,

    /// Peer listen address
    pub listen_addr: SocketAddr,

    /// Node secret key (hex)
    pub node_key: String,

    /// Role this node announces in the handshake
    pub role: Role,

    /// Formulator set, in round-robin order
    pub formulators: Vec<PeerEndpointConfig>,

    /// Observer set
    pub observers: Vec<PeerEndpointConfig>,

    pub consensus: ConsensusParams,

    pub network: NetworkParams,
}

/// One configured member of the consensus set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEndpointConfig {
    pub name: String,
    pub pubkey: String,
    /// host:port the member listens on
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub min_candidates: usize,
    pub max_candidates: usize,
    pub max_blocks_per_formulator: u32,
    pub min_signatures: usize,
    pub formulators_vote: bool,
    pub round_timeout_ms: u64,
    /// Furthest ahead of its current round a peer may move this node
    pub max_round_advance: u64,
    /// Pause before the expected proposer publishes its proposal
    pub propose_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkParams {
    pub write_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_limit: u64,
    pub max_payload_len: usize,
    pub handshake_timeout_ms: u64,
    /// Pause between attempts to dial missing peers
    pub redial_interval_ms: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        let defaults = ConsensusConfig::default();
        ConsensusParams {
            min_candidates: defaults.min_candidates,
            max_candidates: defaults.max_candidates,
            max_blocks_per_formulator: defaults.max_blocks_per_formulator,
            min_signatures: defaults.min_signatures,
            formulators_vote: defaults.formulators_vote,
            round_timeout_ms: defaults.round_timeout_ms,
            max_round_advance: defaults.max_round_advance,
            propose_delay_ms: 500,
        }
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        let defaults = PeerConfig::default();
        NetworkParams {
            write_timeout_ms: defaults.write_timeout.as_millis() as u64,
            keepalive_interval_ms: defaults.keepalive_interval.as_millis() as u64,
            keepalive_limit: defaults.keepalive_limit,
            max_payload_len: defaults.max_payload_len,
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            redial_interval_ms: 5_000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "node-0".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            node_key: String::new(),
            role: Role::Formulator,
            formulators: Vec::new(),
            observers: Vec::new(),
            consensus: ConsensusParams::default(),
            network: NetworkParams::default(),
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn keypair(&self) -> Result<KeyPair> {
        let secret = SecretKey::from_hex(&self.node_key)?;
        Ok(KeyPair::from_secret(secret))
    }

    pub fn formulator_identities(&self) -> Result<Vec<Identity>> {
        parse_identities(&self.formulators)
    }

    pub fn observer_identities(&self) -> Result<Vec<Identity>> {
        parse_identities(&self.observers)
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        let c = &self.consensus;
        ConsensusConfig {
            min_candidates: c.min_candidates,
            max_candidates: c.max_candidates,
            max_blocks_per_formulator: c.max_blocks_per_formulator,
            min_signatures: c.min_signatures,
            formulators_vote: c.formulators_vote,
            round_timeout_ms: c.round_timeout_ms,
            max_round_advance: c.max_round_advance,
        }
    }

    pub fn propose_delay(&self) -> Duration {
        Duration::from_millis(self.consensus.propose_delay_ms)
    }

    pub fn redial_interval(&self) -> Duration {
        Duration::from_millis(self.network.redial_interval_ms)
    }

    pub fn peer_config(&self) -> PeerConfig {
        let n = &self.network;
        PeerConfig {
            write_timeout: Duration::from_millis(n.write_timeout_ms),
            keepalive_interval: Duration::from_millis(n.keepalive_interval_ms),
            keepalive_limit: n.keepalive_limit,
            max_payload_len: n.max_payload_len,
            handshake_timeout: Duration::from_millis(n.handshake_timeout_ms),
        }
    }

    /// Cross-check the key, the role and the two member sets
    pub fn validate(&self) -> Result<()> {
        let own = Identity::new(self.keypair()?.public);
        let formulators = self.formulator_identities()?;
        let observers = self.observer_identities()?;

        let mut seen = HashSet::new();
        for identity in formulators.iter().chain(observers.iter()) {
            if !seen.insert(identity.address) {
                bail!("address {} listed more than once", identity.address);
            }
        }

        let members = match self.role {
            Role::Formulator => &formulators,
            Role::Observer => &observers,
        };
        if !members.contains(&own) {
            bail!(
                "node key {} is not in the configured {} set",
                own.address,
                self.role
            );
        }
        Ok(())
    }
}

fn parse_identities(entries: &[PeerEndpointConfig]) -> Result<Vec<Identity>> {
    entries
        .iter()
        .map(|entry| Identity::from_hex(&entry.pubkey).map_err(|e| anyhow::anyhow!(e)))
        .collect()
}

/// Generate a single-formulator configuration that commits on its own
pub fn generate_sample_config() -> NodeConfig {
    let keypair = KeyPair::generate();
    let listen_addr = SocketAddr::from(([127, 0, 0, 1], 7000));

    NodeConfig {
        name: "formulator-0".to_string(),
        listen_addr,
        node_key: keypair.secret.to_hex(),
        role: Role::Formulator,
        formulators: vec![PeerEndpointConfig {
            name: "formulator-0".to_string(),
            pubkey: keypair.public.to_hex(),
            address: listen_addr.to_string(),
        }],
        observers: Vec::new(),
        consensus: ConsensusParams {
            min_signatures: 1,
            ..Default::default()
        },
        network: NetworkParams::default(),
    }
}

/// Generate configurations for a local cluster, one per member, all
/// sharing the same member sets
pub fn generate_cluster_configs(
    formulators: usize,
    observers: usize,
    base_port: u16,
) -> Vec<NodeConfig> {
    let mut members = Vec::new();
    for i in 0..formulators {
        members.push((format!("formulator-{}", i), Role::Formulator));
    }
    for i in 0..observers {
        members.push((format!("observer-{}", i), Role::Observer));
    }

    let members: Vec<_> = members
        .into_iter()
        .enumerate()
        .map(|(i, (name, role))| {
            let port = base_port.saturating_add(i as u16);
            let listen_addr = SocketAddr::from(([127, 0, 0, 1], port));
            (name, role, KeyPair::generate(), listen_addr)
        })
        .collect();

    let endpoints = |wanted: Role| -> Vec<PeerEndpointConfig> {
        members
            .iter()
            .filter(|(_, role, _, _)| *role == wanted)
            .map(|(name, _, keypair, addr)| PeerEndpointConfig {
                name: name.clone(),
                pubkey: keypair.public.to_hex(),
                address: addr.to_string(),
            })
            .collect()
    };
    let formulator_endpoints = endpoints(Role::Formulator);
    let observer_endpoints = endpoints(Role::Observer);

    // Formulators vote alongside observers by default
    let voters = observers + formulators;
    let consensus = ConsensusParams {
        min_signatures: voters / 2 + 1,
        ..Default::default()
    };

    members
        .iter()
        .map(|(name, role, keypair, addr)| NodeConfig {
            name: name.clone(),
            listen_addr: *addr,
            node_key: keypair.secret.to_hex(),
            role: *role,
            formulators: formulator_endpoints.clone(),
            observers: observer_endpoints.clone(),
            consensus: consensus.clone(),
            network: NetworkParams::default(),
        })
        .collect()
}

/// Where a cluster member's config file is written
pub fn cluster_config_path(dir: &Path, config: &NodeConfig) -> PathBuf {
    dir.join(format!("{}.json", config.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.role, Role::Formulator);
        assert_eq!(config.consensus.min_signatures, 2);
        assert_eq!(config.peer_config().keepalive_limit, 3);
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = generate_sample_config();
        config.validate().unwrap();
        assert_eq!(config.formulator_identities().unwrap().len(), 1);
        assert_eq!(config.consensus_config().min_signatures, 1);
        config.consensus_config().validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let config = generate_sample_config();
        let path = std::env::temp_dir().join(format!(
            "pof-config-{}.json",
            std::process::id()
        ));
        config.save(&path).unwrap();
        let loaded = NodeConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.node_key, config.node_key);
        assert_eq!(loaded.listen_addr, config.listen_addr);
        assert_eq!(loaded.role, config.role);
    }

    #[test]
    fn test_key_outside_member_set_rejected() {
        let mut config = generate_sample_config();
        config.node_key = KeyPair::generate().secret.to_hex();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_must_match_member_set() {
        let mut config = generate_sample_config();
        config.role = Role::Observer;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut config = generate_sample_config();
        let entry = config.formulators[0].clone();
        config.observers.push(entry);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cluster_configs() {
        let configs = generate_cluster_configs(3, 2, 9100);
        assert_eq!(configs.len(), 5);
        for config in &configs {
            config.validate().unwrap();
            assert_eq!(config.formulators.len(), 3);
            assert_eq!(config.observers.len(), 2);
            assert_eq!(config.consensus.min_signatures, 3);
        }
        assert_eq!(configs[4].role, Role::Observer);
        assert_eq!(configs[4].listen_addr.port(), 9104);
        assert_eq!(
            cluster_config_path(Path::new("/tmp/c"), &configs[0]),
            PathBuf::from("/tmp/c/formulator-0.json")
        );
    }
}
