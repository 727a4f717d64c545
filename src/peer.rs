// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// Peer Registry and per-peer session state machine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{FneError, FneResult};

/// Per-peer session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFsmState {
    LoginReceived,
    ChallengeSent,
    WaitingConfig,
    Connected,
    Closed,
}

/// Config snapshot pushed by the peer in the `RPTC` step.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub identity: String,
    pub rx_frequency: String,
    pub tx_frequency: String,
    pub location: String,
    pub software_id: String,
    pub rcon_port: Option<u16>,
}

/// A registered repeater's session record.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: u32,
    pub endpoint: SocketAddr,
    pub state: PeerFsmState,
    pub salt: u32,
    pub config: Option<PeerConfig>,
    pub last_ping: Instant,
    pub pings_received: u32,
    pub connected_since: Option<Instant>,
}

impl PeerSession {
    fn new(peer_id: u32, endpoint: SocketAddr, salt: u32) -> Self {
        Self {
            peer_id,
            endpoint,
            state: PeerFsmState::LoginReceived,
            salt,
            config: None,
            last_ping: Instant::now(),
            pings_received: 0,
            connected_since: None,
        }
    }

    /// `true` if the given endpoint matches the one frozen at login.
    pub fn endpoint_matches(&self, from: SocketAddr) -> bool {
        self.endpoint == from
    }

    pub fn is_expired(&self, ping_interval: Duration, max_missed: u32) -> bool {
        self.last_ping.elapsed() > ping_interval * max_missed
    }
}

/// Computes the expected challenge digest: `sha256(salt ‖ passphrase)`.
pub fn expected_digest(salt: u32, passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&salt.to_be_bytes());
    hasher.update(passphrase.as_bytes());
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Verifies a peer-submitted digest against the expected challenge value.
pub fn verify_digest(salt: u32, passphrase: &str, digest: &[u8; 32]) -> bool {
    expected_digest(salt, passphrase) == *digest
}

/// Map of peer-id -> session record, owned by exactly one master system.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<u32, PeerSession>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn get(&self, peer_id: u32) -> Option<&PeerSession> {
        self.peers.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: u32) -> Option<&mut PeerSession> {
        self.peers.get_mut(&peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.peers.values_mut()
    }

    pub fn remove(&mut self, peer_id: u32) -> Option<PeerSession> {
        self.peers.remove(&peer_id)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerSession> {
        self.peers
            .values()
            .filter(|p| p.state == PeerFsmState::Connected)
    }

    /// `RPTL` handler: registers a new session or restarts an existing one,
    /// and returns the freshly generated salt to send back in `RPTACK`.
    pub fn handle_login(&mut self, peer_id: u32, endpoint: SocketAddr) -> u32 {
        let salt = rand::thread_rng().next_u32();

        let session = PeerSession::new(peer_id, endpoint, salt);
        self.peers.insert(peer_id, session);

        if let Some(p) = self.peers.get_mut(&peer_id) {
            p.state = PeerFsmState::ChallengeSent;
        }

        salt
    }

    /// `RPTK` handler: verifies the challenge digest and advances the FSM.
    pub fn handle_challenge(
        &mut self,
        peer_id: u32,
        endpoint: SocketAddr,
        digest: &[u8; 32],
        passphrase: &str,
    ) -> FneResult<()> {
        let session = self
            .peers
            .get_mut(&peer_id)
            .ok_or(FneError::UnknownPeer(peer_id))?;

        if !session.endpoint_matches(endpoint) {
            return Err(FneError::EndpointMismatch(peer_id));
        }

        if session.state != PeerFsmState::ChallengeSent {
            return Err(FneError::IllegalStateTransition);
        }

        if !verify_digest(session.salt, passphrase, digest) {
            self.peers.remove(&peer_id);
            return Err(FneError::ChallengeMismatch(peer_id));
        }

        let session = self.peers.get_mut(&peer_id).unwrap();
        session.state = PeerFsmState::WaitingConfig;

        Ok(())
    }

    /// `RPTC` handler: parses and stores the peer's config snapshot.
    pub fn handle_config(
        &mut self,
        peer_id: u32,
        endpoint: SocketAddr,
        config: PeerConfig,
    ) -> FneResult<()> {
        let session = self
            .peers
            .get_mut(&peer_id)
            .ok_or(FneError::UnknownPeer(peer_id))?;

        if !session.endpoint_matches(endpoint) {
            return Err(FneError::EndpointMismatch(peer_id));
        }

        if session.state != PeerFsmState::WaitingConfig {
            return Err(FneError::IllegalStateTransition);
        }

        session.config = Some(config);
        session.state = PeerFsmState::Connected;
        session.connected_since = Some(Instant::now());
        session.last_ping = Instant::now();

        Ok(())
    }

    /// `RPTPING` handler: refreshes liveness for a connected peer.
    pub fn handle_ping(&mut self, peer_id: u32, endpoint: SocketAddr) -> FneResult<()> {
        let session = self
            .peers
            .get_mut(&peer_id)
            .ok_or(FneError::UnknownPeer(peer_id))?;

        if !session.endpoint_matches(endpoint) {
            return Err(FneError::EndpointMismatch(peer_id));
        }

        if session.state != PeerFsmState::Connected {
            return Err(FneError::IllegalStateTransition);
        }

        session.last_ping = Instant::now();
        session.pings_received += 1;

        Ok(())
    }

    /// `RPTCL` handler: evicts a peer on graceful close.
    pub fn handle_closing(&mut self, peer_id: u32, endpoint: SocketAddr) -> FneResult<()> {
        let session = self
            .peers
            .get(&peer_id)
            .ok_or(FneError::UnknownPeer(peer_id))?;

        if !session.endpoint_matches(endpoint) {
            return Err(FneError::EndpointMismatch(peer_id));
        }

        self.peers.remove(&peer_id);
        Ok(())
    }

    /// Sweeps the registry for peers whose silence has exceeded
    /// `ping_interval * max_missed`, evicting each one.
    pub fn sweep_expired(&mut self, ping_interval: Duration, max_missed: u32) -> Vec<u32> {
        let expired: Vec<u32> = self
            .peers
            .values()
            .filter(|p| {
                p.state == PeerFsmState::Connected && p.is_expired(ping_interval, max_missed)
            })
            .map(|p| p.peer_id)
            .collect();

        for id in &expired {
            self.peers.remove(id);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn challenge_roundtrip() {
        let salt = 0xdead_beef;
        let digest = expected_digest(salt, "secret");

        assert!(verify_digest(salt, "secret", &digest));
        assert!(!verify_digest(salt, "wrong", &digest));

        let mut tampered = digest;
        tampered[0] ^= 0xff;
        assert!(!verify_digest(salt, "secret", &tampered));
    }

    #[test]
    fn full_handshake_reaches_connected() {
        let mut registry = PeerRegistry::new();
        let ep = addr(62031);

        let salt = registry.handle_login(123456, ep);

        let digest = expected_digest(salt, "secret");
        registry
            .handle_challenge(123456, ep, &digest, "secret")
            .unwrap();

        registry
            .handle_config(123456, ep, PeerConfig::default())
            .unwrap();

        let session = registry.get(123456).unwrap();
        assert_eq!(session.state, PeerFsmState::Connected);
    }

    #[test]
    fn endpoint_mismatch_rejected() {
        let mut registry = PeerRegistry::new();
        let ep = addr(62031);
        let other = addr(62032);

        let salt = registry.handle_login(123456, ep);
        let digest = expected_digest(salt, "secret");

        let err = registry
            .handle_challenge(123456, other, &digest, "secret")
            .unwrap_err();

        assert!(matches!(err, FneError::EndpointMismatch(123456)));
    }

    #[test]
    fn peer_isolation() {
        let mut registry = PeerRegistry::new();
        registry.handle_login(1, addr(1));
        registry.handle_login(2, addr(2));

        registry.get_mut(1).unwrap().pings_received = 5;

        assert_eq!(registry.get(2).unwrap().pings_received, 0);
    }

    #[test]
    fn expiry_sweep() {
        let mut registry = PeerRegistry::new();
        let ep = addr(62031);

        let salt = registry.handle_login(300, ep);
        let digest = expected_digest(salt, "secret");
        registry.handle_challenge(300, ep, &digest, "secret").unwrap();
        registry
            .handle_config(300, ep, PeerConfig::default())
            .unwrap();

        registry.get_mut(300).unwrap().last_ping =
            Instant::now() - Duration::from_secs(100);

        let expired = registry.sweep_expired(Duration::from_secs(5), 3);
        assert_eq!(expired, vec![300]);
        assert!(registry.get(300).is_none());
    }
}
