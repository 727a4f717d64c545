// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// System coordinator: the shared FNE core binding every configured
// system's UDP socket, peer session FSM, and ACL/affiliation tables
// behind one value, so the call router can resolve a rule's destination
// system and actually deliver traffic there instead of being confined to
// the system the traffic arrived on.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::acl::AclTables;
use crate::affiliation::AffiliationMap;
use crate::config::System as SystemConfig;
use crate::error::FneResult;
use crate::frame::{DmrFrame, Frame, P25Frame, P25_DUID_TSDU};
use crate::peer::{self, PeerConfig, PeerRegistry};
use crate::reporting::ReportingChannel;
use crate::router::{CallEvent, CallRouter, Outbound, SystemTargets};
use crate::rules::RuleSet;

/// One master-mode system's mutable state: the UDP socket peers connect to
/// plus the peer/ACL/affiliation tables gating traffic to and from it.
/// Held behind `Arc` and shared through `FneCore` so a *different*
/// system's router pass can resolve this system as a routing destination.
pub struct SystemState {
    pub socket: Arc<UdpSocket>,
    pub passphrase: String,
    pub peers: RwLock<PeerRegistry>,
    pub acl: RwLock<AclTables>,
    pub affiliation: RwLock<AffiliationMap>,
}

/// The whole FNE instance: every configured master-mode system plus the
/// shared rule table and call router a rule's `dst_net` is resolved
/// through. The reporting channel is threaded through separately rather
/// than owned here, since its snapshot source needs a handle back onto
/// this value and the two can't be built in either order otherwise.
pub struct FneCore {
    pub systems: HashMap<String, Arc<SystemState>>,
    pub router: Mutex<CallRouter>,
    pub rules: RwLock<RuleSet>,
}

impl FneCore {
    pub fn new(systems: HashMap<String, Arc<SystemState>>, rules: RuleSet) -> Arc<Self> {
        Arc::new(Self {
            systems,
            router: Mutex::new(CallRouter::new()),
            rules: RwLock::new(rules),
        })
    }

    /// Snapshots every system's connected peers and gating tables, keyed
    /// by system name, for the router to resolve a rule's `dst_net` against.
    async fn snapshot_targets(&self) -> HashMap<String, SystemTargets> {
        let mut map = HashMap::new();
        for (name, state) in &self.systems {
            let peers = state.peers.read().await;
            let acl = state.acl.read().await;
            let affiliation = state.affiliation.read().await;
            map.insert(
                name.clone(),
                SystemTargets {
                    peers: peers
                        .connected_peers()
                        .map(|p| (p.peer_id, p.endpoint))
                        .collect(),
                    acl: acl.clone(),
                    affiliation: affiliation.clone(),
                },
            );
        }
        map
    }

    async fn deliver(&self, outbound: Vec<Outbound>) {
        for ob in outbound {
            if let Some(state) = self.systems.get(&ob.system) {
                let _ = state.socket.send_to(&ob.frame.to_bytes(), ob.endpoint).await;
            }
        }
    }
}

async fn push_events(reporting: &Option<Arc<Mutex<ReportingChannel>>>, events: Vec<CallEvent>) {
    if let Some(reporting) = reporting {
        let channel = reporting.lock().await;
        for event in &events {
            channel.push_call_event(event);
        }
    }
}

/// Per-destination-system ignore lists folded out of every rule's
/// `ignored` field, keyed by destination system then destination TGID —
/// the gate at fan-out time is evaluated against the *destination*
/// system's ACL table, not the source's.
pub fn build_ignored_peers(rules: &RuleSet) -> HashMap<String, HashMap<u32, Vec<u32>>> {
    let mut map: HashMap<String, HashMap<u32, Vec<u32>>> = HashMap::new();
    for sys in rules.systems.values() {
        for rule in &sys.rules {
            if rule.def.ignored.is_empty() {
                continue;
            }
            map.entry(rule.def.dst_net.clone())
                .or_default()
                .entry(rule.def.dst_group)
                .or_default()
                .extend(rule.def.ignored.iter().copied());
        }
    }
    map
}

/// Loads a one-RID-per-row CSV file into `set`, mirroring the reference
/// implementation's RID alias file format.
pub fn load_rid_csv(path: &str, set: &mut HashSet<u32>) -> FneResult<()> {
    let mut reader = csv::Reader::from_path(path)?;
    for record in reader.records() {
        let record = record?;
        if let Some(field) = record.get(0) {
            if let Ok(rid) = field.trim().parse() {
                set.insert(rid);
            }
        }
    }
    Ok(())
}

/// Runs one master-mode system's event loop until the process receives a
/// shutdown signal, at which point every connected peer is sent a
/// graceful `MSTCL`.
pub async fn run_master(
    core: Arc<FneCore>,
    reporting: Option<Arc<Mutex<ReportingChannel>>>,
    name: String,
    ping_interval: Duration,
    max_missed: u32,
) -> FneResult<()> {
    let state = core
        .systems
        .get(&name)
        .expect("system registered in FneCore before its task is spawned")
        .clone();

    let mut recv_buf = vec![0u8; 65535];

    let mut heartbeat_sweep = interval(ping_interval);
    heartbeat_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stream_expiry = interval(Duration::from_millis(100));
    stream_expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut rule_timers = interval(Duration::from_secs(60));
    rule_timers.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                shutdown(&state).await;
                return Ok(());
            }
            result = state.socket.recv_from(&mut recv_buf) => {
                let (len, from) = match result {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                handle_datagram(&core, &state, &reporting, &name, &recv_buf[..len], from).await;
            }
            _ = heartbeat_sweep.tick() => {
                sweep_heartbeats(&state, ping_interval, max_missed).await;
            }
            _ = stream_expiry.tick() => {
                core.router.lock().await.expire_stale_streams(Instant::now());
            }
            _ = rule_timers.tick() => {
                core.rules.write().await.tick_timers(Instant::now());
            }
        }
    }
}

async fn handle_datagram(
    core: &Arc<FneCore>,
    state: &Arc<SystemState>,
    reporting: &Option<Arc<Mutex<ReportingChannel>>>,
    name: &str,
    datagram: &[u8],
    from: SocketAddr,
) {
    let frame = match Frame::parse(datagram) {
        Ok(f) => f,
        Err(_) => return,
    };

    match frame {
        Frame::RepeaterLogin { peer_id } => {
            let salt = state.peers.write().await.handle_login(peer_id, from);
            let _ = state.socket.send_to(&Frame::repeater_ack_salt(salt), from).await;
        }
        Frame::RepeaterAuth { peer_id, digest } => {
            let result = state
                .peers
                .write()
                .await
                .handle_challenge(peer_id, from, &digest, &state.passphrase);

            match result {
                Ok(()) => {
                    let _ = state
                        .socket
                        .send_to(&Frame::repeater_ack_peer(peer_id), from)
                        .await;
                }
                Err(e) => {
                    let _ = state.socket.send_to(&Frame::master_nak(peer_id), from).await;
                    log::warn!("peer {} rejected during challenge: {}", peer_id, e);
                }
            }
        }
        Frame::RepeaterConfig { peer_id, json } => {
            let config = parse_peer_config(&json);
            let result = state.peers.write().await.handle_config(peer_id, from, config);

            match result {
                Ok(()) => {
                    let _ = state
                        .socket
                        .send_to(&Frame::repeater_ack_peer(peer_id), from)
                        .await;
                    push_rid_tables_to(core, state, name, from).await;
                }
                Err(_) => {
                    let _ = state.socket.send_to(&Frame::master_nak(peer_id), from).await;
                }
            }
        }
        Frame::RepeaterPing { peer_id } => {
            if state.peers.write().await.handle_ping(peer_id, from).is_ok() {
                let _ = state.socket.send_to(&Frame::master_pong(peer_id), from).await;
            }
        }
        Frame::RepeaterClosing { peer_id } => {
            let _ = state.peers.write().await.handle_closing(peer_id, from);
        }
        Frame::DmrData(dmr) => {
            route_dmr(core, state, reporting, name, dmr).await;
        }
        Frame::P25Data(p25) => {
            route_p25(core, state, reporting, name, p25).await;
        }
        _ => {}
    }
}

async fn route_dmr(
    core: &Arc<FneCore>,
    state: &Arc<SystemState>,
    reporting: &Option<Arc<Mutex<ReportingChannel>>>,
    name: &str,
    dmr: DmrFrame,
) {
    let targets = core.snapshot_targets().await;
    let acl = state.acl.read().await.clone();

    let outcome = {
        let mut router = core.router.lock().await;
        let mut rules = core.rules.write().await;
        router.route_dmr(name, &dmr, &acl, &mut rules, &targets, Instant::now())
    };

    core.deliver(outcome.outbound).await;
    push_events(reporting, outcome.events).await;
}

/// TSBK administrative frames (group affiliation / deregistration) only
/// update the affiliation table and never fan out; every other P25 DUID
/// (voice/data bursts) goes through the same routing pipeline DMR does.
async fn route_p25(
    core: &Arc<FneCore>,
    state: &Arc<SystemState>,
    reporting: &Option<Arc<Mutex<ReportingChannel>>>,
    name: &str,
    p25: P25Frame,
) {
    if p25.duid() == Some(P25_DUID_TSDU) {
        let events = {
            let mut affiliation = state.affiliation.write().await;
            core.router
                .lock()
                .await
                .preprocess_p25(name, &p25, &mut affiliation)
        };
        push_events(reporting, events).await;
        return;
    }

    let targets = core.snapshot_targets().await;
    let acl = state.acl.read().await.clone();

    let outcome = {
        let mut router = core.router.lock().await;
        let mut rules = core.rules.write().await;
        router.route_p25(name, &p25, &acl, &mut rules, &targets, Instant::now())
    };

    core.deliver(outcome.outbound).await;
    push_events(reporting, outcome.events).await;
}

/// Pushes the whitelist/blacklist/active-TGID/deactive-TGID RID tables to
/// one peer: called immediately on its `CONNECTED` transition and again,
/// for every connected peer, on each periodic rule reload.
async fn push_rid_tables_to(
    core: &Arc<FneCore>,
    state: &Arc<SystemState>,
    name: &str,
    endpoint: SocketAddr,
) {
    let (whitelist, blacklist) = {
        let acl = state.acl.read().await;
        (
            acl.whitelist_rids.iter().copied().collect::<Vec<u32>>(),
            acl.blacklist_rids.iter().copied().collect::<Vec<u32>>(),
        )
    };

    let (active, deactive) = {
        let rules = core.rules.read().await;
        (
            rules.active_tgids(name).into_iter().collect::<Vec<u32>>(),
            rules.deactive_tgids(name).into_iter().collect::<Vec<u32>>(),
        )
    };

    let _ = state
        .socket
        .send_to(&Frame::id_table(b"MSTWRID", &whitelist), endpoint)
        .await;
    let _ = state
        .socket
        .send_to(&Frame::id_table(b"MSTBRID", &blacklist), endpoint)
        .await;
    let _ = state
        .socket
        .send_to(&Frame::id_table(b"MSTTID", &active), endpoint)
        .await;
    let _ = state
        .socket
        .send_to(&Frame::id_table(b"MSTDTID", &deactive), endpoint)
        .await;
}

/// Periodically re-reads the rule file and RID alias files, replaces the
/// shared `RuleSet` (preserving `routable`/timer state by rule name),
/// rebuilds every system's ACL table, and pushes the refreshed RID tables
/// to every connected peer.
pub async fn run_rule_reload(
    core: Arc<FneCore>,
    rules_path: String,
    whitelist_path: Option<String>,
    blacklist_path: Option<String>,
    reload_interval: Duration,
    rules_text_mirror: Arc<Mutex<String>>,
) {
    let mut ticker = interval(reload_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; startup already loaded once.

    loop {
        ticker.tick().await;

        let rules_text = match std::fs::read_to_string(&rules_path) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("rule reload: failed to read {}: {}", rules_path, e);
                continue;
            }
        };

        let new_rules = {
            let current = core.rules.read().await;
            match RuleSet::load(&rules_text, Some(&current), Instant::now()) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("rule reload: failed to parse {}: {}", rules_path, e);
                    continue;
                }
            }
        };

        let mut whitelist = HashSet::new();
        let mut blacklist = HashSet::new();
        if let Some(p) = &whitelist_path {
            if let Err(e) = load_rid_csv(p, &mut whitelist) {
                log::warn!("rule reload: failed to read whitelist {}: {}", p, e);
            }
        }
        if let Some(p) = &blacklist_path {
            if let Err(e) = load_rid_csv(p, &mut blacklist) {
                log::warn!("rule reload: failed to read blacklist {}: {}", p, e);
            }
        }

        let ignored = build_ignored_peers(&new_rules);

        {
            let mut guard = core.rules.write().await;
            *guard = new_rules.clone();
        }
        *rules_text_mirror.lock().await = rules_text;

        for (sys_name, state) in &core.systems {
            {
                let mut acl = state.acl.write().await;
                acl.whitelist_rids = whitelist.clone();
                acl.blacklist_rids = blacklist.clone();
                acl.active_tgids = new_rules.active_tgids(sys_name);
                acl.ignored_peers = ignored.get(sys_name).cloned().unwrap_or_default();
            }

            let endpoints: Vec<SocketAddr> = state
                .peers
                .read()
                .await
                .connected_peers()
                .map(|p| p.endpoint)
                .collect();

            for endpoint in endpoints {
                push_rid_tables_to(&core, state, sys_name, endpoint).await;
            }
        }

        log::info!("reloaded rules from {}", rules_path);
    }
}

async fn sweep_heartbeats(state: &Arc<SystemState>, ping_interval: Duration, max_missed: u32) {
    let expired = state.peers.write().await.sweep_expired(ping_interval, max_missed);

    for peer_id in expired {
        log::info!("peer {} missed heartbeat, evicted", peer_id);
    }
}

async fn shutdown(state: &Arc<SystemState>) {
    let ids: Vec<(u32, SocketAddr)> = state
        .peers
        .read()
        .await
        .iter()
        .map(|p| (p.peer_id, p.endpoint))
        .collect();

    for (peer_id, endpoint) in ids {
        let _ = state.socket.send_to(&Frame::master_closing(peer_id), endpoint).await;
    }
}

/// Parses the newline-separated `RPTC` config body into a `PeerConfig`.
/// Unrecognized or missing fields are left at their defaults rather than
/// rejecting the frame outright, mirroring the reference implementation's
/// tolerant field-by-field parse.
fn parse_peer_config(body: &[u8]) -> PeerConfig {
    let text = String::from_utf8_lossy(body);
    let mut config = PeerConfig::default();

    for line in text.lines() {
        let mut parts = line.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();

        match key {
            "identity" => config.identity = value.to_string(),
            "rx_frequency" => config.rx_frequency = value.to_string(),
            "tx_frequency" => config.tx_frequency = value.to_string(),
            "location" => config.location = value.to_string(),
            "software_id" => config.software_id = value.to_string(),
            "rcon_port" => config.rcon_port = value.parse().ok(),
            _ => {}
        }
    }

    config
}

/// One peer-mode FNE instance: mirrors the master-side FSM from the other
/// direction (RPTL/RPTK/RPTC sender, MSTNAK/MSTPONG/MSTCL receiver), used
/// when a system entry is configured in `peer` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerSystemState {
    LoginSent,
    ChallengeSent,
    ConfigSent,
    Connected,
}

pub struct PeerSystem {
    socket: UdpSocket,
    master_addr: SocketAddr,
    peer_id: u32,
    passphrase: String,
    ping_interval: Duration,
    state: PeerSystemState,
    config_body: Vec<u8>,
}

impl PeerSystem {
    pub async fn bind(cfg: &SystemConfig, ping_interval: Duration) -> FneResult<Self> {
        let (address, port) = cfg.bind_address();
        let socket = UdpSocket::bind((address, port)).await?;

        let (master_host, master_port, peer_id, config_body) = match cfg {
            SystemConfig::Peer {
                master_address,
                master_port,
                peer_id,
                identity,
                rx_frequency,
                tx_frequency,
                location,
                software_id,
                ..
            } => (
                master_address.clone(),
                *master_port,
                *peer_id,
                format!(
                    "identity={}\nrx_frequency={}\ntx_frequency={}\nlocation={}\nsoftware_id={}\n",
                    identity, rx_frequency, tx_frequency, location, software_id
                ),
            ),
            SystemConfig::Master { .. } => {
                return Err(crate::error::FneError::BadPeerId);
            }
        };

        let master_addr = tokio::net::lookup_host((master_host.as_str(), master_port))
            .await?
            .next()
            .ok_or(crate::error::FneError::BadPeerId)?;

        Ok(Self {
            socket,
            master_addr,
            peer_id,
            passphrase: cfg.passphrase().to_string(),
            ping_interval,
            state: PeerSystemState::LoginSent,
            config_body: config_body.into_bytes(),
        })
    }

    /// Runs the peer-side login handshake followed by the steady-state
    /// heartbeat loop.
    pub async fn up(&mut self) -> FneResult<()> {
        self.socket
            .send_to(&Frame::repeater_login(self.peer_id), self.master_addr)
            .await?;

        let mut recv_buf = vec![0u8; 65535];
        let mut ping_timer = interval(self.ping_interval);

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = self.socket
                        .send_to(&Frame::repeater_closing(self.peer_id), self.master_addr)
                        .await;
                    return Ok(());
                }
                result = self.socket.recv_from(&mut recv_buf) => {
                    let (len, _from) = match result {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    self.handle_reply(&recv_buf[..len]).await;
                }
                _ = ping_timer.tick() => {
                    if self.state == PeerSystemState::Connected {
                        let _ = self.socket
                            .send_to(&Frame::repeater_ping(self.peer_id), self.master_addr)
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_reply(&mut self, datagram: &[u8]) {
        let frame = match Frame::parse(datagram) {
            Ok(f) => f,
            Err(_) => return,
        };

        match frame {
            // The `RPTACK` opcode carries a different payload at each step
            // of the handshake; the FSM state recorded locally disambiguates
            // what `Frame::parse` generically decoded as a salt.
            Frame::RepeaterAckSalt { salt } if self.state == PeerSystemState::LoginSent => {
                let digest = peer::expected_digest(salt, &self.passphrase);
                let mut buf = Vec::with_capacity(4 + 4 + 32);
                buf.extend_from_slice(b"RPTK");
                buf.extend_from_slice(&self.peer_id.to_be_bytes());
                buf.extend_from_slice(&digest);
                let _ = self.socket.send_to(&buf, self.master_addr).await;
                self.state = PeerSystemState::ChallengeSent;
            }
            Frame::RepeaterAckSalt { .. } if self.state == PeerSystemState::ChallengeSent => {
                let mut buf = Vec::with_capacity(4 + 4 + self.config_body.len());
                buf.extend_from_slice(b"RPTC");
                buf.extend_from_slice(&self.peer_id.to_be_bytes());
                buf.extend_from_slice(&self.config_body);
                let _ = self.socket.send_to(&buf, self.master_addr).await;
                self.state = PeerSystemState::ConfigSent;
            }
            Frame::RepeaterAckSalt { .. } if self.state == PeerSystemState::ConfigSent => {
                self.state = PeerSystemState::Connected;
                log::info!("peer {} connected to master", self.peer_id);
            }
            Frame::MasterNak { .. } => {
                log::warn!("master rejected peer {}, retrying login", self.peer_id);
                self.state = PeerSystemState::LoginSent;
                let _ = self
                    .socket
                    .send_to(&Frame::repeater_login(self.peer_id), self.master_addr)
                    .await;
            }
            Frame::MasterClosing { .. } => {
                log::info!("master requested close");
            }
            _ => {}
        }
    }
}
