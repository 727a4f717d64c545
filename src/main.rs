// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};

mod acl;
mod affiliation;
mod config;
mod error;
mod frame;
mod lc;
mod peer;
mod reporting;
mod router;
mod rules;
mod system;

use acl::AclTables;
use affiliation::AffiliationMap;
use config::{Config, System as SystemConfig};
use peer::PeerRegistry;
use reporting::{ReportingChannel, SnapshotSource};
use system::{FneCore, PeerSystem, SystemState};

/// Reads `-c <path>` (required) and `-l <level>` (optional) from the process
/// arguments, mirroring the reference implementation's CLI. A dedicated
/// argument-parsing crate isn't warranted for two flags, so this scans
/// `std::env::args()` directly.
struct Cli {
    config_path: String,
    log_level: Option<String>,
}

fn parse_cli() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut log_level = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" => {
                config_path = args.get(i + 1).cloned();
                i += 2;
            }
            "-l" => {
                log_level = args.get(i + 1).cloned();
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Cli {
        config_path: config_path.unwrap_or_else(|| "config.toml".to_string()),
        log_level,
    }
}

/// Snapshot source backed by the live `FneCore`: config/rules text mirrors
/// plus a fresh read of every system's affiliation and whitelist tables on
/// each request, rather than the fixed-at-startup snapshot the channel used
/// before systems shared state.
struct CoreSnapshotSource {
    config_text: String,
    rules_text: Arc<Mutex<String>>,
    core: Arc<FneCore>,
}

impl SnapshotSource for CoreSnapshotSource {
    fn config_snapshot(&self) -> String {
        self.config_text.clone()
    }

    fn rules_snapshot(&self) -> String {
        self.rules_text
            .try_lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn affiliation_snapshot(&self) -> String {
        let mut lines = Vec::new();
        for (name, state) in &self.core.systems {
            if let Ok(affiliation) = state.affiliation.try_read() {
                for (peer_id, tgid, rid) in affiliation.iter() {
                    lines.push(format!("{},{},{},{}", name, peer_id, tgid, rid));
                }
            }
        }
        lines.join("\n")
    }

    fn whitelist_snapshot(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        for state in self.core.systems.values() {
            if let Ok(acl) = state.acl.try_read() {
                ids.extend(acl.whitelist_rids.iter().copied());
            }
        }
        ids
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = parse_cli();

    if let Some(level) = &cli.log_level {
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();

    let config_text = std::fs::read_to_string(&cli.config_path)?;
    let config: Config = toml::from_str(&config_text)?;

    let rules_text = std::fs::read_to_string(&config.global.path)?;
    let rules = rules::RuleSet::load(&rules_text, None, Instant::now())?;
    let ignored_peers = system::build_ignored_peers(&rules);

    let mut base_whitelist = std::collections::HashSet::new();
    let mut base_blacklist = std::collections::HashSet::new();
    if let Some(path) = &config.aliases.whitelist_rids_file {
        system::load_rid_csv(path, &mut base_whitelist)?;
    }
    if let Some(path) = &config.aliases.blacklist_rids_file {
        system::load_rid_csv(path, &mut base_blacklist)?;
    }

    // Bind every master-mode system's socket and build its shared state up
    // front, so the FneCore that gets handed to per-system tasks already
    // knows about every other system it might need to route traffic to.
    let mut master_states: HashMap<String, Arc<SystemState>> = HashMap::new();
    let mut master_names: Vec<String> = Vec::new();
    let mut peer_configs: Vec<SystemConfig> = Vec::new();

    for (name, system_cfg) in config.systems {
        if !system_cfg.is_enabled() {
            continue;
        }

        match &system_cfg {
            SystemConfig::Master { .. } => {
                let (address, port) = system_cfg.bind_address();
                let socket = Arc::new(UdpSocket::bind((address, port)).await?);

                let mut acl = AclTables::new();
                acl.whitelist_rids = base_whitelist.clone();
                acl.blacklist_rids = base_blacklist.clone();
                acl.active_tgids = rules.active_tgids(&name);
                acl.ignored_peers = ignored_peers.get(&name).cloned().unwrap_or_default();

                let state = Arc::new(SystemState {
                    socket,
                    passphrase: system_cfg.passphrase().to_string(),
                    peers: RwLock::new(PeerRegistry::new()),
                    acl: RwLock::new(acl),
                    affiliation: RwLock::new(AffiliationMap::new()),
                });

                master_states.insert(name.clone(), state);
                master_names.push(name);
            }
            SystemConfig::Peer { .. } => {
                peer_configs.push(system_cfg);
            }
        }
    }

    let core = FneCore::new(master_states, rules);
    let rules_text_mirror = Arc::new(Mutex::new(rules_text.clone()));

    let reporting = if config.reports.enabled {
        let allowed: Vec<IpAddr> = config
            .reports
            .clients
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect();

        let source = Box::new(CoreSnapshotSource {
            config_text: config_text.clone(),
            rules_text: rules_text_mirror.clone(),
            core: core.clone(),
        });

        let channel = ReportingChannel::bind(
            ("0.0.0.0", config.reports.port),
            allowed,
            Duration::from_secs(config.reports.interval as u64),
            config.global.rcon_tool.clone(),
            source,
        )
        .await?;

        let channel = Arc::new(Mutex::new(channel));

        let runner = channel.clone();
        tokio::spawn(async move {
            let mut guard = runner.lock().await;
            if let Err(e) = guard.up().await {
                error!("reporting channel exited: {}", e);
            }
        });

        Some(channel)
    } else {
        None
    };

    let mut handles = Vec::new();

    let ping_interval = Duration::from_secs(config.global.ping_time as u64);
    let max_missed = config.global.max_missed;

    for name in master_names {
        let core = core.clone();
        let reporting = reporting.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = system::run_master(core, reporting, name, ping_interval, max_missed).await {
                error!("system exited with error: {}", e);
            }
        }));
    }

    if !core.systems.is_empty() {
        let reload_interval = Duration::from_secs(config.global.rules_reload_secs as u64);
        let reload_core = core.clone();
        let reload_rules_path = config.global.path.clone();
        let reload_whitelist = config.aliases.whitelist_rids_file.clone();
        let reload_blacklist = config.aliases.blacklist_rids_file.clone();

        handles.push(tokio::spawn(async move {
            system::run_rule_reload(
                reload_core,
                reload_rules_path,
                reload_whitelist,
                reload_blacklist,
                reload_interval,
                rules_text_mirror,
            )
            .await;
        }));
    }

    for system_cfg in peer_configs {
        let mut peer_sys = PeerSystem::bind(&system_cfg, ping_interval).await?;

        handles.push(tokio::spawn(async move {
            if let Err(e) = peer_sys.up().await {
                error!("system exited with error: {}", e);
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
