// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(rename(deserialize = "global"))]
    pub global: Global,

    #[serde(rename(deserialize = "reports"), default)]
    pub reports: Reports,

    #[serde(rename(deserialize = "log"), default)]
    pub log: Log,

    #[serde(rename(deserialize = "aliases"), default)]
    pub aliases: Aliases,

    #[serde(rename(deserialize = "export_ambe"), default)]
    pub export_ambe: ExportAmbe,

    #[serde(rename(deserialize = "packet_data"), default)]
    pub packet_data: PacketData,

    #[serde(rename(deserialize = "systems"))]
    pub systems: HashMap<String, System>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Global {
    /// Path to the routing rules file, reloaded on `RulesReloadSecs`.
    pub path: String,

    /// Heartbeat interval, in seconds.
    pub ping_time: u32,

    /// Missed pings before a peer (master-mode) or master (peer-mode) is
    /// considered dead.
    pub max_missed: u32,

    /// Path to an external RCON tool, invoked with the arguments carried by
    /// a reporting-channel RCON request. External collaborator: the core
    /// only ever shells out to this configured binary, it does not itself
    /// implement a remote console protocol.
    pub rcon_tool: Option<String>,

    /// Interval, in seconds, that the rule file and RID alias files are
    /// reloaded. Defaults to 240s per the reference implementation.
    #[serde(default = "default_rules_reload")]
    pub rules_reload_secs: u32,
}

fn default_rules_reload() -> u32 {
    240
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Reports {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_report_interval")]
    pub interval: u32,

    #[serde(default = "default_report_port")]
    pub port: u16,

    /// Allowed client source IPs for the reporting channel, `*` permits any.
    #[serde(default)]
    pub clients: Vec<String>,
}

fn default_report_interval() -> u32 {
    240
}

fn default_report_port() -> u16 {
    4321
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Log {
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub raw_packet_trace: bool,

    #[serde(default)]
    pub allow_act_trans: bool,

    #[serde(default)]
    pub allow_diag_trans: bool,

    #[serde(default)]
    pub activity_log_file: Option<String>,

    #[serde(default)]
    pub diag_log_path: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Aliases {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub whitelist_rids_file: Option<String>,

    #[serde(default)]
    pub blacklist_rids_file: Option<String>,

    /// Alias files older than this many days are considered stale and
    /// are reloaded from disk unconditionally on the next tick.
    #[serde(default = "default_stale_days")]
    pub stale_days: u32,
}

fn default_stale_days() -> u32 {
    1
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ExportAmbe {
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PacketData {
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub gateway: Option<String>,

    #[serde(default)]
    pub gateway_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum System {
    Master {
        enabled: bool,
        #[serde(default)]
        repeat: bool,
        #[serde(default)]
        export_ambe: bool,
        #[serde(default)]
        packet_data: bool,
        address: String,
        port: u16,
        passphrase: String,
        group_hangtime: u32,
    },
    Peer {
        enabled: bool,
        #[serde(default)]
        export_ambe: bool,
        #[serde(default)]
        packet_data: bool,
        address: String,
        port: u16,
        master_address: String,
        master_port: u16,
        passphrase: String,
        peer_id: u32,
        identity: String,
        rx_frequency: String,
        tx_frequency: String,
        latitude: String,
        longitude: String,
        location: String,
        software_id: String,
        group_hangtime: u32,
    },
}

impl System {
    pub fn is_enabled(&self) -> bool {
        match self {
            System::Master { enabled, .. } => *enabled,
            System::Peer { enabled, .. } => *enabled,
        }
    }

    pub fn group_hangtime(&self) -> u32 {
        match self {
            System::Master { group_hangtime, .. } => *group_hangtime,
            System::Peer { group_hangtime, .. } => *group_hangtime,
        }
    }

    pub fn bind_address(&self) -> (&str, u16) {
        match self {
            System::Master { address, port, .. } => (address, *port),
            System::Peer { address, port, .. } => (address, *port),
        }
    }

    pub fn passphrase(&self) -> &str {
        match self {
            System::Master { passphrase, .. } => passphrase,
            System::Peer { passphrase, .. } => passphrase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
            [global]
            path = "rules.toml"
            ping_time = 5
            max_missed = 3
            rcon_tool = "/usr/bin/rcon"

            [systems.NET1]
            mode = "master"
            enabled = true
            address = "0.0.0.0"
            port = 62031
            passphrase = "secret"
            group_hangtime = 5
        "#;

        let cfg: Config = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.global.ping_time, 5);
        assert_eq!(cfg.global.max_missed, 3);
        assert_eq!(cfg.global.rules_reload_secs, 240);

        let sys = cfg.systems.get("NET1").unwrap();
        assert!(sys.is_enabled());
        assert_eq!(sys.group_hangtime(), 5);
    }
}
