// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// Rule & Table Plane: routing rules, talkgroup activation timers, and the
// periodic reload/timer-tick behavior.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{FneError, FneResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeoutType {
    None,
    On,
    Off,
}

/// One `(source-system, source-slot, source-TGID) -> (destination-system,
/// destination-slot, destination-TGID)` routing rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDef {
    pub name: String,
    pub src_group: u32,
    pub src_ts: u8,
    pub active: bool,
    pub routable: bool,
    pub dst_net: String,
    pub affiliated: bool,
    pub dst_group: u32,
    pub dst_ts: u8,
    #[serde(default)]
    pub ignored: Vec<u32>,
    pub to_type: TimeoutType,
    /// Timeout, in minutes.
    pub timeout: u32,
    #[serde(default)]
    pub on: Vec<u32>,
    #[serde(default)]
    pub off: Vec<u32>,
}

/// Runtime state for a rule: its static definition plus the mutable,
/// timer-governed fields that must survive a reload when `name` matches
/// across a reload.
#[derive(Debug, Clone)]
pub struct Rule {
    pub def: RuleDef,
    pub routable: bool,
    pub deadline: Option<Instant>,
}

impl Rule {
    fn from_def(def: RuleDef, now: Instant) -> Self {
        let deadline = match def.to_type {
            TimeoutType::None => None,
            _ => Some(now + Duration::from_secs(def.timeout as u64 * 60)),
        };
        let routable = def.routable;
        Self {
            def,
            routable,
            deadline,
        }
    }
}

/// Rules for one system: its group-hangtime, master/slave role, and the
/// list of group-voice rules originating from it.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemRulesDef {
    pub group_hangtime: u32,
    pub master: bool,
    pub send_tgid: bool,
    pub group_voice: Vec<RuleDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleFileDef {
    #[serde(flatten)]
    pub systems: HashMap<String, SystemRulesDef>,
}

/// One system's live rule table.
#[derive(Debug, Clone)]
pub struct SystemRules {
    pub group_hangtime: u32,
    pub master: bool,
    pub send_tgid: bool,
    pub rules: Vec<Rule>,
}

/// The full, atomically-replaceable rule set for every system.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub systems: HashMap<String, SystemRules>,
}

impl RuleSet {
    /// Parses a rule file, preserving `routable`/timer state from `previous`
    /// for any rule whose `NAME` is unchanged.
    pub fn load(contents: &str, previous: Option<&RuleSet>, now: Instant) -> FneResult<RuleSet> {
        let parsed: RuleFileDef =
            toml::from_str(contents).map_err(|e| FneError::RuleParseError(e.to_string()))?;

        let mut systems = HashMap::new();

        for (sys_name, sys_def) in parsed.systems {
            let mut rules = Vec::with_capacity(sys_def.group_voice.len());

            for def in sys_def.group_voice {
                let preserved = previous.and_then(|prev| {
                    prev.systems.get(&sys_name).and_then(|prev_sys| {
                        prev_sys.rules.iter().find(|r| r.def.name == def.name)
                    })
                });

                let rule = match preserved {
                    Some(prev_rule) => Rule {
                        routable: prev_rule.routable,
                        deadline: prev_rule.deadline,
                        def,
                    },
                    None => Rule::from_def(def, now),
                };

                rules.push(rule);
            }

            systems.insert(
                sys_name,
                SystemRules {
                    group_hangtime: sys_def.group_hangtime,
                    master: sys_def.master,
                    send_tgid: sys_def.send_tgid,
                    rules,
                },
            );
        }

        Ok(RuleSet { systems })
    }

    /// Rules on `system_name` whose source matches `(tgid, slot)` and are
    /// both `active` and `routable`.
    pub fn matching_rules(&self, system_name: &str, tgid: u32, slot: u8) -> Vec<&Rule> {
        self.systems
            .get(system_name)
            .map(|sys| {
                sys.rules
                    .iter()
                    .filter(|r| {
                        r.def.active
                            && r.routable
                            && r.def.src_group == tgid
                            && r.def.src_ts == slot
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The set of TGIDs active (at least one `active` rule) on a system.
    pub fn active_tgids(&self, system_name: &str) -> HashSet<u32> {
        self.systems
            .get(system_name)
            .map(|sys| {
                sys.rules
                    .iter()
                    .filter(|r| r.def.active)
                    .map(|r| r.def.src_group)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The set of TGIDs currently deactivated (`active=false`) on a system.
    pub fn deactive_tgids(&self, system_name: &str) -> HashSet<u32> {
        self.systems
            .get(system_name)
            .map(|sys| {
                sys.rules
                    .iter()
                    .filter(|r| !r.def.active)
                    .map(|r| r.def.src_group)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Per-minute tick: flips `routable` on rules whose deadline has
    /// elapsed. `ON` rules auto-deactivate; `OFF` rules auto-reactivate.
    pub fn tick_timers(&mut self, now: Instant) {
        for sys in self.systems.values_mut() {
            for rule in sys.rules.iter_mut() {
                if let Some(deadline) = rule.deadline {
                    if now >= deadline && rule.def.to_type != TimeoutType::None {
                        match rule.def.to_type {
                            TimeoutType::On => rule.routable = false,
                            TimeoutType::Off => rule.routable = true,
                            TimeoutType::None => {}
                        }
                        rule.deadline = None;
                    }
                }
            }
        }
    }

    /// Applies a terminator's ON/OFF/reset-timer trigger to every rule in
    /// every system whose `on`/`off`/`src_group` list matches `tgid`
    /// Reciprocal rules across systems are updated alike.
    pub fn apply_terminator_trigger(&mut self, tgid: u32, now: Instant) {
        for sys in self.systems.values_mut() {
            for rule in sys.rules.iter_mut() {
                if rule.def.src_group == tgid {
                    if rule.def.to_type != TimeoutType::None {
                        rule.deadline =
                            Some(now + Duration::from_secs(rule.def.timeout as u64 * 60));
                    }
                }
                if rule.def.on.contains(&tgid) {
                    rule.routable = true;
                    if rule.def.to_type != TimeoutType::None {
                        rule.deadline =
                            Some(now + Duration::from_secs(rule.def.timeout as u64 * 60));
                    }
                }
                if rule.def.off.contains(&tgid) {
                    rule.routable = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [NET1]
        group_hangtime = 5
        master = true
        send_tgid = true

        [[NET1.group_voice]]
        name = "Testing"
        src_group = 9
        src_ts = 1
        active = true
        routable = true
        dst_net = "NET2"
        affiliated = false
        dst_group = 9
        dst_ts = 2
        to_type = "NONE"
        timeout = 2
    "#;

    #[test]
    fn load_and_match() {
        let now = Instant::now();
        let set = RuleSet::load(SAMPLE, None, now).unwrap();

        let matches = set.matching_rules("NET1", 9, 1);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].def.dst_net, "NET2");
    }

    #[test]
    fn reload_preserves_routable_by_name() {
        let now = Instant::now();
        let mut set = RuleSet::load(SAMPLE, None, now).unwrap();

        set.systems
            .get_mut("NET1")
            .unwrap()
            .rules
            .get_mut(0)
            .unwrap()
            .routable = false;

        let reloaded = RuleSet::load(SAMPLE, Some(&set), now).unwrap();

        assert!(!reloaded.systems["NET1"].rules[0].routable);
    }

    #[test]
    fn on_timeout_deactivates_after_deadline() {
        let now = Instant::now();
        let toml_str = SAMPLE.replace("to_type = \"NONE\"", "to_type = \"ON\"");

        let mut set = RuleSet::load(&toml_str, None, now).unwrap();
        assert!(set.systems["NET1"].rules[0].routable);

        set.tick_timers(now + Duration::from_secs(3 * 60));

        assert!(!set.systems["NET1"].rules[0].routable);
    }
}
