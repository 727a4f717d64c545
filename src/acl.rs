// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// ACL Engine: RID whitelist/blacklist, active-TGID gating, and per-TGID
// peer-ignore lists.

use std::collections::{HashMap, HashSet};

/// RID allow/deny lists and the TGID activation set for one system.
#[derive(Debug, Default, Clone)]
pub struct AclTables {
    pub whitelist_rids: HashSet<u32>,
    pub blacklist_rids: HashSet<u32>,
    pub active_tgids: HashSet<u32>,

    /// Per-TGID list of peer ids a rule should never fan out to. A `0`
    /// entry in the list means "ignore all peers" (subject to the
    /// affiliation override below).
    pub ignored_peers: HashMap<u32, Vec<u32>>,
}

impl AclTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rid_allowed(&self, rid: u32) -> bool {
        if self.blacklist_rids.contains(&rid) {
            return false;
        }
        if self.whitelist_rids.is_empty() {
            return true;
        }
        self.whitelist_rids.contains(&rid)
    }

    pub fn rid_blacklisted(&self, rid: u32) -> bool {
        self.blacklist_rids.contains(&rid)
    }

    pub fn tgid_active(&self, tgid: u32) -> bool {
        self.active_tgids.contains(&tgid)
    }

    /// Whether a unit-to-unit call is allowed: both endpoints must be on
    /// the whitelist. The reference implementation's original condition is
    /// a tautology (`(WL==false AND WL==false) OR (WL==false OR WL==false)`
    /// always reduces to "either is not whitelisted"); this method
    /// implements that resolved intent directly rather than reproducing the
    /// tautological expression.
    pub fn unit_call_allowed(&self, src_rid: u32, dst_rid: u32) -> bool {
        if self.whitelist_rids.is_empty() {
            return true;
        }
        self.whitelist_rids.contains(&src_rid) && self.whitelist_rids.contains(&dst_rid)
    }

    /// `true` when `peer_id` is on the ignore list for `tgid` and is not
    /// rescued by an affiliation. `affiliated` and `has_affiliation`
    /// together implement the override: a rule
    /// with `affiliated=true` only respects the ignore list when the
    /// target peer has no affiliated RID on the destination TGID.
    pub fn peer_ignored(
        &self,
        tgid: u32,
        peer_id: u32,
        affiliated_rule: bool,
        has_affiliation: bool,
    ) -> bool {
        let ignored = match self.ignored_peers.get(&tgid) {
            Some(list) => list.contains(&peer_id) || list.contains(&0),
            None => false,
        };

        if !ignored {
            return false;
        }

        if affiliated_rule && has_affiliation {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_wins_over_empty_whitelist() {
        let mut acl = AclTables::new();
        acl.blacklist_rids.insert(666);

        assert!(!acl.rid_allowed(666));
        assert!(acl.rid_allowed(123));
    }

    #[test]
    fn whitelist_restricts_when_nonempty() {
        let mut acl = AclTables::new();
        acl.whitelist_rids.insert(123);

        assert!(acl.rid_allowed(123));
        assert!(!acl.rid_allowed(456));
    }

    #[test]
    fn ignored_peers_sentinel_zero_blocks_all() {
        let mut acl = AclTables::new();
        acl.ignored_peers.insert(9, vec![0]);

        assert!(acl.peer_ignored(9, 200, false, false));
        assert!(acl.peer_ignored(9, 999, false, false));
    }

    #[test]
    fn affiliation_overrides_ignore_list() {
        let mut acl = AclTables::new();
        acl.ignored_peers.insert(9, vec![0]);

        assert!(!acl.peer_ignored(9, 200, true, true));
        assert!(acl.peer_ignored(9, 200, true, false));
    }

    #[test]
    fn unit_call_requires_both_whitelisted() {
        let mut acl = AclTables::new();
        acl.whitelist_rids.insert(100);

        assert!(!acl.unit_call_allowed(100, 200));
        assert!(!acl.unit_call_allowed(200, 100));

        acl.whitelist_rids.insert(200);
        assert!(acl.unit_call_allowed(100, 200));
    }
}
