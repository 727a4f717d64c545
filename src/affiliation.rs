// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// Affiliation Tracker: per-peer map of TGID -> set<RID>, mutated by P25
// Group-Affiliation-Request / Unit-Deregistration-Request TSBKs.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct AffiliationMap {
    peers: HashMap<u32, HashMap<u32, HashSet<u32>>>,
}

impl AffiliationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// P25 `GRP_AFF_REQ` handler: records that `rid` is affiliated to
    /// `tgid` on `peer_id`.
    pub fn update(&mut self, peer_id: u32, tgid: u32, rid: u32) {
        self.peers
            .entry(peer_id)
            .or_insert_with(HashMap::new)
            .entry(tgid)
            .or_insert_with(HashSet::new)
            .insert(rid);
    }

    /// P25 `U_DEREG_ACK` handler: removes `rid` from `tgid` on `peer_id`;
    /// deletes the TGID entry entirely once its RID set becomes empty.
    pub fn remove(&mut self, peer_id: u32, rid: u32) {
        if let Some(tgids) = self.peers.get_mut(&peer_id) {
            let mut empty_tgids = Vec::new();

            for (tgid, rids) in tgids.iter_mut() {
                rids.remove(&rid);
                if rids.is_empty() {
                    empty_tgids.push(*tgid);
                }
            }

            for tgid in empty_tgids {
                tgids.remove(&tgid);
            }
        }
    }

    pub fn has_affiliation(&self, peer_id: u32, tgid: u32) -> bool {
        self.peers
            .get(&peer_id)
            .and_then(|tgids| tgids.get(&tgid))
            .map(|rids| !rids.is_empty())
            .unwrap_or(false)
    }

    pub fn rids_for(&self, peer_id: u32, tgid: u32) -> HashSet<u32> {
        self.peers
            .get(&peer_id)
            .and_then(|tgids| tgids.get(&tgid))
            .cloned()
            .unwrap_or_default()
    }

    /// Flattens the whole table into `(peer_id, tgid, rid)` triples, for the
    /// reporting channel's affiliation snapshot.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.peers.iter().flat_map(|(&peer_id, tgids)| {
            tgids.iter().flat_map(move |(&tgid, rids)| {
                rids.iter().map(move |&rid| (peer_id, tgid, rid))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affiliation_lifecycle() {
        let mut map = AffiliationMap::new();

        map.update(100, 9, 4001);
        assert!(map.has_affiliation(100, 9));
        assert_eq!(map.rids_for(100, 9), [4001].iter().copied().collect());

        map.remove(100, 4001);
        assert!(!map.has_affiliation(100, 9));
        assert!(map.rids_for(100, 9).is_empty());
    }

    #[test]
    fn affiliation_survives_other_rids() {
        let mut map = AffiliationMap::new();
        map.update(100, 9, 4001);
        map.update(100, 9, 4002);

        map.remove(100, 4001);

        assert!(map.has_affiliation(100, 9));
    }
}
