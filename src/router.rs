// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// Call Router: ACL gating, stream/collision detection, contention
// arbitration, frame rewriting, and rule-driven fan-out across systems.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::acl::AclTables;
use crate::affiliation::AffiliationMap;
use crate::frame::{DmrFrame, P25Frame, STREAM_TO};
use crate::lc::{self, LC_LEN};
use crate::rules::RuleSet;

/// Reporting-channel call event.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub event_type: &'static str,
    pub subtype: &'static str,
    pub proto: &'static str,
    pub system: String,
    pub stream_id: u32,
    pub peer_id: u32,
    pub rf_src: u32,
    pub slot: u8,
    pub dst_id: u32,
    pub duration: Option<Duration>,
}

impl CallEvent {
    /// Renders the event in the comma-separated reporting-channel wire format.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{},{},{},{},{},{},{},{},{}",
            self.event_type,
            self.subtype,
            self.proto,
            self.system,
            self.stream_id,
            self.peer_id,
            self.rf_src,
            self.slot,
            self.dst_id
        );
        if let Some(d) = self.duration {
            line.push(',');
            line.push_str(&format!("{:.3}", d.as_secs_f64()));
        }
        line
    }
}

/// Either protocol's outbound wire frame, carried by `Outbound` so a single
/// fan-out list can span both DMR and P25 traffic.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Dmr(DmrFrame),
    P25(P25Frame),
}

impl OutboundFrame {
    pub fn to_bytes(&self) -> bytes::BytesMut {
        match self {
            OutboundFrame::Dmr(f) => f.to_bytes(),
            OutboundFrame::P25(f) => f.to_bytes(),
        }
    }
}

/// An outbound frame addressed to a specific peer on a specific system.
/// Carrying the destination system's name (not just its peer id) is what
/// lets the caller resolve which system's socket actually owns that peer.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub system: String,
    pub peer_id: u32,
    pub endpoint: SocketAddr,
    pub frame: OutboundFrame,
}

/// Everything a single inbound burst produced: zero or more outbound
/// frames and zero or more reporting events.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub outbound: Vec<Outbound>,
    pub events: Vec<CallEvent>,
}

/// A snapshot of one system's fan-out surface: its connected peers
/// (id, endpoint) plus the ACL/affiliation tables gating traffic delivered
/// *to* it. Resolving a rule's `dst_net` against a map of these is what
/// lets the router reach a peer connected to a different system than the
/// one the inbound burst arrived on.
#[derive(Debug, Clone, Default)]
pub struct SystemTargets {
    pub peers: Vec<(u32, SocketAddr)>,
    pub acl: AclTables,
    pub affiliation: AffiliationMap,
}

/// Per-(system, slot) DMR call state.
#[derive(Debug, Clone)]
struct CallState {
    stream_id: u32,
    src_rid: u32,
    dst_tgid: u32,
    peer_id: u32,
    start_time: Instant,
    last_frame_time: Instant,
    cached_lc: Option<[u8; LC_LEN]>,
}

/// Per-system P25 call state (P25 has no slot concept in this model; one
/// logical channel per system, consistent with the `slot: 1` convention
/// already used for TSBK events).
#[derive(Debug, Clone)]
struct P25CallState {
    stream_id: u32,
    src_rid: u32,
    dst_tgid: u32,
    peer_id: u32,
    start_time: Instant,
    last_frame_time: Instant,
}

/// Per-destination-peer active outbound stream, used for the contention
/// check performed during fan-out contention arbitration.
#[derive(Debug, Clone)]
struct TargetStreamState {
    tgid: u32,
    rid: u32,
    last_frame_time: Instant,
}

#[derive(Debug, Default)]
pub struct CallRouter {
    /// Keyed by (system name, slot).
    call_states: HashMap<(String, u8), CallState>,
    p25_call_states: HashMap<String, P25CallState>,

    /// Keyed by (target peer id, slot): what a target is currently
    /// carrying, for contention arbitration.
    target_streams: HashMap<(u32, u8), TargetStreamState>,
    p25_target_streams: HashMap<u32, TargetStreamState>,
}

impl CallRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes one inbound DMR burst originating on `src_system`.
    pub fn route_dmr(
        &mut self,
        src_system: &str,
        frame: &DmrFrame,
        acl: &AclTables,
        rules: &mut RuleSet,
        targets: &HashMap<String, SystemTargets>,
        now: Instant,
    ) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        // Step 2: ACL gate.
        if acl.rid_blacklisted(frame.src) {
            outcome.events.push(CallEvent {
                event_type: "REJECT ACL",
                subtype: "BLACKLISTED RID",
                proto: "DMR",
                system: src_system.to_string(),
                stream_id: frame.stream_id,
                peer_id: frame.peer_id,
                rf_src: frame.src,
                slot: frame.slot(),
                dst_id: frame.dst,
                duration: None,
            });
            return outcome;
        }

        if !frame.is_private_call() && !acl.tgid_active(frame.dst) {
            outcome.events.push(CallEvent {
                event_type: "REJECT ACL",
                subtype: "ILLEGAL TGID",
                proto: "DMR",
                system: src_system.to_string(),
                stream_id: frame.stream_id,
                peer_id: frame.peer_id,
                rf_src: frame.src,
                slot: frame.slot(),
                dst_id: frame.dst,
                duration: None,
            });
            return outcome;
        }

        let key = (src_system.to_string(), frame.slot());

        // Step 3 + 4: terminator always passes; otherwise detect collision.
        if !frame.is_terminator() {
            if let Some(existing) = self.call_states.get(&key) {
                let within_timeout =
                    now.duration_since(existing.last_frame_time) < Duration::from_secs_f64(STREAM_TO);
                let new_stream = existing.stream_id != frame.stream_id;
                let different_rid = existing.src_rid != frame.src;

                if new_stream && within_timeout && different_rid {
                    outcome.events.push(CallEvent {
                        event_type: "GROUP VOICE",
                        subtype: "CALL COLLISION",
                        proto: "DMR",
                        system: src_system.to_string(),
                        stream_id: frame.stream_id,
                        peer_id: frame.peer_id,
                        rf_src: frame.src,
                        slot: frame.slot(),
                        dst_id: frame.dst,
                        duration: None,
                    });
                    return outcome;
                }
            }
        }

        // Step 5: LC capture / synthesis, and call-state bookkeeping.
        let is_new_stream = self
            .call_states
            .get(&key)
            .map(|s| s.stream_id != frame.stream_id)
            .unwrap_or(true);

        if is_new_stream {
            let cached_lc = if frame.is_voice_header() {
                decode_lc_from_frame(frame)
            } else {
                Some(synthesize_lc(frame.src, frame.dst))
            };

            self.call_states.insert(
                key.clone(),
                CallState {
                    stream_id: frame.stream_id,
                    src_rid: frame.src,
                    dst_tgid: frame.dst,
                    peer_id: frame.peer_id,
                    start_time: now,
                    last_frame_time: now,
                    cached_lc,
                },
            );

            outcome.events.push(CallEvent {
                event_type: "GROUP VOICE",
                subtype: "START",
                proto: "DMR",
                system: src_system.to_string(),
                stream_id: frame.stream_id,
                peer_id: frame.peer_id,
                rf_src: frame.src,
                slot: frame.slot(),
                dst_id: frame.dst,
                duration: None,
            });
        } else if let Some(state) = self.call_states.get_mut(&key) {
            state.last_frame_time = now;
        }

        let source_lc = self
            .call_states
            .get(&key)
            .and_then(|s| s.cached_lc)
            .unwrap_or_else(|| synthesize_lc(frame.src, frame.dst));

        // Step 6 + 7: rule scan, contention, affiliation gate, fan-out.
        let matching: Vec<_> = rules
            .matching_rules(src_system, frame.dst, frame.slot())
            .into_iter()
            .cloned()
            .collect();

        for rule in &matching {
            let dest_slot = rule.def.dst_ts;
            let dest_tgid = rule.def.dst_group;

            let target_system = match targets.get(&rule.def.dst_net) {
                Some(t) => t,
                None => continue,
            };

            for &(peer_id, endpoint) in &target_system.peers {
                let target_key = (peer_id, dest_slot);

                // Affiliation gate.
                if rule.def.affiliated
                    && !target_system.affiliation.has_affiliation(peer_id, dest_tgid)
                {
                    continue;
                }

                // Ignored-peers gate, overridden by affiliation.
                let has_affiliation = target_system.affiliation.has_affiliation(peer_id, dest_tgid);
                if target_system
                    .acl
                    .peer_ignored(dest_tgid, peer_id, rule.def.affiliated, has_affiliation)
                {
                    continue;
                }

                // Contention: skip target if busy with a different RID on
                // a matching TGID and group-hangtime hasn't elapsed.
                if let Some(busy) = self.target_streams.get(&target_key) {
                    let hangtime_elapsed = now.duration_since(busy.last_frame_time)
                        >= Duration::from_secs(rule_group_hangtime(rules, &rule.def.dst_net) as u64);

                    if busy.tgid == dest_tgid && busy.rid != frame.src && !hangtime_elapsed {
                        outcome.events.push(CallEvent {
                            event_type: "CALL ROUTE",
                            subtype: "FAILED",
                            proto: "DMR",
                            system: rule.def.dst_net.clone(),
                            stream_id: frame.stream_id,
                            peer_id,
                            rf_src: frame.src,
                            slot: dest_slot,
                            dst_id: dest_tgid,
                            duration: None,
                        });
                        continue;
                    }
                }

                self.target_streams.insert(
                    target_key,
                    TargetStreamState {
                        tgid: dest_tgid,
                        rid: frame.src,
                        last_frame_time: now,
                    },
                );

                let mut out = frame.clone();
                out.peer_id = peer_id;
                out.dst = dest_tgid;
                out.ctrl = out.with_slot(dest_slot);

                if dest_tgid != frame.dst && out.is_voice_header() {
                    if let Ok(re_encoded) = re_encode_lc(&source_lc, &out) {
                        out.payload = re_encoded;
                    }
                }

                outcome.outbound.push(Outbound {
                    system: rule.def.dst_net.clone(),
                    peer_id,
                    endpoint,
                    frame: OutboundFrame::Dmr(out),
                });

                outcome.events.push(CallEvent {
                    event_type: "CALL ROUTE",
                    subtype: "TO",
                    proto: "DMR",
                    system: rule.def.dst_net.clone(),
                    stream_id: frame.stream_id,
                    peer_id,
                    rf_src: frame.src,
                    slot: dest_slot,
                    dst_id: dest_tgid,
                    duration: None,
                });
            }
        }

        // Step 8: terminator handling.
        if frame.is_terminator() {
            if let Some(state) = self.call_states.remove(&key) {
                outcome.events.push(CallEvent {
                    event_type: "GROUP VOICE",
                    subtype: "END",
                    proto: "DMR",
                    system: src_system.to_string(),
                    stream_id: state.stream_id,
                    peer_id: state.peer_id,
                    rf_src: state.src_rid,
                    slot: key.1,
                    dst_id: state.dst_tgid,
                    duration: Some(now.duration_since(state.start_time)),
                });

                rules.apply_terminator_trigger(state.dst_tgid, now);
            }
        }

        outcome
    }

    /// Routes one inbound P25 voice/data burst (LDU1/LDU2/HDU/TDU/TDULC/PDU)
    /// originating on `src_system` through the same ACL/collision/rule-scan
    /// /fan-out pipeline `route_dmr` applies to DMR traffic. TSBK
    /// administrative frames never reach this path; they go through
    /// `preprocess_p25` instead.
    pub fn route_p25(
        &mut self,
        src_system: &str,
        frame: &P25Frame,
        acl: &AclTables,
        rules: &mut RuleSet,
        targets: &HashMap<String, SystemTargets>,
        now: Instant,
    ) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        if acl.rid_blacklisted(frame.src) {
            outcome.events.push(CallEvent {
                event_type: "REJECT ACL",
                subtype: "BLACKLISTED RID",
                proto: "P25",
                system: src_system.to_string(),
                stream_id: frame.stream_id,
                peer_id: frame.peer_id,
                rf_src: frame.src,
                slot: 1,
                dst_id: frame.dst,
                duration: None,
            });
            return outcome;
        }

        if frame.is_group() && !acl.tgid_active(frame.dst) {
            outcome.events.push(CallEvent {
                event_type: "REJECT ACL",
                subtype: "ILLEGAL TGID",
                proto: "P25",
                system: src_system.to_string(),
                stream_id: frame.stream_id,
                peer_id: frame.peer_id,
                rf_src: frame.src,
                slot: 1,
                dst_id: frame.dst,
                duration: None,
            });
            return outcome;
        }

        let key = src_system.to_string();

        if !frame.is_terminator() {
            if let Some(existing) = self.p25_call_states.get(&key) {
                let within_timeout =
                    now.duration_since(existing.last_frame_time) < Duration::from_secs_f64(STREAM_TO);
                let new_stream = existing.stream_id != frame.stream_id;
                let different_rid = existing.src_rid != frame.src;

                if new_stream && within_timeout && different_rid {
                    outcome.events.push(CallEvent {
                        event_type: "GROUP VOICE",
                        subtype: "CALL COLLISION",
                        proto: "P25",
                        system: src_system.to_string(),
                        stream_id: frame.stream_id,
                        peer_id: frame.peer_id,
                        rf_src: frame.src,
                        slot: 1,
                        dst_id: frame.dst,
                        duration: None,
                    });
                    return outcome;
                }
            }
        }

        let is_new_stream = self
            .p25_call_states
            .get(&key)
            .map(|s| s.stream_id != frame.stream_id)
            .unwrap_or(true);

        if is_new_stream {
            self.p25_call_states.insert(
                key.clone(),
                P25CallState {
                    stream_id: frame.stream_id,
                    src_rid: frame.src,
                    dst_tgid: frame.dst,
                    peer_id: frame.peer_id,
                    start_time: now,
                    last_frame_time: now,
                },
            );

            outcome.events.push(CallEvent {
                event_type: "GROUP VOICE",
                subtype: "START",
                proto: "P25",
                system: src_system.to_string(),
                stream_id: frame.stream_id,
                peer_id: frame.peer_id,
                rf_src: frame.src,
                slot: 1,
                dst_id: frame.dst,
                duration: None,
            });
        } else if let Some(state) = self.p25_call_states.get_mut(&key) {
            state.last_frame_time = now;
        }

        let matching: Vec<_> = rules
            .matching_rules(src_system, frame.dst, 1)
            .into_iter()
            .cloned()
            .collect();

        for rule in &matching {
            let dest_tgid = rule.def.dst_group;

            let target_system = match targets.get(&rule.def.dst_net) {
                Some(t) => t,
                None => continue,
            };

            for &(peer_id, endpoint) in &target_system.peers {
                if rule.def.affiliated
                    && !target_system.affiliation.has_affiliation(peer_id, dest_tgid)
                {
                    continue;
                }

                let has_affiliation = target_system.affiliation.has_affiliation(peer_id, dest_tgid);
                if target_system
                    .acl
                    .peer_ignored(dest_tgid, peer_id, rule.def.affiliated, has_affiliation)
                {
                    continue;
                }

                if let Some(busy) = self.p25_target_streams.get(&peer_id) {
                    let hangtime_elapsed = now.duration_since(busy.last_frame_time)
                        >= Duration::from_secs(rule_group_hangtime(rules, &rule.def.dst_net) as u64);

                    if busy.tgid == dest_tgid && busy.rid != frame.src && !hangtime_elapsed {
                        outcome.events.push(CallEvent {
                            event_type: "CALL ROUTE",
                            subtype: "FAILED",
                            proto: "P25",
                            system: rule.def.dst_net.clone(),
                            stream_id: frame.stream_id,
                            peer_id,
                            rf_src: frame.src,
                            slot: 1,
                            dst_id: dest_tgid,
                            duration: None,
                        });
                        continue;
                    }
                }

                self.p25_target_streams.insert(
                    peer_id,
                    TargetStreamState {
                        tgid: dest_tgid,
                        rid: frame.src,
                        last_frame_time: now,
                    },
                );

                let mut out = frame.clone();
                out.peer_id = peer_id;
                out.dst = dest_tgid;

                outcome.outbound.push(Outbound {
                    system: rule.def.dst_net.clone(),
                    peer_id,
                    endpoint,
                    frame: OutboundFrame::P25(out),
                });

                outcome.events.push(CallEvent {
                    event_type: "CALL ROUTE",
                    subtype: "TO",
                    proto: "P25",
                    system: rule.def.dst_net.clone(),
                    stream_id: frame.stream_id,
                    peer_id,
                    rf_src: frame.src,
                    slot: 1,
                    dst_id: dest_tgid,
                    duration: None,
                });
            }
        }

        if frame.is_terminator() {
            if let Some(state) = self.p25_call_states.remove(&key) {
                outcome.events.push(CallEvent {
                    event_type: "GROUP VOICE",
                    subtype: "END",
                    proto: "P25",
                    system: src_system.to_string(),
                    stream_id: state.stream_id,
                    peer_id: state.peer_id,
                    rf_src: state.src_rid,
                    slot: 1,
                    dst_id: state.dst_tgid,
                    duration: Some(now.duration_since(state.start_time)),
                });

                rules.apply_terminator_trigger(state.dst_tgid, now);
            }
        }

        outcome
    }

    /// Drops any call state whose last frame predates `now - STREAM_TO`,
    /// for systems that are not receiving continuous traffic.
    pub fn expire_stale_streams(&mut self, now: Instant) {
        self.call_states.retain(|_, state| {
            now.duration_since(state.last_frame_time) < Duration::from_secs_f64(STREAM_TO)
        });
        self.p25_call_states.retain(|_, state| {
            now.duration_since(state.last_frame_time) < Duration::from_secs_f64(STREAM_TO)
        });
    }

    /// P25 TSBK preprocessing: affiliation updates never fan out through the
    /// voice path, they only mutate shared tables and emit a `TSBK` event.
    pub fn preprocess_p25(
        &mut self,
        src_system: &str,
        frame: &P25Frame,
        affiliation: &mut AffiliationMap,
    ) -> Vec<CallEvent> {
        use crate::frame::{P25_TSBK_IOSP_GRP_AFF, P25_TSBK_OSP_U_DEREG_ACK};

        let mut events = Vec::new();

        if frame.lcf == P25_TSBK_IOSP_GRP_AFF {
            affiliation.update(frame.peer_id, frame.dst, frame.src);
        } else if frame.lcf == P25_TSBK_OSP_U_DEREG_ACK {
            affiliation.remove(frame.peer_id, frame.src);
        }

        events.push(CallEvent {
            event_type: "TSBK",
            subtype: "ACK_RSP",
            proto: "P25",
            system: src_system.to_string(),
            stream_id: frame.stream_id,
            peer_id: frame.peer_id,
            rf_src: frame.src,
            slot: 1,
            dst_id: frame.dst,
            duration: None,
        });

        events
    }
}

fn rule_group_hangtime(rules: &RuleSet, system_name: &str) -> u32 {
    rules
        .systems
        .get(system_name)
        .map(|s| s.group_hangtime)
        .unwrap_or(5)
}

/// Decodes the BPTC-protected full LC out of a voice-LC-header burst; falls
/// back to a synthesized LC if the embedded bits don't decode cleanly
/// for late entry into an already-running stream.
fn decode_lc_from_frame(frame: &DmrFrame) -> Option<[u8; LC_LEN]> {
    let bits: Vec<bool> = frame
        .payload
        .iter()
        .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 != 0))
        .collect();

    // info = payload[0:98] ++ payload[166:264], mirroring the physical-layer
    // physical-layer stitch order.
    let mut info: Vec<bool> = bits[0..98].to_vec();
    info.extend_from_slice(&bits[166..264]);

    lc::bptc::decode_full_lc(&info)
        .ok()
        .or_else(|| Some(synthesize_lc(frame.src, frame.dst)))
}

/// Synthesizes a generic group-voice LC from source/destination when no
/// header frame was captured.
fn synthesize_lc(src: u32, dst_tgid: u32) -> [u8; LC_LEN] {
    let mut lc = [0u8; LC_LEN];
    // FLCO=group-voice, FID=ETSI, service options = generic per LC_OPT.
    lc[0] = 0x00;
    lc[1] = 0x00;
    lc[2] = 0x20;
    lc[3] = ((dst_tgid >> 16) & 0xff) as u8;
    lc[4] = ((dst_tgid >> 8) & 0xff) as u8;
    lc[5] = (dst_tgid & 0xff) as u8;
    lc[6] = ((src >> 16) & 0xff) as u8;
    lc[7] = ((src >> 8) & 0xff) as u8;
    lc[8] = (src & 0xff) as u8;
    lc
}

/// Regenerates the full LC (and its BPTC-protected encoding) for an
/// outbound stream whose destination TGID differs from the source TGID
/// when fanning out to a rule whose destination TGID differs.
fn re_encode_lc(source_lc: &[u8; LC_LEN], out_frame: &DmrFrame) -> Result<[u8; 33], ()> {
    let mut new_lc = *source_lc;
    new_lc[3] = ((out_frame.dst >> 16) & 0xff) as u8;
    new_lc[4] = ((out_frame.dst >> 8) & 0xff) as u8;
    new_lc[5] = (out_frame.dst & 0xff) as u8;

    let encoded = lc::bptc::encode_full_lc(&new_lc);

    let mut payload = out_frame.payload;
    let info_bits = &encoded[..];

    let mut idx = 0usize;
    for byte_idx in 0..12 {
        let mut byte = 0u8;
        for bit in 0..8 {
            if idx < 98 && info_bits.get(idx).copied().unwrap_or(false) {
                byte |= 1 << (7 - bit);
            }
            idx += 1;
        }
        payload[byte_idx] = byte;
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSet;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn sample_rules() -> RuleSet {
        let toml_str = r#"
            [NET1]
            group_hangtime = 5
            master = true
            send_tgid = true

            [[NET1.group_voice]]
            name = "Test"
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
        RuleSet::load(toml_str, None, Instant::now()).unwrap()
    }

    /// A single connected peer (id 200) sitting on `NET2`, the way a real
    /// deployment would register it: via the destination system's own
    /// `SystemTargets` entry, never the source system's.
    fn targets_with_net2_peer(tgid_active: u32) -> HashMap<String, SystemTargets> {
        let mut acl = AclTables::new();
        acl.active_tgids.insert(tgid_active);

        let mut map = HashMap::new();
        map.insert(
            "NET2".to_string(),
            SystemTargets {
                peers: vec![(200, addr(1))],
                acl,
                affiliation: AffiliationMap::new(),
            },
        );
        map
    }

    #[test]
    fn group_voice_fans_out_to_dst_net() {
        let mut router = CallRouter::new();
        let acl = {
            let mut a = AclTables::new();
            a.active_tgids.insert(9);
            a
        };
        let mut rules = sample_rules();
        let targets = targets_with_net2_peer(9);

        let frame = DmrFrame {
            seq: 0,
            src: 3001,
            dst: 9,
            peer_id: 100,
            ctrl: 0x21,
            stream_id: 0xDEAD,
            payload: [0u8; 33],
            rssi: 0,
            err: 0,
        };

        let outcome = router.route_dmr("NET1", &frame, &acl, &mut rules, &targets, Instant::now());

        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(outcome.outbound[0].peer_id, 200);
        assert_eq!(outcome.outbound[0].system, "NET2");
        match &outcome.outbound[0].frame {
            OutboundFrame::Dmr(f) => assert_eq!(f.ctrl & 0x80, 0x80),
            OutboundFrame::P25(_) => panic!("expected DMR outbound"),
        }
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == "CALL ROUTE" && e.subtype == "TO"));
    }

    #[test]
    fn stream_collision_detected() {
        let mut router = CallRouter::new();
        let mut acl = AclTables::new();
        acl.active_tgids.insert(9);
        let mut rules = sample_rules();
        let targets = targets_with_net2_peer(9);

        let now = Instant::now();

        let first = DmrFrame {
            seq: 0,
            src: 3001,
            dst: 9,
            peer_id: 100,
            ctrl: 0x21,
            stream_id: 0xDEAD,
            payload: [0u8; 33],
            rssi: 0,
            err: 0,
        };
        router.route_dmr("NET1", &first, &acl, &mut rules, &targets, now);

        let second = DmrFrame {
            seq: 1,
            src: 3002,
            dst: 9,
            peer_id: 100,
            ctrl: 0x21,
            stream_id: 0xBEEF,
            payload: [0u8; 33],
            rssi: 0,
            err: 0,
        };

        let outcome = router.route_dmr(
            "NET1",
            &second,
            &acl,
            &mut rules,
            &targets,
            now + Duration::from_millis(100),
        );

        assert!(outcome.outbound.is_empty());
        assert_eq!(
            outcome
                .events
                .iter()
                .filter(|e| e.subtype == "CALL COLLISION")
                .count(),
            1
        );
    }

    #[test]
    fn unknown_dst_net_is_skipped_not_panicking() {
        let mut router = CallRouter::new();
        let mut acl = AclTables::new();
        acl.active_tgids.insert(9);
        let mut rules = sample_rules();
        let targets: HashMap<String, SystemTargets> = HashMap::new();

        let frame = DmrFrame {
            seq: 0,
            src: 3001,
            dst: 9,
            peer_id: 100,
            ctrl: 0x21,
            stream_id: 0xDEAD,
            payload: [0u8; 33],
            rssi: 0,
            err: 0,
        };

        let outcome = router.route_dmr("NET1", &frame, &acl, &mut rules, &targets, Instant::now());
        assert!(outcome.outbound.is_empty());
    }

    #[test]
    fn p25_group_voice_fans_out_cross_system() {
        let mut router = CallRouter::new();
        let mut acl = AclTables::new();
        acl.active_tgids.insert(9);
        let mut rules = sample_rules();
        let targets = targets_with_net2_peer(9);

        let frame = P25Frame {
            lcf: crate::frame::P25_LC_GROUP,
            src: 4001,
            dst: 9,
            peer_id: 100,
            ctrl: 0,
            stream_id: 0xCAFE,
            payload: vec![0u8; 40],
        };

        let outcome = router.route_p25("NET1", &frame, &acl, &mut rules, &targets, Instant::now());

        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(outcome.outbound[0].peer_id, 200);
        assert_eq!(outcome.outbound[0].system, "NET2");
        match &outcome.outbound[0].frame {
            OutboundFrame::P25(f) => assert_eq!(f.dst, 9),
            OutboundFrame::Dmr(_) => panic!("expected P25 outbound"),
        }
    }
}
