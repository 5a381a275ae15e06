// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! End-to-end tests driving a [`Firewall`] through its public
//! operations.

use ipfw_test_utils as common;

use common::*;
use itertools::Itertools;
use std::time::Duration;
use std::time::Instant;

const CLIENT: &str = "1.2.3.4:5000";
const SERVER: &str = "5.6.7.8:80";

fn syn() -> TcpFlags {
    TcpFlags::SYN
}

fn syn_ack() -> TcpFlags {
    TcpFlags::SYN | TcpFlags::ACK
}

/// check-state at 50, a stateful allow for web traffic at 100.
fn web_rules(t: &TestFw) {
    t.add_rules(&[
        RuleBuilder::new(50, Cmd::CheckState).finalize(),
        RuleBuilder::new(100, Cmd::Accept)
            .add_match(Cmd::Proto(IPPROTO_TCP))
            .add_match(dst_port(80))
            .keep_state()
            .finalize(),
    ]);
}

#[test]
fn reply_matches_state_created_by_first_packet() {
    let t = TestFw::new();
    web_rules(&t);

    assert_eq!(t.fw.evaluate(&tcp(CLIENT, SERVER, syn())), Verdict::Accept);
    assert_eq!(t.fw.state_count(), 1);
    assert_eq!(t.states_of(100), 1);

    // The reply does not match rule 100's predicates at all; only the
    // dynamic entry lets it through.
    let reply = tcp(SERVER, CLIENT, syn_ack());
    assert_eq!(t.fw.evaluate(&reply), Verdict::Accept);
    assert_eq!(t.fw.state_count(), 1);

    // Rule 100 is charged for both packets, check-state for neither.
    assert_eq!(t.counters(100), (2, 120));
    assert_eq!(t.counters(50), (0, 0));

    // The packet that creates an entry is not charged to it.
    let states = t.fw.get_dynamic_snapshot().states;
    assert_eq!(states[0].pkt_cnt, 1);
    assert_eq!(states[0].dyn_type, DynType::KeepState);
}

#[test]
fn idle_state_ages_out() {
    let t = TestFw::new();
    web_rules(&t);

    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));
    assert_eq!(t.fw.state_count(), 1);

    // Not yet expired.
    t.advance(10);
    assert_eq!(t.fw.tick().expired, 0);

    t.advance(t.fw.config().dyn_ack_lifetime as u64 + 1);
    assert_eq!(t.fw.tick().expired, 1);
    assert_eq!(t.fw.state_count(), 0);

    // With the state gone, the reply is back to the default rule.
    let reply = tcp(SERVER, CLIENT, syn_ack());
    assert_eq!(t.fw.evaluate(&reply), Verdict::Deny);
}

#[test]
fn limit_caps_connections_per_source() {
    let t = TestFw::new();
    t.add_rules(&[RuleBuilder::new(100, Cmd::Accept)
        .add_match(Cmd::Proto(IPPROTO_TCP))
        .limit(LimitMask::SRC_ADDR, 2)
        .finalize()]);

    let verdicts = (5001..=5003)
        .map(|port| {
            let src = format!("1.2.3.4:{port}");
            t.fw.evaluate(&tcp(&src, SERVER, syn()))
        })
        .collect_vec();
    assert_eq!(verdicts, [Verdict::Accept, Verdict::Accept, Verdict::Deny]);

    let states = t.fw.get_dynamic_snapshot().states;
    let (parents, children): (Vec<_>, Vec<_>) = states
        .iter()
        .partition(|s| s.dyn_type == DynType::LimitParent);
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].limit_count, 2);
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|s| s.dyn_type == DynType::Limit));

    // Another source has its own budget.
    let other = tcp("1.2.3.5:6000", SERVER, syn());
    assert_eq!(t.fw.evaluate(&other), Verdict::Accept);
    assert_eq!(t.fw.state_count(), 5);
}

#[test]
fn delete_reaps_state_of_removed_rule() {
    let t = TestFw::new();
    web_rules(&t);

    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));
    t.fw.evaluate(&tcp("1.2.3.4:5001", SERVER, syn()));
    assert_eq!(t.states_of(100), 2);

    t.fw.delete_rule(100).unwrap();
    assert_eq!(t.states_of(100), 0);
    assert_eq!(t.fw.state_count(), 0);

    // A packet matching the old rule falls through to the default.
    assert_eq!(t.fw.evaluate(&tcp(CLIENT, SERVER, syn())), Verdict::Deny);
    assert_eq!(t.fw.state_count(), 0);

    assert_eq!(t.fw.delete_rule(100), Err(ControlError::RuleNotFound(100)));
    assert_eq!(
        t.fw.delete_rule(DEFAULT_RULENUM),
        Err(ControlError::DefaultRule)
    );
}

#[test]
fn skipto_missing_target_continues_past_it() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(10, Cmd::Skipto(200)).finalize(),
        RuleBuilder::new(100, Cmd::Deny).finalize(),
        RuleBuilder::new(300, Cmd::Accept).finalize(),
    ]);

    assert_eq!(t.fw.evaluate(&udp(CLIENT, SERVER)), Verdict::Accept);
    assert_eq!(t.counters(10).0, 1);
    assert_eq!(t.counters(100).0, 0);
    assert_eq!(t.counters(300).0, 1);

    // Nothing past the target but the default rule.
    t.fw.delete_rule(300).unwrap();
    assert_eq!(t.fw.evaluate(&udp(CLIENT, SERVER)), Verdict::Deny);
}

#[test]
fn probability_extremes() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(100, Cmd::Accept).add_match(Cmd::Prob(0)).finalize(),
    ]);

    let pkt = udp(CLIENT, SERVER);
    for i in 0..10_000u32 {
        t.rand.set(i.wrapping_mul(429_497));
        assert_eq!(t.fw.evaluate(&pkt), Verdict::Deny);
    }

    t.fw.flush();
    t.add_rules(&[RuleBuilder::new(100, Cmd::Accept)
        .add_match(Cmd::Prob(u32::MAX))
        .finalize()]);
    for i in 0..10_000u32 {
        t.rand.set(u32::MAX - i);
        assert_eq!(t.fw.evaluate(&pkt), Verdict::Accept);
    }
}

#[test]
fn forward_only_in_the_creating_direction() {
    let t = TestFw::new();
    let fwd_to = ip("10.0.0.9");
    t.add_rules(&[
        RuleBuilder::new(50, Cmd::CheckState).finalize(),
        RuleBuilder::new(
            100,
            Cmd::ForwardIp { addr: fwd_to.into(), port: 8080 },
        )
        .add_match(Cmd::Proto(IPPROTO_TCP))
        .add_match(dst_port(80))
        .keep_state()
        .finalize(),
    ]);

    let expect = Verdict::ForwardTo { addr: fwd_to, port: 8080 };
    assert_eq!(t.fw.evaluate(&tcp(CLIENT, SERVER, syn())), expect);

    // Same direction, now through the dynamic entry.
    let again = tcp(CLIENT, SERVER, TcpFlags::ACK);
    assert_eq!(t.fw.evaluate(&again), expect);

    // The reply must not be forwarded back to the forward target.
    let reply = tcp(SERVER, CLIENT, syn_ack());
    assert_eq!(t.fw.evaluate(&reply), Verdict::Accept);
}

#[test]
fn rules_round_trip_through_snapshot() {
    let t = TestFw::new();
    let rule = RuleBuilder::new(1200, Cmd::Deny)
        .set(7)
        .add_match(Cmd::Proto(IPPROTO_UDP))
        .add_match(src_ip("192.168.1.10"))
        .add_match(Cmd::DstPort(vec![
            PortRange::single(53),
            PortRange::new(5353, 5360),
        ]))
        .log(10)
        .finalize();
    t.add_rules(&[rule.clone()]);

    let snap = t.fw.get_rules_snapshot();
    let dumped = snap
        .rules
        .iter()
        .find(|r| r.rule.rulenum == 1200)
        .expect("rule present");
    assert_eq!(dumped.rule, rule);
    assert_eq!(dumped.rule.insns().unwrap(), rule.insns().unwrap());

    let last = snap.rules.last().expect("default rule");
    assert!(last.is_default());
    assert_eq!(last.rule.set, DEFAULT_SET);
}

#[test]
fn automatic_rule_numbers() {
    let t = TestFw::new();
    let add = |n| {
        let rule = RuleBuilder::new(n, Cmd::Count).finalize();
        let bytes = rule.to_bytes().unwrap();
        t.fw.add_rule(&bytes).unwrap().rulenum
    };

    assert_eq!(add(0), 100);
    assert_eq!(add(150), 150);
    assert_eq!(add(0), 250);

    let nums = t
        .fw
        .get_rules_snapshot()
        .rules
        .iter()
        .map(|r| r.rule.rulenum)
        .collect_vec();
    assert_eq!(nums, [100, 150, 250, DEFAULT_RULENUM]);
}

#[test]
fn malformed_rule_is_refused_without_side_effects() {
    let t = TestFw::new();
    let generation = t.fw.chain_generation();

    // An action that is not last.
    let mut rule = RuleBuilder::new(100, Cmd::Accept).finalize();
    rule.cmd.extend_from_slice(&rule.cmd.clone());
    let res = t.fw.add_rule(&rule.to_bytes().unwrap());
    assert!(matches!(res, Err(ControlError::Validation(_))));

    let rule = RuleBuilder::new(DEFAULT_RULENUM, Cmd::Accept).finalize();
    let res = t.fw.add_rule_ioc(&rule);
    assert!(matches!(res, Err(ControlError::Validation(_))));

    assert_eq!(t.fw.rule_count(), 1);
    assert_eq!(t.fw.chain_generation(), generation);
}

#[test]
fn disabled_set_is_skipped_and_stops_creating_state() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(50, Cmd::CheckState).finalize(),
        RuleBuilder::new(100, Cmd::Accept)
            .set(3)
            .add_match(Cmd::Proto(IPPROTO_TCP))
            .keep_state()
            .finalize(),
    ]);

    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));
    assert_eq!(t.fw.state_count(), 1);

    t.fw.set_enable(1 << 3, 0).unwrap();
    assert_eq!(t.fw.state_count(), 0);
    assert_eq!(t.fw.evaluate(&tcp(CLIENT, SERVER, syn())), Verdict::Deny);
    assert_eq!(t.fw.get_rules_snapshot().set_disable, 1 << 3);

    t.fw.set_enable(0, 1 << 3).unwrap();
    assert_eq!(t.fw.evaluate(&tcp(CLIENT, SERVER, syn())), Verdict::Accept);
    assert_eq!(t.fw.state_count(), 1);

    // Enabling wins over disabling.
    t.fw.set_enable(1 << 3, 1 << 3).unwrap();
    assert_eq!(t.fw.set_disable_mask(), 0);

    assert_eq!(
        t.fw.set_enable(1 << DEFAULT_SET, 0),
        Err(ControlError::InvalidSet(DEFAULT_SET))
    );
}

#[test]
fn set_moves_and_swaps() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(100, Cmd::Deny).set(1).finalize(),
        RuleBuilder::new(200, Cmd::Accept).set(2).finalize(),
    ]);
    let pkt = udp(CLIENT, SERVER);

    t.fw.set_enable(1 << 4, 0).unwrap();
    assert_eq!(t.fw.evaluate(&pkt), Verdict::Deny);

    // Park the deny rule in the disabled set.
    assert_eq!(t.fw.move_rule(100, 4), Ok(1));
    assert_eq!(t.fw.evaluate(&pkt), Verdict::Accept);

    // Swap it back into play.
    t.fw.swap_sets(4, 2).unwrap();
    assert_eq!(t.fw.evaluate(&pkt), Verdict::Deny);

    let sets = t
        .fw
        .get_rules_snapshot()
        .rules
        .iter()
        .map(|r| (r.rule.rulenum, r.rule.set))
        .collect_vec();
    assert_eq!(sets, [(100, 2), (200, 4), (DEFAULT_RULENUM, DEFAULT_SET)]);

    assert_eq!(t.fw.move_set(2, 9), Ok(1));
    assert_eq!(t.fw.delete_set(9), Ok(1));
    assert_eq!(t.fw.evaluate(&pkt), Verdict::Deny);

    assert_eq!(t.fw.move_rule(200, 31), Err(ControlError::InvalidSet(31)));
    assert_eq!(t.fw.delete_set(40), Err(ControlError::InvalidSet(40)));
}

#[test]
fn moving_stateful_rule_into_disabled_set_flushes_its_state() {
    let t = TestFw::new();
    web_rules(&t);
    t.fw.set_enable(1 << 5, 0).unwrap();

    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));
    assert_eq!(t.fw.state_count(), 1);

    t.fw.move_rule(100, 5).unwrap();
    assert_eq!(t.fw.state_count(), 0);

    // Back to an enabled set, state creation resumes.
    t.fw.move_set(5, 0).unwrap();
    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));
    assert_eq!(t.fw.state_count(), 1);
}

#[test]
fn zero_counters() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(100, Cmd::Count).finalize(),
        RuleBuilder::new(200, Cmd::Accept).finalize(),
    ]);

    for _ in 0..3 {
        t.fw.evaluate(&udp(CLIENT, SERVER));
    }
    assert_eq!(t.counters(100), (3, 144));
    assert_eq!(t.counters(200), (3, 144));

    t.fw.zero_counters(Some(100), false).unwrap();
    assert_eq!(t.counters(100), (0, 0));
    assert_eq!(t.counters(200), (3, 144));

    // Log-only leaves accounting alone.
    t.fw.zero_counters(None, true).unwrap();
    assert_eq!(t.counters(200), (3, 144));

    t.fw.zero_counters(None, false).unwrap();
    assert_eq!(t.counters(200), (0, 0));

    assert_eq!(
        t.fw.zero_counters(Some(999), false),
        Err(ControlError::RuleNotFound(999))
    );
}

#[test]
fn keepalive_probes_established_flow_nearing_expiry() {
    let t = TestFw::new();
    web_rules(&t);

    t.fw.evaluate(&tcp_seq(CLIENT, SERVER, syn(), 1000, 0));
    t.fw.evaluate(&tcp_seq(SERVER, CLIENT, syn_ack(), 5000, 1001));
    t.fw.evaluate(&tcp_seq(CLIENT, SERVER, TcpFlags::ACK, 1001, 5001));

    // Far from expiry, nothing to do.
    assert_eq!(t.fw.tick().probed, 0);
    assert!(t.io.is_empty());

    let cfg = t.fw.config();
    let lead = u64::from(cfg.dyn_ack_lifetime - cfg.dyn_keepalive_interval);
    t.advance(lead + 1);
    assert_eq!(t.fw.tick().probed, 1);

    let events = t.io.take();
    let client_flow = tcp(CLIENT, SERVER, syn()).flow_id;
    match events.as_slice() {
        [
            IoEvent::Probe { flow: f1, seq: s1, ack: a1, flags: fl1 },
            IoEvent::Probe { flow: f2, seq: s2, ack: a2, .. },
        ] => {
            assert_eq!(*f1, client_flow);
            assert_eq!((*s1, *a1), (1000, 5001));
            assert_eq!(*fl1, TcpFlags::ACK);
            assert_eq!(*f2, client_flow.reversed());
            assert_eq!((*s2, *a2), (5000, 1001));
        }
        other => panic!("unexpected events {other:?}"),
    }

    // Not again until a keepalive period has passed.
    assert_eq!(t.fw.tick().probed, 0);
    t.advance(u64::from(cfg.dyn_keepalive_period));
    assert_eq!(t.fw.tick().probed, 1);
}

#[test]
fn shaper_and_divert_resume_after_rule() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(100, Cmd::Pipe(3)).finalize(),
        RuleBuilder::new(200, Cmd::Divert(8668)).finalize(),
        RuleBuilder::new(300, Cmd::Accept).finalize(),
    ]);

    let pkt = udp(CLIENT, SERVER);
    assert_eq!(t.fw.process(&pkt), Verdict::ToShaper { id: 3, is_pipe: true });
    let token = match t.io.take().as_slice() {
        [IoEvent::Shaper { id: 3, is_pipe: true, token, .. }] => token.clone(),
        other => panic!("unexpected events {other:?}"),
    };
    assert_eq!(token.rulenum(), 100);

    assert_eq!(
        t.fw.process_resumed(&pkt, &token),
        Verdict::Divert { port: 8668 }
    );
    let token = match t.io.take().as_slice() {
        [IoEvent::Divert { port: 8668, tee: false, token, .. }] => {
            token.clone()
        }
        other => panic!("unexpected events {other:?}"),
    };
    assert_eq!(t.fw.process_resumed(&pkt, &token), Verdict::Accept);

    // The rule that parked the packet is gone by the time it returns.
    t.fw.delete_rule(200).unwrap();
    assert_eq!(t.fw.process_resumed(&pkt, &token), Verdict::Deny);
}

#[test]
fn one_pass_accepts_returning_packets() {
    let cfg = FwConfig { one_pass: true, ..Default::default() };
    let t = TestFw::with_config(cfg);
    t.add_rules(&[RuleBuilder::new(100, Cmd::Queue(1)).finalize()]);

    let pkt = udp(CLIENT, SERVER);
    assert_eq!(t.fw.process(&pkt), Verdict::ToShaper { id: 1, is_pipe: false });
    let token = match t.io.take().as_slice() {
        [IoEvent::Shaper { token, .. }] => token.clone(),
        other => panic!("unexpected events {other:?}"),
    };
    assert_eq!(t.fw.process_resumed(&pkt, &token), Verdict::Accept);
}

#[test]
fn reject_answers_tcp_with_reset() {
    let t = TestFw::new();
    t.add_rules(&[
        RuleBuilder::new(100, Cmd::Reject(ipfw::api::ICMP_REJECT_RST))
            .add_match(Cmd::Proto(IPPROTO_TCP))
            .finalize(),
    ]);

    let code = ipfw::api::ICMP_REJECT_RST;
    assert_eq!(
        t.fw.evaluate(&tcp(CLIENT, SERVER, syn())),
        Verdict::Reject { code }
    );
    assert_eq!(t.io.len(), 1);

    // Never answer a reset with a reset.
    let rst = tcp(CLIENT, SERVER, TcpFlags::RST);
    assert_eq!(t.fw.evaluate(&rst), Verdict::Deny);
    assert_eq!(t.io.len(), 1);
}

#[test]
fn state_table_capacity_denies_new_flows() {
    let cfg = FwConfig { dyn_max: 2, ..Default::default() };
    let t = TestFw::with_config(cfg);
    t.add_rules(&[RuleBuilder::new(100, Cmd::Accept).keep_state().finalize()]);

    let flows = ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"];
    let verdicts = flows
        .iter()
        .map(|src| t.fw.evaluate(&udp(src, SERVER)))
        .collect_vec();
    assert_eq!(verdicts, [Verdict::Accept, Verdict::Accept, Verdict::Deny]);
    assert_eq!(t.fw.state_count(), 2);

    // Once the older entries expire there is room again.
    t.advance(u64::from(t.fw.config().dyn_udp_lifetime) + 1);
    assert_eq!(t.fw.evaluate(&udp(flows[2], SERVER)), Verdict::Accept);
    assert_eq!(t.fw.state_count(), 1);
    assert_eq!(t.log.count(LogLevel::Error, "ipfw"), 0);
}

#[test]
fn flush_keeps_default_rule() {
    let t = TestFw::new();
    web_rules(&t);
    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));

    assert_eq!(t.fw.flush(), 2);
    assert_eq!(t.fw.rule_count(), 1);
    assert_eq!(t.fw.state_count(), 0);

    // Flushing states alone.
    web_rules(&t);
    t.fw.evaluate(&tcp(CLIENT, SERVER, syn()));
    assert_eq!(t.fw.flush_states(), 1);
    assert_eq!(t.fw.rule_count(), 3);
}

#[test]
fn timers_run_in_background() {
    let cfg = FwConfig {
        dyn_keepalive_period: 2,
        dyn_fin_lifetime: 1,
        dyn_rst_lifetime: 1,
        ..Default::default()
    };
    let t = TestFw::with_config(cfg);
    t.add_rules(&[RuleBuilder::new(100, Cmd::Accept).keep_state().finalize()]);
    t.fw.evaluate(&udp(CLIENT, SERVER));
    t.advance(60);

    let timers = t.fw.start_timers();
    let deadline = Instant::now() + Duration::from_secs(10);
    while t.fw.state_count() != 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(timers);
    assert_eq!(t.fw.state_count(), 0);
}
