// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

// Let's make our lives easier and pub use a bunch of stuff.
pub use ipfw::ControlError;
pub use ipfw::Firewall;
pub use ipfw::FwConfig;
pub use ipfw::PacketDescriptor;
pub use ipfw::ResumeToken;
pub use ipfw::Verdict;
pub use ipfw::api::Cmd;
pub use ipfw::api::DEFAULT_RULENUM;
pub use ipfw::api::DEFAULT_SET;
pub use ipfw::api::Direction::*;
pub use ipfw::api::DynType;
pub use ipfw::api::FlowId;
pub use ipfw::api::IPPROTO_ICMP;
pub use ipfw::api::IPPROTO_TCP;
pub use ipfw::api::IPPROTO_UDP;
pub use ipfw::api::IocRule;
pub use ipfw::api::LimitMask;
pub use ipfw::api::PortRange;
pub use ipfw::api::RuleBuilder;
pub use ipfw::api::TcpFlags;
pub use ipfw::ddi::time::Moment;
pub use ipfw::engine::packet::Iface;
pub use ipfw::engine::packet::TcpInfo;
pub use ipfw::provider::FixedRandom;
pub use ipfw::provider::IoEvent;
pub use ipfw::provider::LogLevel;
pub use ipfw::provider::ManualClock;
pub use ipfw::provider::Providers;
pub use ipfw::provider::RecordingIo;
pub use ipfw::provider::RecordingLog;
pub use std::net::Ipv4Addr;

/// A firewall wired to providers the test controls.
pub struct TestFw {
    pub fw: Arc<Firewall>,
    pub clock: Arc<ManualClock>,
    pub rand: Arc<FixedRandom>,
    pub io: Arc<RecordingIo>,
    pub log: RecordingLog,
}

impl TestFw {
    pub fn new() -> Self {
        Self::with_config(FwConfig::default())
    }

    pub fn with_config(cfg: FwConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Moment::from_secs(1_000)));
        let rand = Arc::new(FixedRandom::new(0x5eed));
        let io = Arc::new(RecordingIo::default());
        let log = RecordingLog::default();

        let providers = Providers {
            log: Box::new(log.clone()),
            clock: clock.clone(),
            rand: Box::new(rand.clone()),
            io: io.clone(),
        };

        let fw = Firewall::new("test", cfg, providers)
            .expect("test configuration is valid");
        Self { fw: Arc::new(fw), clock, rand, io, log }
    }

    /// Add every rule, panicking on the first one refused.
    pub fn add_rules(&self, rules: &[IocRule]) {
        for rule in rules {
            let bytes = rule.to_bytes().expect("rule encodes");
            self.fw.add_rule(&bytes).expect("rule accepted");
        }
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// The number of live dynamic entries created by `rulenum`.
    pub fn states_of(&self, rulenum: u16) -> usize {
        self.fw
            .get_dynamic_snapshot()
            .states
            .iter()
            .filter(|s| s.rulenum == rulenum)
            .count()
    }

    /// Packet and byte counts of the first rule numbered `rulenum`.
    pub fn counters(&self, rulenum: u16) -> (u64, u64) {
        self.fw
            .get_rules_snapshot()
            .rules
            .iter()
            .find(|r| r.rule.rulenum == rulenum)
            .map(|r| (r.pkt_cnt, r.byte_cnt))
            .unwrap_or_else(|| panic!("no rule {rulenum}"))
    }
}

impl Default for TestFw {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap_or_else(|_| panic!("bad address {s}"))
}

/// Split `"a.b.c.d:port"`.
fn endpoint(s: &str) -> (Ipv4Addr, u16) {
    let (addr, port) =
        s.split_once(':').unwrap_or_else(|| panic!("bad endpoint {s}"));
    (ip(addr), port.parse().unwrap_or_else(|_| panic!("bad port {s}")))
}

/// A TCP segment from `src` to `dst`, both `"a.b.c.d:port"`.
pub fn tcp(src: &str, dst: &str, flags: TcpFlags) -> PacketDescriptor {
    let ((sip, sport), (dip, dport)) = (endpoint(src), endpoint(dst));
    let flow = FlowId::new(IPPROTO_TCP, sip, sport, dip, dport);
    let mut pkt = PacketDescriptor::new(flow, In, 60);
    pkt.tcp = Some(TcpInfo {
        seq: 1_000,
        ack: 0,
        win: 65535,
        flags,
        ..Default::default()
    });
    pkt
}

/// A TCP segment with explicit sequence numbers.
pub fn tcp_seq(
    src: &str,
    dst: &str,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
) -> PacketDescriptor {
    let mut pkt = tcp(src, dst, flags);
    if let Some(t) = pkt.tcp.as_mut() {
        t.seq = seq;
        t.ack = ack;
    }
    pkt
}

pub fn udp(src: &str, dst: &str) -> PacketDescriptor {
    let ((sip, sport), (dip, dport)) = (endpoint(src), endpoint(dst));
    let flow = FlowId::new(IPPROTO_UDP, sip, sport, dip, dport);
    PacketDescriptor::new(flow, In, 48)
}

pub fn icmp(src: &str, dst: &str, icmp_type: u8) -> PacketDescriptor {
    let flow = FlowId::new(IPPROTO_ICMP, ip(src), 0, ip(dst), 0);
    let mut pkt = PacketDescriptor::new(flow, In, 84);
    pkt.icmp_type = Some(icmp_type);
    pkt
}

/// `Cmd::DstPort` for a single port.
pub fn dst_port(port: u16) -> Cmd {
    Cmd::DstPort(vec![PortRange::single(port)])
}

pub fn src_ip(s: &str) -> Cmd {
    Cmd::SrcIp(ip(s).into())
}
