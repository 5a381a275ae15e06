// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Match predicates: the instructions whose outcome depends only on
//! the packet (and, for `prob`, a coin flip).

use super::packet::Iface;
use super::packet::PacketDescriptor;
use crate::provider::RandomSource;
use ipfw_api::Cmd;
use ipfw_api::Direction;
use ipfw_api::IfaceMatch;
use ipfw_api::PortRange;
use ipfw_api::TcpFlags;

/// ICMP types that ask for an answer: echo, router solicitation,
/// timestamp, information and address mask requests.
const ICMP_QUERY_TYPES: u32 =
    (1 << 8) | (1 << 10) | (1 << 13) | (1 << 15) | (1 << 17);

pub fn is_icmp_query(pkt: &PacketDescriptor) -> bool {
    match pkt.icmp_type {
        Some(t) if t < 32 => ICMP_QUERY_TYPES & (1 << t) != 0,
        _ => false,
    }
}

/// All bits of `set` present and none of `clear`.
fn flags_match(bits: u8, set: u8, clear: u8) -> bool {
    bits & set == set && bits & clear == 0
}

fn ports_match(ranges: &[PortRange], port: u16) -> bool {
    ranges.iter().any(|r| r.contains(port))
}

/// Shell-style match supporting `*` and `?`.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p = pattern.as_bytes();
    let n = name.as_bytes();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == b'*')
}

fn iface_match(iface: Option<&Iface>, m: &IfaceMatch) -> bool {
    let Some(iface) = iface else {
        return false;
    };

    match m {
        IfaceMatch::Addr(addr) => iface.addrs.contains(addr),
        IfaceMatch::Name(name) => iface.name == *name,
        IfaceMatch::Glob(pat) => glob_match(pat, &iface.name),
    }
}

/// Evaluate a match instruction against the packet, ignoring its
/// `not` modifier.
pub fn is_match(
    cmd: &Cmd,
    pkt: &PacketDescriptor,
    rand: &dyn RandomSource,
) -> bool {
    let id = &pkt.flow_id;
    let is_ipv4 = pkt.ip_ver == 4;
    let tcp = pkt.tcp.filter(|_| pkt.is_tcp() && pkt.has_ulp());

    match cmd {
        Cmd::Nop => true,

        Cmd::Proto(proto) => id.proto == *proto,

        Cmd::SrcIp(addr) => is_ipv4 && id.src_ip == *addr,
        Cmd::DstIp(addr) => is_ipv4 && id.dst_ip == *addr,

        Cmd::SrcIpMask { addr, mask } => is_ipv4 && id.src_ip & mask == *addr,
        Cmd::DstIpMask { addr, mask } => is_ipv4 && id.dst_ip & mask == *addr,

        Cmd::SrcIpMe => is_ipv4 && pkt.src_is_local,
        Cmd::DstIpMe => is_ipv4 && pkt.dst_is_local,

        Cmd::SrcIpSet(set) => is_ipv4 && set.contains(id.src_ip),
        Cmd::DstIpSet(set) => is_ipv4 && set.contains(id.dst_ip),

        Cmd::SrcPort(ranges) | Cmd::DstPort(ranges) => {
            if !(pkt.is_tcp() || pkt.is_udp()) || !pkt.has_ulp() {
                return false;
            }
            let port = match cmd {
                Cmd::SrcPort(_) => id.src_port,
                _ => id.dst_port,
            };
            ports_match(ranges, port)
        }

        Cmd::MacAddr { addr, mask } => match &pkt.ether {
            Some(eth) => eth
                .dst
                .iter()
                .chain(eth.src.iter())
                .zip(addr.iter().zip(mask.iter()))
                .all(|(hdr, (want, mask))| hdr & mask == *want),
            None => false,
        },

        Cmd::MacType(ranges) => match &pkt.ether {
            Some(eth) => ports_match(ranges, eth.ether_type),
            None => false,
        },

        Cmd::Layer2 => pkt.layer2,
        Cmd::In => pkt.dir == Direction::In,
        Cmd::Frag => pkt.frag_offset != 0,

        Cmd::Recv(m) => iface_match(pkt.recv_if.as_ref(), m),
        Cmd::Xmit(m) => iface_match(pkt.xmit_if.as_ref(), m),
        Cmd::Via(m) => {
            iface_match(pkt.xmit_if.as_ref().or(pkt.recv_if.as_ref()), m)
        }

        Cmd::IpOpts { set, clear } => {
            is_ipv4 && flags_match(pkt.ip_opts.bits(), set.bits(), clear.bits())
        }
        Cmd::IpLen(len) => is_ipv4 && pkt.ip_len == *len,
        Cmd::IpId(ip_id) => is_ipv4 && pkt.ip_id == *ip_id,
        Cmd::IpTos { set, clear } => {
            is_ipv4 && flags_match(pkt.ip_tos, *set, *clear)
        }
        Cmd::IpPrecedence(prec) => is_ipv4 && pkt.ip_tos & 0xe0 == *prec,
        Cmd::IpTtl(ttl) => is_ipv4 && pkt.ip_ttl == *ttl,
        Cmd::IpVer(ver) => pkt.ip_ver == *ver,

        // A TCP segment of an established connection: anything but a
        // bare SYN.
        Cmd::Estab => tcp.is_some_and(|t| {
            t.flags.intersects(TcpFlags::RST | TcpFlags::ACK)
        }),
        Cmd::TcpFlags { set, clear } => tcp.is_some_and(|t| {
            flags_match(t.flags.bits(), set.bits(), clear.bits())
        }),
        Cmd::TcpOpts { set, clear } => tcp.is_some_and(|t| {
            flags_match(t.opts.bits(), set.bits(), clear.bits())
        }),
        Cmd::TcpWin(win) => tcp.is_some_and(|t| t.win == *win),
        Cmd::TcpSeq(seq) => tcp.is_some_and(|t| t.seq == *seq),
        Cmd::TcpAck(ack) => tcp.is_some_and(|t| t.ack == *ack),

        Cmd::IcmpTypes(types) => {
            if !pkt.is_icmp() || !pkt.has_ulp() {
                return false;
            }
            match pkt.icmp_type {
                Some(t) if t < 32 => types & (1 << t) != 0,
                _ => false,
            }
        }

        Cmd::Prob(p) => *p == u32::MAX || rand.random_u32() < *p,

        Cmd::Log { .. } => true,

        // Evaluated by the rule loop.
        Cmd::ProbeState
        | Cmd::KeepState
        | Cmd::Limit { .. }
        | Cmd::CheckState
        | Cmd::Accept
        | Cmd::Deny
        | Cmd::Reject(_)
        | Cmd::Count
        | Cmd::Skipto(_)
        | Cmd::Pipe(_)
        | Cmd::Queue(_)
        | Cmd::Divert(_)
        | Cmd::Tee(_)
        | Cmd::ForwardIp { .. } => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::packet::EtherHdr;
    use crate::engine::packet::TcpInfo;
    use crate::provider::FixedRandom;
    use core::net::Ipv4Addr;
    use ipfw_api::FlowId;
    use ipfw_api::IPPROTO_ICMP;
    use ipfw_api::IPPROTO_TCP;
    use ipfw_api::IPPROTO_UDP;

    fn pkt(proto: u8) -> PacketDescriptor {
        let id = FlowId::new(
            proto,
            Ipv4Addr::new(10, 0, 0, 1),
            1234,
            Ipv4Addr::new(192, 168, 1, 7),
            80,
        );
        PacketDescriptor::new(id, Direction::In, 60)
    }

    fn check(cmd: &Cmd, p: &PacketDescriptor) -> bool {
        is_match(cmd, p, &FixedRandom::new(0))
    }

    #[test]
    fn addresses_and_ports() {
        let p = pkt(IPPROTO_UDP);
        let net = u32::from(Ipv4Addr::new(192, 168, 1, 0));

        assert!(check(&Cmd::DstIpMask { addr: net, mask: 0xffff_ff00 }, &p));
        assert!(!check(&Cmd::SrcIpMask { addr: net, mask: 0xffff_ff00 }, &p));
        let web = vec![PortRange::new(1, 79), PortRange::single(80)];
        assert!(check(&Cmd::DstPort(web), &p));
        assert!(!check(&Cmd::DstPort(vec![PortRange::new(81, 79)]), &p));
        assert!(check(&Cmd::SrcPort(vec![PortRange::new(1234, 1234)]), &p));

        // Ports of a later fragment are unknown.
        let mut frag = p.clone();
        frag.frag_offset = 100;
        assert!(!check(&Cmd::DstPort(vec![PortRange::single(80)]), &frag));
        assert!(check(&Cmd::Frag, &frag));

        // And ICMP has none.
        let any = Cmd::DstPort(vec![PortRange::new(0, 65535)]);
        assert!(!check(&any, &pkt(IPPROTO_ICMP)));
    }

    #[test]
    fn tcp_flags() {
        let mut p = pkt(IPPROTO_TCP);
        let want_syn =
            Cmd::TcpFlags { set: TcpFlags::SYN, clear: TcpFlags::ACK };
        assert!(!check(&want_syn, &p));

        p.tcp = Some(TcpInfo { flags: TcpFlags::SYN, ..Default::default() });
        assert!(check(&want_syn, &p));
        assert!(!check(&Cmd::Estab, &p));

        p.tcp = Some(TcpInfo {
            flags: TcpFlags::SYN | TcpFlags::ACK,
            ..Default::default()
        });
        assert!(!check(&want_syn, &p));
        assert!(check(&Cmd::Estab, &p));
    }

    #[test]
    fn icmp_types() {
        let mut p = pkt(IPPROTO_ICMP);
        p.icmp_type = Some(8);
        assert!(check(&Cmd::IcmpTypes(1 << 8), &p));
        assert!(!check(&Cmd::IcmpTypes(1 << 0), &p));
        assert!(is_icmp_query(&p));

        p.icmp_type = Some(3);
        assert!(!is_icmp_query(&p));
    }

    #[test]
    fn interfaces() {
        let mut p = pkt(IPPROTO_TCP);
        assert!(!check(&Cmd::Recv(IfaceMatch::Name("em0".into())), &p));

        p.recv_if = Some(Iface::new("em0", &[Ipv4Addr::new(10, 0, 0, 254)]));
        assert!(check(&Cmd::Recv(IfaceMatch::Name("em0".into())), &p));
        assert!(check(&Cmd::Recv(IfaceMatch::Glob("em*".into())), &p));
        assert!(check(&Cmd::Via(IfaceMatch::Glob("e?0".into())), &p));
        assert!(!check(&Cmd::Xmit(IfaceMatch::Glob("*".into())), &p));
        assert!(check(
            &Cmd::Recv(IfaceMatch::Addr(Ipv4Addr::new(10, 0, 0, 254).into())),
            &p
        ));

        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b", "aXXc"));
        assert!(!glob_match("vlan?", "vlan10"));
    }

    #[test]
    fn mac_addresses() {
        let mut p = pkt(IPPROTO_UDP);
        let cmd = Cmd::MacAddr {
            addr: [0, 0, 0, 0, 0, 0, 0x02, 0x08, 0x20, 0, 0, 0],
            mask: [0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0, 0, 0],
        };
        assert!(!check(&cmd, &p));

        p.ether = Some(EtherHdr {
            dst: [0xff; 6],
            src: [0x02, 0x08, 0x20, 0x11, 0x22, 0x33],
            ether_type: 0x0800,
        });
        assert!(check(&cmd, &p));
        assert!(check(&Cmd::MacType(vec![PortRange::single(0x0800)]), &p));
    }

    #[test]
    fn probability_extremes() {
        let p = pkt(IPPROTO_TCP);
        let never = FixedRandom::new(0);
        let always = FixedRandom::new(u32::MAX);

        assert!(!is_match(&Cmd::Prob(0), &p, &never));
        assert!(is_match(&Cmd::Prob(u32::MAX), &p, &always));
        assert!(is_match(&Cmd::Prob(1), &p, &never));
        assert!(!is_match(&Cmd::Prob(u32::MAX - 1), &p, &always));
    }
}
