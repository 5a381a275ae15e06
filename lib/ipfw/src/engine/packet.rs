// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The already-parsed view of a packet the engine classifies, and the
//! verdict it hands back.

use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use ipfw_api::Direction;
use ipfw_api::FlowId;
use ipfw_api::IPPROTO_ICMP;
use ipfw_api::IPPROTO_TCP;
use ipfw_api::IPPROTO_UDP;
use ipfw_api::IpOpts;
use ipfw_api::TcpFlags;
use ipfw_api::TcpOpts;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub win: u16,
    pub flags: TcpFlags,
    pub opts: TcpOpts,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Iface {
    pub name: String,
    pub addrs: Vec<u32>,
}

impl Iface {
    pub fn new(name: &str, addrs: &[Ipv4Addr]) -> Self {
        Self {
            name: name.to_string(),
            addrs: addrs.iter().map(|a| u32::from(*a)).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EtherHdr {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: u16,
}

/// Everything the engine may look at when classifying a packet.
///
/// Header parsing happens before the engine is called; this is the
/// result. `tcp` is only populated for the first fragment of a TCP
/// datagram and `icmp_type` for the first fragment of an ICMP one.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PacketDescriptor {
    pub flow_id: FlowId,
    pub dir: Direction,
    /// Seen at the link layer rather than the IP layer.
    #[serde(default)]
    pub layer2: bool,
    pub ip_len: u16,
    #[serde(default = "default_ip_ver")]
    pub ip_ver: u8,
    #[serde(default = "default_ip_ttl")]
    pub ip_ttl: u8,
    #[serde(default)]
    pub ip_id: u16,
    #[serde(default)]
    pub ip_tos: u8,
    #[serde(default)]
    pub ip_opts: IpOpts,
    /// Fragment offset in 8-byte units; zero for the first fragment.
    #[serde(default)]
    pub frag_offset: u16,
    #[serde(default)]
    pub tcp: Option<TcpInfo>,
    #[serde(default)]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub recv_if: Option<Iface>,
    #[serde(default)]
    pub xmit_if: Option<Iface>,
    #[serde(default)]
    pub ether: Option<EtherHdr>,
    /// Link-layer broadcast or multicast, or an IP multicast or
    /// broadcast destination.
    #[serde(default)]
    pub bcast_or_mcast: bool,
    #[serde(default)]
    pub src_is_local: bool,
    #[serde(default)]
    pub dst_is_local: bool,
    /// Built by the engine's own collaborators (a keepalive or reset);
    /// never filtered.
    #[serde(default)]
    pub generated: bool,
    /// Set on a packet coming back from a divert socket: the number of
    /// the rule that diverted it.
    #[serde(default)]
    pub divert_tag: Option<u16>,
}

fn default_ip_ver() -> u8 {
    4
}

fn default_ip_ttl() -> u8 {
    64
}

impl PacketDescriptor {
    pub fn new(flow_id: FlowId, dir: Direction, ip_len: u16) -> Self {
        Self {
            flow_id,
            dir,
            layer2: false,
            ip_len,
            ip_ver: default_ip_ver(),
            ip_ttl: default_ip_ttl(),
            ip_id: 0,
            ip_tos: 0,
            ip_opts: IpOpts::empty(),
            frag_offset: 0,
            tcp: None,
            icmp_type: None,
            recv_if: None,
            xmit_if: None,
            ether: None,
            bcast_or_mcast: false,
            src_is_local: false,
            dst_is_local: false,
            generated: false,
            divert_tag: None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.flow_id.proto == IPPROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.flow_id.proto == IPPROTO_UDP
    }

    pub fn is_icmp(&self) -> bool {
        self.flow_id.proto == IPPROTO_ICMP
    }

    /// Are the transport header fields (ports, TCP flags, ICMP type)
    /// available?
    pub fn has_ulp(&self) -> bool {
        self.frag_offset == 0
    }

    pub fn tcp_flags(&self) -> TcpFlags {
        self.tcp.map(|t| t.flags).unwrap_or_default()
    }
}

/// The engine's decision for one packet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Verdict {
    Accept,
    Deny,
    /// Dropped, and a reset or unreachable was sent back.
    Reject { code: u16 },
    Divert { port: u16 },
    Tee { port: u16 },
    ToShaper { id: u16, is_pipe: bool },
    ForwardTo { addr: Ipv4Addr, port: u16 },
}

impl Verdict {
    /// Does the packet continue on its way (possibly elsewhere)?
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Accept | Self::Tee { .. } | Self::ForwardTo { .. })
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "Accept"),
            Self::Deny => write!(f, "Deny"),
            Self::Reject { code } => write!(f, "Reject({code:#x})"),
            Self::Divert { port } => write!(f, "Divert({port})"),
            Self::Tee { port } => write!(f, "Tee({port})"),
            Self::ToShaper { id, is_pipe: true } => write!(f, "Pipe({id})"),
            Self::ToShaper { id, is_pipe: false } => write!(f, "Queue({id})"),
            Self::ForwardTo { addr, port } => {
                write!(f, "Forward({addr}:{port})")
            }
        }
    }
}
