// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use serde::Deserialize;
use serde::Serialize;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// The 5-tuple identifying a flow, in host byte order.
///
/// A `FlowId` is direction-agnostic as far as the dynamic state table
/// is concerned: an entry keyed by `a -> b` also matches `b -> a`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct FlowId {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub flags: u8,
}

impl FlowId {
    pub fn new(
        proto: u8,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self {
            src_ip: src_ip.into(),
            dst_ip: dst_ip.into(),
            src_port,
            dst_port,
            proto,
            flags: 0,
        }
    }

    /// The same flow seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
            flags: self.flags,
        }
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }

    /// Does `other` name the same flow as `self` in either orientation?
    /// Returns `Some(true)` for the same orientation and `Some(false)`
    /// for the reverse one.
    pub fn orientation(&self, other: &FlowId) -> Option<bool> {
        if self.proto != other.proto {
            return None;
        }

        if self.src_ip == other.src_ip
            && self.dst_ip == other.dst_ip
            && self.src_port == other.src_port
            && self.dst_port == other.dst_port
        {
            return Some(true);
        }

        if self.src_ip == other.dst_ip
            && self.dst_ip == other.src_ip
            && self.src_port == other.dst_port
            && self.dst_port == other.src_port
        {
            return Some(false);
        }

        None
    }
}

pub fn proto_name(proto: u8) -> &'static str {
    match proto {
        IPPROTO_ICMP => "ICMP",
        IPPROTO_TCP => "TCP",
        IPPROTO_UDP => "UDP",
        _ => "IP",
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            proto_name(self.proto),
            self.src_addr(),
            self.src_port,
            self.dst_addr(),
            self.dst_port,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn orientation_is_symmetric() {
        let a = FlowId::new(
            IPPROTO_TCP,
            "10.0.0.1".parse().unwrap(),
            33000,
            "10.0.0.2".parse().unwrap(),
            80,
        );
        let b = a.reversed();

        assert_eq!(a.orientation(&a), Some(true));
        assert_eq!(a.orientation(&b), Some(false));
        assert_eq!(b.orientation(&a), Some(false));

        let mut c = a;
        c.proto = IPPROTO_UDP;
        assert_eq!(a.orientation(&c), None);
    }

    #[test]
    fn display() {
        let a = FlowId::new(
            IPPROTO_UDP,
            "192.168.1.5".parse().unwrap(),
            5353,
            "224.0.0.251".parse().unwrap(),
            5353,
        );
        assert_eq!(a.to_string(), "UDP:192.168.1.5:5353:224.0.0.251:5353");
    }
}
