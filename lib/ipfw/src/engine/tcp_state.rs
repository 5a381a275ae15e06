// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Lifetime tracking for dynamic TCP state.
//!
//! Only coarse state is kept: which of SYN, FIN and RST each direction
//! has sent, plus the highest ACK seen per direction so that keepalives
//! can be built. The resulting state only picks the lifetime of the
//! entry.

use super::packet::TcpInfo;
use crate::ddi::time::Ttl;
use core::fmt;
use core::fmt::Display;
use ipfw_api::TcpFlags;

/// The flags folded into the tracked state.
const TRACKED: TcpFlags =
    TcpFlags::FIN.union(TcpFlags::SYN).union(TcpFlags::RST);

const SYN: u16 = TcpFlags::SYN.bits() as u16;
const FIN: u16 = TcpFlags::FIN.bits() as u16;
pub const BOTH_SYN: u16 = SYN | (SYN << 8);
pub const BOTH_FIN: u16 = FIN | (FIN << 8);

/// Lifetimes of dynamic entries, by protocol and TCP phase.
#[derive(Clone, Copy, Debug)]
pub struct Lifetimes {
    pub ack: Ttl,
    pub syn: Ttl,
    pub fin: Ttl,
    pub rst: Ttl,
    pub udp: Ttl,
    pub short: Ttl,
}

/// `a >= b` in TCP sequence space.
fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// The tracked TCP state of one dynamic entry. The low byte of
/// `state` holds the flags seen in the forward direction, the high
/// byte those seen in the reverse direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TcpTrack {
    pub state: u16,
    pub ack_fwd: u32,
    pub ack_rev: u32,
}

impl TcpTrack {
    /// Both ends have sent a SYN.
    pub fn is_established(&self) -> bool {
        self.state & BOTH_SYN == BOTH_SYN
    }

    /// Fold in one segment travelling forward (`fwd`) or in reverse
    /// and return the lifetime the entry now deserves. `None` means an
    /// out-of-order ACK was seen and the expiry must not be refreshed.
    pub fn update(
        &mut self,
        fwd: bool,
        tcp: Option<&TcpInfo>,
        lt: &Lifetimes,
    ) -> Option<Ttl> {
        let flags = tcp.map(|t| t.flags & TRACKED).unwrap_or_default();
        let flags = u16::from(flags.bits());
        self.state |= if fwd { flags } else { flags << 8 };

        let ttl = match self.state {
            SYN => lt.syn,
            s if s == SYN << 8 => lt.syn,

            s if s == BOTH_SYN
                || s == BOTH_SYN | FIN
                || s == BOTH_SYN | (FIN << 8) =>
            {
                if let Some(tcp) = tcp {
                    let last = if fwd {
                        &mut self.ack_fwd
                    } else {
                        &mut self.ack_rev
                    };
                    if *last == 0 || seq_ge(tcp.ack, *last) {
                        *last = tcp.ack;
                    } else {
                        return None;
                    }
                }
                lt.ack
            }

            s if s == BOTH_SYN | BOTH_FIN => lt.fin,

            _ => lt.rst,
        };

        Some(ttl)
    }
}

impl Display for TcpTrack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self.state {
            0 => "NONE",
            SYN => "SYN_SENT",
            s if s == SYN << 8 => "SYN_RCVD",
            s if s == BOTH_SYN => "ESTABLISHED",
            s if s == BOTH_SYN | FIN || s == BOTH_SYN | (FIN << 8) => {
                "CLOSING"
            }
            s if s == BOTH_SYN | BOTH_FIN => "CLOSED",
            _ => "RESET",
        };
        write!(f, "{s}")
    }
}
