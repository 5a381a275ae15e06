// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The rule instruction set and its word encoding.
//!
//! A rule body is a sequence of variable-length instructions, each
//! made of one or more 32-bit words. The first word of every
//! instruction is laid out as:
//!
//! ```text
//!  31             16 15      8 7       0
//! +-----------------+---------+---------+
//! |      arg1       | N O len | opcode  |
//! +-----------------+---------+---------+
//! ```
//!
//! where `len` (6 bits) is the instruction length in words, including
//! the first one, `N` is [`InsnFlags::NOT`] and `O` is [`InsnFlags::OR`].
//! Any remaining words carry the opcode's payload.

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use serde::Deserialize;
use serde::Serialize;

pub const F_NOT: u8 = 0x80;
pub const F_OR: u8 = 0x40;
pub const F_LEN_MASK: u8 = 0x3f;

/// Reject code asking for a TCP RST rather than an ICMP unreachable.
pub const ICMP_REJECT_RST: u16 = 0x100;

/// ICMP unreachable code used when a rule says `reject` with no code.
pub const ICMP_UNREACH_HOST: u16 = 1;

/// Longest interface name an interface match can carry, in bytes.
pub const IFNAMSIZ: usize = 16;

/// Largest address set, in addresses.
pub const MAX_ADDR_SET: u16 = 256;

/// Largest port or ethertype range list, in words.
pub const MAX_RANGE_LIST_LEN: usize = 31;

bitflags! {
    /// Modifier bits carried next to the instruction length.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct InsnFlags: u8 {
        const NOT = F_NOT;
        const OR = F_OR;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PUSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

bitflags! {
    /// TCP options present in a segment.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct TcpOpts: u8 {
        const MSS = 0x01;
        const WINDOW = 0x02;
        const SACK = 0x04;
        const TS = 0x08;
        const CC = 0x10;
    }
}

bitflags! {
    /// IPv4 options present in a datagram.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct IpOpts: u8 {
        const SSRR = 0x01;
        const LSRR = 0x02;
        const RR = 0x04;
        const TS = 0x08;
    }
}

bitflags! {
    /// Which fields of the flow id make up a `limit` key.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct LimitMask: u8 {
        const SRC_ADDR = 0x01;
        const SRC_PORT = 0x02;
        const DST_ADDR = 0x04;
        const DST_PORT = 0x08;
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Proto = 1,
    IpSrc = 2,
    IpDst = 3,
    IpSrcMask = 4,
    IpDstMask = 5,
    IpSrcMe = 6,
    IpDstMe = 7,
    IpSrcSet = 8,
    IpDstSet = 9,
    IpSrcPort = 10,
    IpDstPort = 11,
    MacAddr2 = 12,
    MacType = 13,
    Layer2 = 14,
    In = 15,
    Frag = 16,
    Recv = 17,
    Xmit = 18,
    Via = 19,
    IpOpt = 20,
    IpLen = 21,
    IpId = 22,
    IpTos = 23,
    IpPrecedence = 24,
    IpTtl = 25,
    IpVer = 26,
    Estab = 27,
    TcpFlags = 28,
    TcpWin = 29,
    TcpSeq = 30,
    TcpAck = 31,
    IcmpType = 32,
    TcpOpts = 33,
    Prob = 34,
    ProbeState = 35,
    KeepState = 36,
    Limit = 37,
    Log = 38,
    CheckState = 40,
    Accept = 41,
    Deny = 42,
    Reject = 43,
    Count = 44,
    Skipto = 45,
    Pipe = 46,
    Queue = 47,
    Divert = 48,
    Tee = 49,
    ForwardIp = 50,
}

impl TryFrom<u8> for Opcode {
    type Error = InsnError;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        use Opcode::*;

        let op = match num {
            0 => Nop,
            1 => Proto,
            2 => IpSrc,
            3 => IpDst,
            4 => IpSrcMask,
            5 => IpDstMask,
            6 => IpSrcMe,
            7 => IpDstMe,
            8 => IpSrcSet,
            9 => IpDstSet,
            10 => IpSrcPort,
            11 => IpDstPort,
            12 => MacAddr2,
            13 => MacType,
            14 => Layer2,
            15 => In,
            16 => Frag,
            17 => Recv,
            18 => Xmit,
            19 => Via,
            20 => IpOpt,
            21 => IpLen,
            22 => IpId,
            23 => IpTos,
            24 => IpPrecedence,
            25 => IpTtl,
            26 => IpVer,
            27 => Estab,
            28 => Opcode::TcpFlags,
            29 => TcpWin,
            30 => TcpSeq,
            31 => TcpAck,
            32 => IcmpType,
            33 => Opcode::TcpOpts,
            34 => Prob,
            35 => ProbeState,
            36 => KeepState,
            37 => Limit,
            38 => Log,
            40 => CheckState,
            41 => Accept,
            42 => Deny,
            43 => Reject,
            44 => Count,
            45 => Skipto,
            46 => Pipe,
            47 => Queue,
            48 => Divert,
            49 => Tee,
            50 => ForwardIp,
            _ => return Err(InsnError::UnknownOpcode(num)),
        };

        Ok(op)
    }
}

impl Opcode {
    /// Is this one of the opcodes that must terminate a rule?
    pub fn is_action(&self) -> bool {
        use Opcode::*;

        matches!(
            self,
            CheckState
                | Accept
                | Deny
                | Reject
                | Count
                | Skipto
                | Pipe
                | Queue
                | Divert
                | Tee
                | ForwardIp
        )
    }

    /// The permitted instruction length range, in words.
    fn size_bounds(&self) -> (usize, usize) {
        use Opcode::*;

        match self {
            IpSrc | IpDst | TcpSeq | TcpAck | Prob | IcmpType | Limit
            | Log | ForwardIp => (2, 2),
            IpSrcMask | IpDstMask => (3, 3),
            IpSrcPort | IpDstPort | MacType => (2, MAX_RANGE_LIST_LEN),
            Recv | Xmit | Via => (IFACE_INSN_LEN, IFACE_INSN_LEN),
            MacAddr2 => (MAC_INSN_LEN, MAC_INSN_LEN),
            // Checked separately against arg1.
            IpSrcSet | IpDstSet => (2, F_LEN_MASK as usize),
            _ => (1, 1),
        }
    }
}

const IFACE_INSN_LEN: usize = 2 + IFNAMSIZ / 4;
const MAC_INSN_LEN: usize = 1 + 24 / 4;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self { lo, hi }
    }

    pub fn single(port: u16) -> Self {
        Self { lo: port, hi: port }
    }

    /// Both ends inclusive. A range with `lo > hi` contains nothing.
    pub fn contains(&self, val: u16) -> bool {
        self.lo <= val && val <= self.hi
    }
}

/// A bitmap over up to 256 consecutive addresses starting at `base`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddrSet {
    pub base: u32,
    pub size: u16,
    pub bitmap: Vec<u32>,
}

impl AddrSet {
    pub fn new(base: Ipv4Addr, size: u16) -> Self {
        let words = usize::from(size).div_ceil(32);
        Self { base: base.into(), size, bitmap: vec![0; words] }
    }

    pub fn insert(&mut self, addr: Ipv4Addr) {
        let d = u32::from(addr).wrapping_sub(self.base);
        if d < u32::from(self.size) {
            self.bitmap[(d / 32) as usize] |= 1 << (d & 0x1f);
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        let d = addr.wrapping_sub(self.base);
        d < u32::from(self.size)
            && self
                .bitmap
                .get((d / 32) as usize)
                .is_some_and(|w| w & (1 << (d & 0x1f)) != 0)
    }
}

/// How a `recv`/`xmit`/`via` instruction names the interface.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum IfaceMatch {
    Addr(u32),
    Name(String),
    Glob(String),
}

impl IfaceMatch {
    fn mode(&self) -> u16 {
        match self {
            Self::Addr(_) => 0,
            Self::Name(_) => 1,
            Self::Glob(_) => 2,
        }
    }
}

/// The body of an instruction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Cmd {
    Nop,
    Proto(u8),
    SrcIp(u32),
    DstIp(u32),
    SrcIpMask { addr: u32, mask: u32 },
    DstIpMask { addr: u32, mask: u32 },
    SrcIpMe,
    DstIpMe,
    SrcIpSet(AddrSet),
    DstIpSet(AddrSet),
    SrcPort(Vec<PortRange>),
    DstPort(Vec<PortRange>),
    /// Destination then source address, and a mask of the same shape.
    MacAddr { addr: [u8; 12], mask: [u8; 12] },
    MacType(Vec<PortRange>),
    Layer2,
    In,
    Frag,
    Recv(IfaceMatch),
    Xmit(IfaceMatch),
    Via(IfaceMatch),
    IpOpts { set: IpOpts, clear: IpOpts },
    IpLen(u16),
    IpId(u16),
    IpTos { set: u8, clear: u8 },
    IpPrecedence(u8),
    IpTtl(u8),
    IpVer(u8),
    Estab,
    TcpFlags { set: TcpFlags, clear: TcpFlags },
    TcpWin(u16),
    TcpSeq(u32),
    TcpAck(u32),
    /// Bit `n` set matches ICMP type `n`.
    IcmpTypes(u32),
    TcpOpts { set: TcpOpts, clear: TcpOpts },
    /// Match with probability `p / u32::MAX`.
    Prob(u32),
    ProbeState,
    KeepState,
    Limit { mask: LimitMask, conn_limit: u16 },
    /// A `max_log` of zero defers to the global verbosity limit.
    Log { max_log: u32 },
    CheckState,
    Accept,
    Deny,
    Reject(u16),
    Count,
    Skipto(u16),
    Pipe(u16),
    Queue(u16),
    Divert(u16),
    Tee(u16),
    ForwardIp { addr: u32, port: u16 },
}

impl Cmd {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Nop => Opcode::Nop,
            Self::Proto(_) => Opcode::Proto,
            Self::SrcIp(_) => Opcode::IpSrc,
            Self::DstIp(_) => Opcode::IpDst,
            Self::SrcIpMask { .. } => Opcode::IpSrcMask,
            Self::DstIpMask { .. } => Opcode::IpDstMask,
            Self::SrcIpMe => Opcode::IpSrcMe,
            Self::DstIpMe => Opcode::IpDstMe,
            Self::SrcIpSet(_) => Opcode::IpSrcSet,
            Self::DstIpSet(_) => Opcode::IpDstSet,
            Self::SrcPort(_) => Opcode::IpSrcPort,
            Self::DstPort(_) => Opcode::IpDstPort,
            Self::MacAddr { .. } => Opcode::MacAddr2,
            Self::MacType(_) => Opcode::MacType,
            Self::Layer2 => Opcode::Layer2,
            Self::In => Opcode::In,
            Self::Frag => Opcode::Frag,
            Self::Recv(_) => Opcode::Recv,
            Self::Xmit(_) => Opcode::Xmit,
            Self::Via(_) => Opcode::Via,
            Self::IpOpts { .. } => Opcode::IpOpt,
            Self::IpLen(_) => Opcode::IpLen,
            Self::IpId(_) => Opcode::IpId,
            Self::IpTos { .. } => Opcode::IpTos,
            Self::IpPrecedence(_) => Opcode::IpPrecedence,
            Self::IpTtl(_) => Opcode::IpTtl,
            Self::IpVer(_) => Opcode::IpVer,
            Self::Estab => Opcode::Estab,
            Self::TcpFlags { .. } => Opcode::TcpFlags,
            Self::TcpWin(_) => Opcode::TcpWin,
            Self::TcpSeq(_) => Opcode::TcpSeq,
            Self::TcpAck(_) => Opcode::TcpAck,
            Self::IcmpTypes(_) => Opcode::IcmpType,
            Self::TcpOpts { .. } => Opcode::TcpOpts,
            Self::Prob(_) => Opcode::Prob,
            Self::ProbeState => Opcode::ProbeState,
            Self::KeepState => Opcode::KeepState,
            Self::Limit { .. } => Opcode::Limit,
            Self::Log { .. } => Opcode::Log,
            Self::CheckState => Opcode::CheckState,
            Self::Accept => Opcode::Accept,
            Self::Deny => Opcode::Deny,
            Self::Reject(_) => Opcode::Reject,
            Self::Count => Opcode::Count,
            Self::Skipto(_) => Opcode::Skipto,
            Self::Pipe(_) => Opcode::Pipe,
            Self::Queue(_) => Opcode::Queue,
            Self::Divert(_) => Opcode::Divert,
            Self::Tee(_) => Opcode::Tee,
            Self::ForwardIp { .. } => Opcode::ForwardIp,
        }
    }

    pub fn is_action(&self) -> bool {
        self.opcode().is_action()
    }

    /// Does this instruction create dynamic state when it matches?
    pub fn creates_state(&self) -> bool {
        matches!(self, Self::KeepState | Self::Limit { .. })
    }
}

/// One decoded instruction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Insn {
    pub cmd: Cmd,
    #[serde(default)]
    pub flags: InsnFlags,
}

impl From<Cmd> for Insn {
    fn from(cmd: Cmd) -> Self {
        Self { cmd, flags: InsnFlags::empty() }
    }
}

impl Insn {
    pub fn new(cmd: Cmd) -> Self {
        cmd.into()
    }

    /// Invert the sense of this instruction.
    pub fn not(mut self) -> Self {
        self.flags |= InsnFlags::NOT;
        self
    }

    /// Join this instruction with the next one in an OR block.
    pub fn or(mut self) -> Self {
        self.flags |= InsnFlags::OR;
        self
    }

    pub fn is_not(&self) -> bool {
        self.flags.contains(InsnFlags::NOT)
    }

    pub fn is_or(&self) -> bool {
        self.flags.contains(InsnFlags::OR)
    }

    /// The encoded length in words.
    pub fn len(&self) -> usize {
        match &self.cmd {
            Cmd::SrcIpSet(set) | Cmd::DstIpSet(set) => {
                2 + usize::from(set.size).div_ceil(32)
            }
            Cmd::SrcPort(list) | Cmd::DstPort(list) | Cmd::MacType(list) => {
                1 + list.len()
            }
            _ => self.cmd.opcode().size_bounds().0,
        }
    }

    /// Append the word encoding of this instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u32>) {
        let op = self.cmd.opcode();
        let len = self.len();
        let word0 = |arg1: u16| {
            u32::from(op as u8)
                | (u32::from(self.flags.bits() | (len as u8 & F_LEN_MASK))
                    << 8)
                | (u32::from(arg1) << 16)
        };
        let flag_pair = |set: u8, clear: u8| u16::from_le_bytes([set, clear]);

        match &self.cmd {
            Cmd::Nop
            | Cmd::SrcIpMe
            | Cmd::DstIpMe
            | Cmd::Layer2
            | Cmd::In
            | Cmd::Frag
            | Cmd::Estab
            | Cmd::ProbeState
            | Cmd::KeepState
            | Cmd::CheckState
            | Cmd::Accept
            | Cmd::Deny
            | Cmd::Count => out.push(word0(0)),

            Cmd::Proto(v) | Cmd::IpPrecedence(v) | Cmd::IpTtl(v)
            | Cmd::IpVer(v) => out.push(word0(u16::from(*v))),

            Cmd::IpLen(v)
            | Cmd::IpId(v)
            | Cmd::TcpWin(v)
            | Cmd::Reject(v)
            | Cmd::Skipto(v)
            | Cmd::Pipe(v)
            | Cmd::Queue(v)
            | Cmd::Divert(v)
            | Cmd::Tee(v) => out.push(word0(*v)),

            Cmd::IpOpts { set, clear } => {
                out.push(word0(flag_pair(set.bits(), clear.bits())))
            }
            Cmd::IpTos { set, clear } => out.push(word0(flag_pair(*set, *clear))),
            Cmd::TcpFlags { set, clear } => {
                out.push(word0(flag_pair(set.bits(), clear.bits())))
            }
            Cmd::TcpOpts { set, clear } => {
                out.push(word0(flag_pair(set.bits(), clear.bits())))
            }

            Cmd::SrcIp(v)
            | Cmd::DstIp(v)
            | Cmd::TcpSeq(v)
            | Cmd::TcpAck(v)
            | Cmd::IcmpTypes(v)
            | Cmd::Prob(v)
            | Cmd::Log { max_log: v } => {
                out.push(word0(0));
                out.push(*v);
            }

            Cmd::Limit { mask, conn_limit } => {
                out.push(word0(0));
                out.push(u32::from(*conn_limit) | (u32::from(mask.bits()) << 16));
            }

            Cmd::ForwardIp { addr, port } => {
                out.push(word0(*port));
                out.push(*addr);
            }

            Cmd::SrcIpMask { addr, mask } | Cmd::DstIpMask { addr, mask } => {
                out.push(word0(0));
                out.push(*addr);
                out.push(*mask);
            }

            Cmd::SrcIpSet(set) | Cmd::DstIpSet(set) => {
                out.push(word0(set.size));
                out.push(set.base);
                let words = usize::from(set.size).div_ceil(32);
                for i in 0..words {
                    out.push(set.bitmap.get(i).copied().unwrap_or(0));
                }
            }

            Cmd::SrcPort(list) | Cmd::DstPort(list) | Cmd::MacType(list) => {
                out.push(word0(0));
                for r in list {
                    out.push(u32::from(r.lo) | (u32::from(r.hi) << 16));
                }
            }

            Cmd::Recv(im) | Cmd::Xmit(im) | Cmd::Via(im) => {
                out.push(word0(im.mode()));
                let mut name = [0u8; IFNAMSIZ];
                match im {
                    IfaceMatch::Addr(addr) => out.push(*addr),
                    IfaceMatch::Name(n) | IfaceMatch::Glob(n) => {
                        out.push(0);
                        let bytes = n.as_bytes();
                        let len = bytes.len().min(IFNAMSIZ);
                        name[..len].copy_from_slice(&bytes[..len]);
                    }
                }
                for chunk in name.chunks_exact(4) {
                    out.push(u32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]));
                }
            }

            Cmd::MacAddr { addr, mask } => {
                out.push(word0(0));
                let mut bytes = [0u8; 24];
                bytes[..12].copy_from_slice(addr);
                bytes[12..].copy_from_slice(mask);
                for chunk in bytes.chunks_exact(4) {
                    out.push(u32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]));
                }
            }
        }
    }

    /// Decode the instruction at the start of `buf`, returning it and
    /// the number of words it occupies.
    pub fn decode(buf: &[u32]) -> Result<(Self, usize), InsnError> {
        let Some(&w0) = buf.first() else {
            return Err(InsnError::Truncated { opcode: 0 });
        };

        let raw_op = (w0 & 0xff) as u8;
        let len_flags = ((w0 >> 8) & 0xff) as u8;
        let len = usize::from(len_flags & F_LEN_MASK);
        let flags = InsnFlags::from_bits_truncate(len_flags);
        let arg1 = (w0 >> 16) as u16;

        if len == 0 {
            return Err(InsnError::ZeroLength { opcode: raw_op });
        }

        if len > buf.len() {
            return Err(InsnError::Truncated { opcode: raw_op });
        }

        let opcode = Opcode::try_from(raw_op)?;
        let (min, max) = opcode.size_bounds();
        if len < min || len > max {
            return Err(InsnError::BadSize { opcode, len });
        }

        let d = &buf[1..len];
        let lo8 = arg1 as u8;
        let hi8 = (arg1 >> 8) as u8;

        let cmd = match opcode {
            Opcode::Nop => Cmd::Nop,
            Opcode::Proto => Cmd::Proto(lo8),
            Opcode::IpSrc => Cmd::SrcIp(d[0]),
            Opcode::IpDst => Cmd::DstIp(d[0]),
            Opcode::IpSrcMask | Opcode::IpDstMask => {
                let (addr, mask) = (d[0], d[1]);
                if mask == 0 {
                    return Err(InsnError::ZeroMask { opcode });
                }
                if opcode == Opcode::IpSrcMask {
                    Cmd::SrcIpMask { addr, mask }
                } else {
                    Cmd::DstIpMask { addr, mask }
                }
            }
            Opcode::IpSrcMe => Cmd::SrcIpMe,
            Opcode::IpDstMe => Cmd::DstIpMe,
            Opcode::IpSrcSet | Opcode::IpDstSet => {
                if arg1 == 0 || arg1 > MAX_ADDR_SET {
                    return Err(InsnError::BadSetSize { size: arg1 });
                }
                if len != 2 + usize::from(arg1).div_ceil(32) {
                    return Err(InsnError::BadSize { opcode, len });
                }
                let set = AddrSet {
                    base: d[0],
                    size: arg1,
                    bitmap: d[1..].to_vec(),
                };
                if opcode == Opcode::IpSrcSet {
                    Cmd::SrcIpSet(set)
                } else {
                    Cmd::DstIpSet(set)
                }
            }
            Opcode::IpSrcPort | Opcode::IpDstPort | Opcode::MacType => {
                let list: Vec<PortRange> = d
                    .iter()
                    .map(|w| PortRange::new(*w as u16, (*w >> 16) as u16))
                    .collect();
                match opcode {
                    Opcode::IpSrcPort => Cmd::SrcPort(list),
                    Opcode::IpDstPort => Cmd::DstPort(list),
                    _ => Cmd::MacType(list),
                }
            }
            Opcode::MacAddr2 => {
                let mut bytes = [0u8; 24];
                for (i, w) in d.iter().enumerate() {
                    bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
                }
                let mut addr = [0u8; 12];
                let mut mask = [0u8; 12];
                addr.copy_from_slice(&bytes[..12]);
                mask.copy_from_slice(&bytes[12..]);
                Cmd::MacAddr { addr, mask }
            }
            Opcode::Layer2 => Cmd::Layer2,
            Opcode::In => Cmd::In,
            Opcode::Frag => Cmd::Frag,
            Opcode::Recv | Opcode::Xmit | Opcode::Via => {
                let im = decode_iface(arg1, d)?;
                match opcode {
                    Opcode::Recv => Cmd::Recv(im),
                    Opcode::Xmit => Cmd::Xmit(im),
                    _ => Cmd::Via(im),
                }
            }
            Opcode::IpOpt => Cmd::IpOpts {
                set: IpOpts::from_bits_truncate(lo8),
                clear: IpOpts::from_bits_truncate(hi8),
            },
            Opcode::IpLen => Cmd::IpLen(arg1),
            Opcode::IpId => Cmd::IpId(arg1),
            Opcode::IpTos => Cmd::IpTos { set: lo8, clear: hi8 },
            Opcode::IpPrecedence => Cmd::IpPrecedence(lo8),
            Opcode::IpTtl => Cmd::IpTtl(lo8),
            Opcode::IpVer => Cmd::IpVer(lo8),
            Opcode::Estab => Cmd::Estab,
            Opcode::TcpFlags => Cmd::TcpFlags {
                set: TcpFlags::from_bits_truncate(lo8),
                clear: TcpFlags::from_bits_truncate(hi8),
            },
            Opcode::TcpWin => Cmd::TcpWin(arg1),
            Opcode::TcpSeq => Cmd::TcpSeq(d[0]),
            Opcode::TcpAck => Cmd::TcpAck(d[0]),
            Opcode::IcmpType => Cmd::IcmpTypes(d[0]),
            Opcode::TcpOpts => Cmd::TcpOpts {
                set: TcpOpts::from_bits_truncate(lo8),
                clear: TcpOpts::from_bits_truncate(hi8),
            },
            Opcode::Prob => Cmd::Prob(d[0]),
            Opcode::ProbeState => Cmd::ProbeState,
            Opcode::KeepState => Cmd::KeepState,
            Opcode::Limit => {
                let conn_limit = d[0] as u16;
                let raw_mask = (d[0] >> 16) as u8;
                if conn_limit == 0 {
                    return Err(InsnError::ZeroLimit);
                }
                let Some(mask) = LimitMask::from_bits(raw_mask) else {
                    return Err(InsnError::BadLimitMask { mask: raw_mask });
                };
                Cmd::Limit { mask, conn_limit }
            }
            Opcode::Log => Cmd::Log { max_log: d[0] },
            Opcode::CheckState => Cmd::CheckState,
            Opcode::Accept => Cmd::Accept,
            Opcode::Deny => Cmd::Deny,
            Opcode::Reject => Cmd::Reject(arg1),
            Opcode::Count => Cmd::Count,
            Opcode::Skipto => Cmd::Skipto(arg1),
            Opcode::Pipe => Cmd::Pipe(arg1),
            Opcode::Queue => Cmd::Queue(arg1),
            Opcode::Divert => Cmd::Divert(arg1),
            Opcode::Tee => Cmd::Tee(arg1),
            Opcode::ForwardIp => Cmd::ForwardIp { addr: d[0], port: arg1 },
        };

        Ok((Self { cmd, flags }, len))
    }
}

fn decode_iface(mode: u16, d: &[u32]) -> Result<IfaceMatch, InsnError> {
    if mode == 0 {
        return Ok(IfaceMatch::Addr(d[0]));
    }

    let mut bytes = Vec::with_capacity(IFNAMSIZ);
    for w in &d[1..] {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    bytes.truncate(end);

    let name = String::from_utf8(bytes).map_err(|_| InsnError::BadIfaceName)?;
    if name.is_empty() {
        return Err(InsnError::BadIfaceName);
    }

    match mode {
        1 => Ok(IfaceMatch::Name(name)),
        2 => Ok(IfaceMatch::Glob(name)),
        _ => Err(InsnError::BadIfaceMode { mode }),
    }
}

/// Decode a whole rule body.
pub fn decode_insns(buf: &[u32]) -> Result<Vec<(usize, Insn)>, InsnError> {
    let mut insns = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let (insn, len) = Insn::decode(&buf[pos..])?;
        insns.push((pos, insn));
        pos += len;
    }

    Ok(insns)
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum InsnError {
    Truncated { opcode: u8 },
    ZeroLength { opcode: u8 },
    UnknownOpcode(u8),
    BadSize { opcode: Opcode, len: usize },
    ZeroMask { opcode: Opcode },
    BadSetSize { size: u16 },
    BadIfaceMode { mode: u16 },
    BadIfaceName,
    ZeroLimit,
    BadLimitMask { mask: u8 },
}

impl Display for InsnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated { opcode } => {
                write!(f, "opcode {opcode} size truncated")
            }
            Self::ZeroLength { opcode } => {
                write!(f, "opcode {opcode} has zero length")
            }
            Self::UnknownOpcode(op) => write!(f, "opcode {op}, unknown opcode"),
            Self::BadSize { opcode, len } => {
                write!(f, "opcode {opcode:?} size {len} wrong")
            }
            Self::ZeroMask { opcode } => {
                write!(f, "opcode {opcode:?}, useless rule (zero mask)")
            }
            Self::BadSetSize { size } => write!(f, "invalid set size {size}"),
            Self::BadIfaceMode { mode } => {
                write!(f, "invalid interface match mode {mode}")
            }
            Self::BadIfaceName => write!(f, "invalid interface name"),
            Self::ZeroLimit => write!(f, "zero-size limit"),
            Self::BadLimitMask { mask } => {
                write!(f, "invalid limit mask 0x{mask:x}")
            }
        }
    }
}

fn fmt_ranges(f: &mut fmt::Formatter, list: &[PortRange]) -> fmt::Result {
    for (i, r) in list.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        if r.lo == r.hi {
            write!(f, "{}", r.lo)?;
        } else {
            write!(f, "{}-{}", r.lo, r.hi)?;
        }
    }
    Ok(())
}

fn fmt_iface(f: &mut fmt::Formatter, im: &IfaceMatch) -> fmt::Result {
    match im {
        IfaceMatch::Addr(a) => write!(f, "{}", Ipv4Addr::from(*a)),
        IfaceMatch::Name(n) | IfaceMatch::Glob(n) => write!(f, "{n}"),
    }
}

impl Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_not() {
            write!(f, "not ")?;
        }

        match &self.cmd {
            Cmd::Nop => write!(f, "nop")?,
            Cmd::Proto(p) => write!(f, "proto {p}")?,
            Cmd::SrcIp(a) => write!(f, "src-ip {}", Ipv4Addr::from(*a))?,
            Cmd::DstIp(a) => write!(f, "dst-ip {}", Ipv4Addr::from(*a))?,
            Cmd::SrcIpMask { addr, mask } => write!(
                f,
                "src-ip {}/{}",
                Ipv4Addr::from(*addr),
                Ipv4Addr::from(*mask)
            )?,
            Cmd::DstIpMask { addr, mask } => write!(
                f,
                "dst-ip {}/{}",
                Ipv4Addr::from(*addr),
                Ipv4Addr::from(*mask)
            )?,
            Cmd::SrcIpMe => write!(f, "src-ip me")?,
            Cmd::DstIpMe => write!(f, "dst-ip me")?,
            Cmd::SrcIpSet(s) => {
                write!(f, "src-ip {}/set{}", Ipv4Addr::from(s.base), s.size)?
            }
            Cmd::DstIpSet(s) => {
                write!(f, "dst-ip {}/set{}", Ipv4Addr::from(s.base), s.size)?
            }
            Cmd::SrcPort(list) => {
                write!(f, "src-port ")?;
                fmt_ranges(f, list)?;
            }
            Cmd::DstPort(list) => {
                write!(f, "dst-port ")?;
                fmt_ranges(f, list)?;
            }
            Cmd::MacAddr { .. } => write!(f, "mac")?,
            Cmd::MacType(list) => {
                write!(f, "mac-type ")?;
                fmt_ranges(f, list)?;
            }
            Cmd::Layer2 => write!(f, "layer2")?,
            Cmd::In => write!(f, "in")?,
            Cmd::Frag => write!(f, "frag")?,
            Cmd::Recv(im) => {
                write!(f, "recv ")?;
                fmt_iface(f, im)?;
            }
            Cmd::Xmit(im) => {
                write!(f, "xmit ")?;
                fmt_iface(f, im)?;
            }
            Cmd::Via(im) => {
                write!(f, "via ")?;
                fmt_iface(f, im)?;
            }
            Cmd::IpOpts { set, clear } => {
                write!(f, "ipopts {:#x}/{:#x}", set.bits(), clear.bits())?
            }
            Cmd::IpLen(v) => write!(f, "iplen {v}")?,
            Cmd::IpId(v) => write!(f, "ipid {v}")?,
            Cmd::IpTos { set, clear } => write!(f, "iptos {set:#x}/{clear:#x}")?,
            Cmd::IpPrecedence(v) => write!(f, "ipprecedence {v}")?,
            Cmd::IpTtl(v) => write!(f, "ipttl {v}")?,
            Cmd::IpVer(v) => write!(f, "ipversion {v}")?,
            Cmd::Estab => write!(f, "established")?,
            Cmd::TcpFlags { set, clear } => {
                write!(f, "tcpflags {:#x}/{:#x}", set.bits(), clear.bits())?
            }
            Cmd::TcpWin(v) => write!(f, "tcpwin {v}")?,
            Cmd::TcpSeq(v) => write!(f, "tcpseq {v}")?,
            Cmd::TcpAck(v) => write!(f, "tcpack {v}")?,
            Cmd::IcmpTypes(bits) => write!(f, "icmptypes {bits:#x}")?,
            Cmd::TcpOpts { set, clear } => {
                write!(f, "tcpoptions {:#x}/{:#x}", set.bits(), clear.bits())?
            }
            Cmd::Prob(p) => write!(f, "prob {p:#x}")?,
            Cmd::ProbeState => write!(f, "probe-state")?,
            Cmd::KeepState => write!(f, "keep-state")?,
            Cmd::Limit { mask, conn_limit } => {
                write!(f, "limit {:#x} {conn_limit}", mask.bits())?
            }
            Cmd::Log { max_log } => {
                if *max_log > 0 {
                    write!(f, "log logamount {max_log}")?
                } else {
                    write!(f, "log")?
                }
            }
            Cmd::CheckState => write!(f, "check-state")?,
            Cmd::Accept => write!(f, "allow")?,
            Cmd::Deny => write!(f, "deny")?,
            Cmd::Reject(ICMP_REJECT_RST) => write!(f, "reset")?,
            Cmd::Reject(code) => write!(f, "unreach {code}")?,
            Cmd::Count => write!(f, "count")?,
            Cmd::Skipto(n) => write!(f, "skipto {n}")?,
            Cmd::Pipe(n) => write!(f, "pipe {n}")?,
            Cmd::Queue(n) => write!(f, "queue {n}")?,
            Cmd::Divert(p) => write!(f, "divert {p}")?,
            Cmd::Tee(p) => write!(f, "tee {p}")?,
            Cmd::ForwardIp { addr, port } => {
                write!(f, "fwd {},{port}", Ipv4Addr::from(*addr))?
            }
        }

        if self.is_or() {
            write!(f, " or")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(insn: &Insn) -> Vec<u32> {
        let mut out = Vec::new();
        insn.encode(&mut out);
        out
    }

    #[test]
    fn word_layout() {
        let words = encode(&Insn::new(Cmd::Skipto(200)).not());
        assert_eq!(words.len(), 1);
        assert_eq!(words[0] & 0xff, Opcode::Skipto as u32);
        assert_eq!((words[0] >> 8) & 0xff, u32::from(F_NOT) | 1);
        assert_eq!(words[0] >> 16, 200);
    }

    #[test]
    fn variable_length_instructions_decode() {
        let mut set = AddrSet::new("10.0.0.0".parse().unwrap(), 40);
        set.insert("10.0.0.33".parse().unwrap());
        let insns = [
            Insn::new(Cmd::SrcIpSet(set)),
            Insn::new(Cmd::DstPort(vec![
                PortRange::single(22),
                PortRange::new(8000, 8080),
            ]))
            .or(),
            Insn::new(Cmd::Recv(IfaceMatch::Glob("vioif*".into()))),
        ];

        let mut buf = Vec::new();
        for insn in &insns {
            insn.encode(&mut buf);
        }
        assert_eq!(buf.len(), 4 + 3 + IFACE_INSN_LEN);

        let decoded: Vec<Insn> =
            decode_insns(&buf).unwrap().into_iter().map(|(_, i)| i).collect();
        assert_eq!(&decoded[..], &insns[..]);

        let Cmd::SrcIpSet(set) = &decoded[0].cmd else { panic!() };
        assert!(set.contains(u32::from(Ipv4Addr::new(10, 0, 0, 33))));
        assert!(!set.contains(u32::from(Ipv4Addr::new(10, 0, 0, 32))));
        assert!(!set.contains(u32::from(Ipv4Addr::new(10, 0, 0, 200))));
    }

    #[test]
    fn bad_sizes_rejected() {
        // An accept claiming two words.
        let w = Opcode::Accept as u32 | (2 << 8);
        assert_eq!(
            Insn::decode(&[w, 0]),
            Err(InsnError::BadSize { opcode: Opcode::Accept, len: 2 })
        );

        // A dst-ip claiming more words than remain.
        let w = Opcode::IpDst as u32 | (2 << 8);
        assert_eq!(
            Insn::decode(&[w]),
            Err(InsnError::Truncated { opcode: Opcode::IpDst as u8 })
        );

        let w = 39 | (1 << 8);
        assert_eq!(Insn::decode(&[w]), Err(InsnError::UnknownOpcode(39)));

        // A masked match with a zero mask would match everything.
        let w = Opcode::IpSrcMask as u32 | (3 << 8);
        assert_eq!(
            Insn::decode(&[w, 0x0a000000, 0]),
            Err(InsnError::ZeroMask { opcode: Opcode::IpSrcMask })
        );

        // An address set of 300 entries.
        let w = Opcode::IpDstSet as u32 | (12 << 8) | (300 << 16);
        assert_eq!(
            Insn::decode(&[w; 12]),
            Err(InsnError::BadSetSize { size: 300 })
        );

        let w = Opcode::Limit as u32 | (2 << 8);
        assert_eq!(Insn::decode(&[w, 0x0001_0000]), Err(InsnError::ZeroLimit));
    }

    #[test]
    fn port_range_bounds() {
        let r = PortRange::new(100, 200);
        assert!(r.contains(100));
        assert!(r.contains(200));
        assert!(!r.contains(201));
        assert!(!PortRange::new(10, 5).contains(7));
    }
}
