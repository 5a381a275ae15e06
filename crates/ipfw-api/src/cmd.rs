// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use super::API_VERSION;
use super::DEFAULT_RULENUM;
use super::flow::FlowId;
use super::insn::Cmd;
use super::insn::Insn;
use super::insn::InsnError;
use super::insn::LimitMask;
use super::insn::decode_insns;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A rule as it crosses the control boundary: the header fields plus
/// the raw instruction words. `act_ofs` is the word offset of the
/// action part (an optional `log` followed by the action).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IocRule {
    pub rulenum: u16,
    pub set: u8,
    pub act_ofs: u16,
    pub cmd: Vec<u32>,
}

impl IocRule {
    /// Decode the instruction words. This only checks that each
    /// instruction is well formed on its own; rule-level structure is
    /// checked by the engine when the rule is added.
    pub fn insns(&self) -> Result<Vec<(usize, Insn)>, InsnError> {
        decode_insns(&self.cmd)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Build a rule from typed instructions.
///
/// Match instructions are kept in the order they are added; the
/// optional `log` and the action are always placed last, which is the
/// only layout the engine accepts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuleBuilder {
    pub rulenum: u16,
    pub set: u8,
    pub matches: Vec<Insn>,
    pub log: Option<u32>,
    pub action: Cmd,
}

impl RuleBuilder {
    pub fn new(rulenum: u16, action: Cmd) -> Self {
        Self { rulenum, set: 0, matches: Vec::new(), log: None, action }
    }

    pub fn set(mut self, set: u8) -> Self {
        self.set = set;
        self
    }

    pub fn add_match<I: Into<Insn>>(mut self, insn: I) -> Self {
        self.matches.push(insn.into());
        self
    }

    /// Log matches, at most `max_log` times until the rule's counters
    /// are zeroed. Zero defers to the global limit.
    pub fn log(mut self, max_log: u32) -> Self {
        self.log = Some(max_log);
        self
    }

    pub fn keep_state(self) -> Self {
        self.add_match(Cmd::KeepState)
    }

    pub fn limit(self, mask: LimitMask, conn_limit: u16) -> Self {
        self.add_match(Cmd::Limit { mask, conn_limit })
    }

    /// Encode the rule. A stateful rule gets a leading `probe-state` so
    /// packets of an existing flow take the rule's action before any
    /// other predicate is evaluated.
    pub fn finalize(&self) -> IocRule {
        let mut cmd = Vec::new();
        if self.matches.iter().any(|i| i.cmd.creates_state()) {
            Insn::new(Cmd::ProbeState).encode(&mut cmd);
        }
        for insn in &self.matches {
            insn.encode(&mut cmd);
        }

        let act_ofs = cmd.len() as u16;
        if let Some(max_log) = self.log {
            Insn::new(Cmd::Log { max_log }).encode(&mut cmd);
        }
        Insn::new(self.action.clone()).encode(&mut cmd);

        IocRule { rulenum: self.rulenum, set: self.set, act_ofs, cmd }
    }
}

/// The counters and body of one installed rule.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuleDump {
    pub rule: IocRule,
    pub pkt_cnt: u64,
    pub byte_cnt: u64,
    /// Seconds since the engine's clock origin of the last match.
    pub timestamp: u64,
}

impl RuleDump {
    pub fn is_default(&self) -> bool {
        self.rule.rulenum == DEFAULT_RULENUM
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DumpRulesResp {
    pub api_version: u64,
    pub set_disable: u32,
    pub rules: Vec<RuleDump>,
}

impl DumpRulesResp {
    pub fn new(set_disable: u32, rules: Vec<RuleDump>) -> Self {
        Self { api_version: API_VERSION, set_disable, rules }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DynType {
    KeepState,
    Limit,
    LimitParent,
}

impl Display for DynType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::KeepState => "STATE",
            Self::Limit => "LIMIT",
            Self::LimitParent => "PARENT",
        };
        write!(f, "{s}")
    }
}

/// One dynamic state entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StateDump {
    pub id: FlowId,
    pub rulenum: u16,
    pub dyn_type: DynType,
    /// Seconds until expiry; zero once expired.
    pub expire_in: u64,
    pub pkt_cnt: u64,
    pub byte_cnt: u64,
    pub tcp_state: u16,
    pub limit_count: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DumpStatesResp {
    pub api_version: u64,
    pub states: Vec<StateDump>,
}

impl DumpStatesResp {
    pub fn new(states: Vec<StateDump>) -> Self {
        Self { api_version: API_VERSION, states }
    }
}

/// The bulk rule/set administration commands.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DelCmd {
    /// Delete every rule with this number.
    Rule { rulenum: u16 },
    /// Delete every rule in the set.
    Set { set: u8 },
    /// Move every rule with this number to `new_set`.
    MoveRule { rulenum: u16, new_set: u8 },
    /// Move every rule of `set` to `new_set`.
    MoveSet { set: u8, new_set: u8 },
    /// Exchange the members of two sets.
    SwapSets { set: u8, new_set: u8 },
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SetEnableReq {
    pub disable_mask: u32,
    pub enable_mask: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ZeroReq {
    /// `None` zeroes every rule.
    pub rulenum: Option<u16>,
    pub log_only: bool,
}

pub trait CmdOk: DeserializeOwned + Serialize {}

impl CmdOk for DumpRulesResp {}
impl CmdOk for DumpStatesResp {}

/// Encode a response for a client.
pub fn encode_resp<T: CmdOk>(resp: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(resp)
}

pub fn decode_resp<T: CmdOk + Debug>(bytes: &[u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(bytes)
}
