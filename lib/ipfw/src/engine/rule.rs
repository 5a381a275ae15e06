// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Static rules.
//!
//! A [`Rule`] is immutable once validated, apart from its counters,
//! its set number and the two flags the control plane flips while
//! removing it. Rules are shared as `Arc<Rule>` between chain
//! snapshots, dynamic state entries and packets parked in the shaper,
//! so counters survive republication of the chain.

use crate::ddi::time::Moment;
use core::fmt;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use ipfw_api::Cmd;
use ipfw_api::DEFAULT_RULENUM;
use ipfw_api::DEFAULT_SET;
use ipfw_api::IocRule;
use ipfw_api::Insn;
use ipfw_api::InsnError;
use ipfw_api::MAX_USER_SET;
use ipfw_api::RuleDump;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// What the default rule does with packets no other rule decided.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Accept,
    #[default]
    Deny,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ValidationReason {
    #[error("malformed rule encoding: {0}")]
    Decode(String),

    #[error("{0}")]
    Insn(InsnError),

    #[error("empty rule")]
    Empty,

    #[error("missing action")]
    MissingAction,

    #[error("opcode {0:?}, multiple actions not allowed")]
    MultipleActions(ipfw_api::Opcode),

    #[error("opcode {0:?}, action must be last opcode")]
    ActionNotLast(ipfw_api::Opcode),

    #[error("action offset {0} does not start the action part")]
    BadActionOffset(u16),

    #[error("rule number 65535 is reserved for the default rule")]
    DefaultRuleNumber,

    #[error("set {0} is reserved")]
    ReservedSet(u8),
}

/// A rule buffer was refused; nothing was installed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("invalid rule: {reason}")]
pub struct ValidationError {
    pub reason: ValidationReason,
}

impl From<ValidationReason> for ValidationError {
    fn from(reason: ValidationReason) -> Self {
        Self { reason }
    }
}

impl From<InsnError> for ValidationError {
    fn from(e: InsnError) -> Self {
        ValidationReason::Insn(e).into()
    }
}

/// Identifies an installed rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RuleHandle {
    pub id: u64,
    pub rulenum: u16,
}

/// Lets a packet handed to the shaper or a divert socket resume
/// evaluation after the rule that sent it there.
#[derive(Clone)]
pub struct ResumeToken(pub(crate) Arc<Rule>);

impl ResumeToken {
    pub fn rulenum(&self) -> u16 {
        self.0.rulenum()
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResumeToken")
            .field("id", &self.0.id())
            .field("rulenum", &self.0.rulenum())
            .finish()
    }
}

/// Outcome of asking a rule whether a match may be logged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogPermit {
    Log,
    /// Log, and note this was the last time until counters are zeroed.
    LogLast,
    Suppressed,
}

pub struct Rule {
    id: u64,
    rulenum: u16,
    set: AtomicU8,
    cmd: Vec<u32>,
    act_ofs: u16,
    insns: Vec<Insn>,
    act_idx: usize,
    creates_state: bool,
    max_log: u32,

    state_enabled: AtomicBool,
    invalid: AtomicBool,
    log_left: AtomicU32,
    pkt_cnt: AtomicU64,
    byte_cnt: AtomicU64,
    timestamp: AtomicU64,
}

impl Rule {
    /// Validate a rule buffer from an administrative client.
    ///
    /// `verbose_limit` is the logging budget of an `O_LOG` that does
    /// not carry its own.
    pub fn from_ioc(
        id: u64,
        ioc: &IocRule,
        verbose_limit: u32,
    ) -> Result<Self, ValidationError> {
        if ioc.rulenum == DEFAULT_RULENUM {
            return Err(ValidationReason::DefaultRuleNumber.into());
        }

        if ioc.set > MAX_USER_SET {
            return Err(ValidationReason::ReservedSet(ioc.set).into());
        }

        if ioc.cmd.is_empty() {
            return Err(ValidationReason::Empty.into());
        }

        let decoded = ioc.insns()?;
        let last = decoded.len() - 1;
        let mut actions =
            decoded.iter().enumerate().filter(|(_, (_, i))| i.cmd.is_action());

        let Some((act_pos, (_, action))) = actions.next() else {
            return Err(ValidationReason::MissingAction.into());
        };

        if let Some((_, (_, extra))) = actions.next() {
            return Err(
                ValidationReason::MultipleActions(extra.cmd.opcode()).into()
            );
        }

        if act_pos != last {
            return Err(
                ValidationReason::ActionNotLast(action.cmd.opcode()).into()
            );
        }

        // The action part is an optional run of `log` followed by the
        // action itself.
        let act_idx = decoded
            .iter()
            .position(|(pos, _)| *pos == usize::from(ioc.act_ofs))
            .ok_or(ValidationReason::BadActionOffset(ioc.act_ofs))?;

        if decoded[act_idx..last]
            .iter()
            .any(|(_, insn)| !matches!(insn.cmd, Cmd::Log { .. }))
        {
            return Err(ValidationReason::BadActionOffset(ioc.act_ofs).into());
        }

        let insns: Vec<Insn> = decoded.into_iter().map(|(_, i)| i).collect();
        let creates_state = insns.iter().any(|i| i.cmd.creates_state());
        let max_log = insns
            .iter()
            .find_map(|i| match i.cmd {
                Cmd::Log { max_log } => Some(max_log),
                _ => None,
            })
            .map(|m| if m == 0 { verbose_limit } else { m })
            .unwrap_or(0);

        Ok(Self::new(
            id,
            ioc.rulenum,
            ioc.set,
            ioc.cmd.clone(),
            ioc.act_ofs,
            insns,
            act_idx,
            creates_state,
            max_log,
        ))
    }

    /// The catch-all rule terminating every chain.
    pub fn new_default(id: u64, action: DefaultAction) -> Self {
        let cmd = match action {
            DefaultAction::Accept => Cmd::Accept,
            DefaultAction::Deny => Cmd::Deny,
        };
        let insn = Insn::new(cmd);
        let mut words = Vec::with_capacity(1);
        insn.encode(&mut words);

        Self::new(
            id,
            DEFAULT_RULENUM,
            DEFAULT_SET,
            words,
            0,
            vec![insn],
            0,
            false,
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u64,
        rulenum: u16,
        set: u8,
        cmd: Vec<u32>,
        act_ofs: u16,
        insns: Vec<Insn>,
        act_idx: usize,
        creates_state: bool,
        max_log: u32,
    ) -> Self {
        Self {
            id,
            rulenum,
            set: AtomicU8::new(set),
            cmd,
            act_ofs,
            insns,
            act_idx,
            creates_state,
            max_log,
            state_enabled: AtomicBool::new(true),
            invalid: AtomicBool::new(false),
            log_left: AtomicU32::new(max_log),
            pkt_cnt: AtomicU64::new(0),
            byte_cnt: AtomicU64::new(0),
            timestamp: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn rulenum(&self) -> u16 {
        self.rulenum
    }

    pub fn set(&self) -> u8 {
        self.set.load(Ordering::Relaxed)
    }

    pub(crate) fn set_set(&self, set: u8) {
        self.set.store(set, Ordering::Relaxed);
    }

    pub fn is_default(&self) -> bool {
        self.rulenum == DEFAULT_RULENUM
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// The instructions starting at the action part.
    pub fn action_part(&self) -> &[Insn] {
        &self.insns[self.act_idx..]
    }

    pub fn act_idx(&self) -> usize {
        self.act_idx
    }

    /// The terminating action.
    pub fn action(&self) -> &Cmd {
        // Validation guarantees a non-empty body.
        &self.insns[self.insns.len() - 1].cmd
    }

    pub fn creates_state(&self) -> bool {
        self.creates_state
    }

    pub fn state_enabled(&self) -> bool {
        self.state_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn disable_state(&self) {
        self.state_enabled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn enable_state(&self) {
        self.state_enabled.store(true, Ordering::SeqCst);
    }

    /// Has this rule been removed from the chain?
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_invalid(&self) {
        self.state_enabled.store(false, Ordering::SeqCst);
        self.invalid.store(true, Ordering::SeqCst);
    }

    pub fn pkt_cnt(&self) -> u64 {
        self.pkt_cnt.load(Ordering::Relaxed)
    }

    pub fn byte_cnt(&self) -> u64 {
        self.byte_cnt.load(Ordering::Relaxed)
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    /// Account one matching packet of `len` bytes.
    pub fn count(&self, len: u16, now: Moment) {
        self.pkt_cnt.fetch_add(1, Ordering::Relaxed);
        self.byte_cnt.fetch_add(u64::from(len), Ordering::Relaxed);
        self.timestamp.store(now.as_secs(), Ordering::Relaxed);
    }

    /// Reset the counters (unless `log_only`) and the logging budget.
    pub fn zero(&self, log_only: bool) {
        if !log_only {
            self.pkt_cnt.store(0, Ordering::Relaxed);
            self.byte_cnt.store(0, Ordering::Relaxed);
            self.timestamp.store(0, Ordering::Relaxed);
        }
        self.log_left.store(self.max_log, Ordering::Relaxed);
    }

    pub fn log_permit(&self) -> LogPermit {
        if self.max_log == 0 {
            return LogPermit::Log;
        }

        let prev = self.log_left.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |left| left.checked_sub(1),
        );

        match prev {
            Ok(1) => LogPermit::LogLast,
            Ok(_) => LogPermit::Log,
            Err(_) => LogPermit::Suppressed,
        }
    }

    pub fn max_log(&self) -> u32 {
        self.max_log
    }

    pub fn to_ioc(&self) -> IocRule {
        IocRule {
            rulenum: self.rulenum,
            set: self.set(),
            act_ofs: self.act_ofs,
            cmd: self.cmd.clone(),
        }
    }

    pub fn dump(&self) -> RuleDump {
        RuleDump {
            rule: self.to_ioc(),
            pkt_cnt: self.pkt_cnt(),
            byte_cnt: self.byte_cnt(),
            timestamp: self.timestamp(),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("rulenum", &self.rulenum)
            .field("set", &self.set())
            .field("insns", &self.insns)
            .finish()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:05}", self.rulenum)?;
        for insn in &self.insns {
            if matches!(insn.cmd, Cmd::ProbeState) {
                continue;
            }
            write!(f, " {insn}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ipfw_api::LimitMask;
    use ipfw_api::Opcode;
    use ipfw_api::PortRange;
    use ipfw_api::RuleBuilder;

    #[test]
    fn round_trip() {
        let ioc = RuleBuilder::new(100, Cmd::Accept)
            .set(2)
            .add_match(Cmd::Proto(6))
            .add_match(Cmd::DstPort(vec![PortRange::new(80, 81)]))
            .limit(LimitMask::SRC_ADDR, 4)
            .log(0)
            .finalize();

        let rule = Rule::from_ioc(7, &ioc, 50).unwrap();
        assert_eq!(rule.to_ioc(), ioc);
        assert!(rule.creates_state());
        assert_eq!(rule.max_log(), 50);
        assert_eq!(rule.action(), &Cmd::Accept);
        assert!(matches!(rule.action_part()[0].cmd, Cmd::Log { .. }));

        let again = Rule::from_ioc(8, &rule.to_ioc(), 50).unwrap();
        assert_eq!(again.insns(), rule.insns());
    }

    #[test]
    fn structure_checks() {
        let mut ioc = RuleBuilder::new(100, Cmd::Deny)
            .add_match(Cmd::Proto(17))
            .finalize();

        ioc.rulenum = DEFAULT_RULENUM;
        assert_eq!(
            Rule::from_ioc(1, &ioc, 0).unwrap_err().reason,
            ValidationReason::DefaultRuleNumber
        );
        ioc.rulenum = 100;

        ioc.set = DEFAULT_SET;
        assert_eq!(
            Rule::from_ioc(1, &ioc, 0).unwrap_err().reason,
            ValidationReason::ReservedSet(DEFAULT_SET)
        );
        ioc.set = 0;

        // An action followed by a match.
        let mut words = ioc.cmd.clone();
        words.swap(0, 1);
        let bad = IocRule { cmd: words, act_ofs: 1, ..ioc.clone() };
        assert_eq!(
            Rule::from_ioc(1, &bad, 0).unwrap_err().reason,
            ValidationReason::ActionNotLast(Opcode::Deny)
        );

        // Two actions.
        let mut words = ioc.cmd.clone();
        words[0] = ioc.cmd[1];
        let bad = IocRule { cmd: words, ..ioc.clone() };
        assert_eq!(
            Rule::from_ioc(1, &bad, 0).unwrap_err().reason,
            ValidationReason::MultipleActions(Opcode::Deny)
        );

        // No action at all.
        let bad = IocRule { cmd: vec![ioc.cmd[0]], act_ofs: 0, ..ioc.clone() };
        assert_eq!(
            Rule::from_ioc(1, &bad, 0).unwrap_err().reason,
            ValidationReason::MissingAction
        );

        // The action offset points into the match part.
        let bad = IocRule { act_ofs: 0, ..ioc.clone() };
        assert_eq!(
            Rule::from_ioc(1, &bad, 0).unwrap_err().reason,
            ValidationReason::BadActionOffset(0)
        );

        assert!(Rule::from_ioc(1, &ioc, 0).is_ok());
    }

    #[test]
    fn log_budget() {
        let ioc = RuleBuilder::new(10, Cmd::Count).log(2).finalize();
        let rule = Rule::from_ioc(1, &ioc, 100).unwrap();

        assert_eq!(rule.log_permit(), LogPermit::Log);
        assert_eq!(rule.log_permit(), LogPermit::LogLast);
        assert_eq!(rule.log_permit(), LogPermit::Suppressed);

        rule.count(60, Moment::from_secs(3));
        rule.zero(true);
        assert_eq!(rule.pkt_cnt(), 1);
        assert_eq!(rule.log_permit(), LogPermit::Log);

        rule.zero(false);
        assert_eq!(rule.pkt_cnt(), 0);
        assert_eq!(rule.byte_cnt(), 0);
    }
}
