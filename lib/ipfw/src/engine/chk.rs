// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Rule evaluation: walk a chain snapshot for one packet and decide
//! its fate.
//!
//! Each rule's instructions run left to right. A failing predicate
//! ends the rule unless it belongs to an or-block that may still
//! match; a matching member of an or-block skips the rest of the
//! block. `check-state` and `probe-state` consult the state table at
//! most once per packet and, on a hit, continue with the action part
//! of the rule that created the state.

use super::chain::RuleChain;
use super::dyn_state::DynMatch;
use super::dyn_state::DynStateTable;
use super::dyn_state::MatchDir;
use super::dyn_state::StateError;
use super::dyn_state::StateKind;
use super::packet::PacketDescriptor;
use super::packet::Verdict;
use super::predicate;
use super::rule::LogPermit;
use super::rule::Rule;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use crate::provider::Providers;
use core::net::Ipv4Addr;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use ipfw_api::Cmd;
use ipfw_api::DEFAULT_RULENUM;
use ipfw_api::ICMP_REJECT_RST;
use ipfw_api::TcpFlags;
use std::sync::Arc;

/// Lets a message through at most once per second.
#[derive(Debug, Default)]
pub struct LogRate {
    // Second of the last message, plus one; zero before the first.
    last: AtomicU64,
}

impl LogRate {
    pub fn allow(&self, now: Moment) -> bool {
        let sec = now.as_secs() + 1;
        let prev = self.last.load(Ordering::Relaxed);
        prev != sec
            && self
                .last
                .compare_exchange(
                    prev,
                    sec,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }
}

/// Everything one evaluation reads.
pub struct EvalCtx<'a> {
    pub chain: &'a RuleChain,
    pub set_disable: u32,
    pub states: &'a DynStateTable,
    pub providers: &'a Providers,
    pub one_pass: bool,
    pub verbose: bool,
    pub state_log: &'a LogRate,
    pub now: Moment,
}

/// The result of one evaluation.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub verdict: Verdict,
    /// The rule that decided; `None` when no rule was involved.
    pub rule: Option<Arc<Rule>>,
    /// How the packet matched dynamic state, if it did.
    pub dyn_dir: Option<MatchDir>,
}

impl Outcome {
    fn without_rule(verdict: Verdict) -> Self {
        Self { verdict, rule: None, dyn_dir: None }
    }
}

/// What running one rule body led to.
enum Step {
    /// The rule did not match; try the next one in the chain.
    NextRule,
    /// The rule matched with a non-terminal action; continue after it.
    ContinueAfter(Arc<Rule>),
    /// A state lookup hit; run the action part of the creating rule.
    Jump(Arc<Rule>),
    Done(Verdict, Arc<Rule>),
}

/// Per-packet evaluation state.
struct Eval<'c, 'a> {
    ctx: &'c EvalCtx<'a>,
    pkt: &'c PacketDescriptor,
    // `None` until the first state lookup, then its result.
    dyn_match: Option<Option<DynMatch>>,
}

impl Eval<'_, '_> {
    fn dyn_dir(&self) -> Option<MatchDir> {
        self.dyn_match.as_ref().and_then(|m| m.as_ref()).map(|m| m.dir)
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.ctx.providers.log.log(level, msg);
    }

    fn log_match(&self, rule: &Rule) {
        if !self.ctx.verbose {
            return;
        }

        let last = match rule.log_permit() {
            LogPermit::Suppressed => return,
            LogPermit::Log => false,
            LogPermit::LogLast => true,
        };

        let pkt = self.pkt;
        self.log(
            LogLevel::Note,
            &format!(
                "ipfw: {} {} {} {}{}",
                rule.rulenum(),
                rule.action_part()
                    .last()
                    .map(|i| i.to_string())
                    .unwrap_or_default(),
                pkt.flow_id,
                pkt.dir,
                if pkt.frag_offset != 0 { " (frag)" } else { "" },
            ),
        );

        if last {
            self.log(
                LogLevel::Note,
                &format!(
                    "ipfw: limit {} reached on entry {}",
                    rule.max_log(),
                    rule.rulenum()
                ),
            );
        }
    }

    fn install_state(&self, rule: &Arc<Rule>, kind: StateKind) -> bool {
        let ctx = self.ctx;
        match ctx.states.install(self.pkt, kind, rule, ctx.now) {
            Ok(()) => true,

            Err(e) => {
                // Running out of room is an operational condition:
                // warn, but not for every packet.
                let quiet = matches!(e, StateError::CreationDisabled { .. });
                if !quiet && ctx.state_log.allow(ctx.now) {
                    self.log(
                        LogLevel::Warn,
                        &format!(
                            "ipfw: rule {}: {e}, denying {}",
                            rule.rulenum(),
                            self.pkt.flow_id
                        ),
                    );
                }
                false
            }
        }
    }

    /// Send a reset or unreachable for a rejected packet when that is
    /// appropriate. Returns whether one was sent.
    fn send_reject(&self, code: u16) -> bool {
        let pkt = self.pkt;

        if pkt.layer2
            || pkt.bcast_or_mcast
            || pkt.flow_id.dst_addr().is_multicast()
            || pkt.flow_id.dst_addr().is_broadcast()
        {
            return false;
        }

        // Never answer an ICMP error with another one.
        if pkt.is_icmp() && !predicate::is_icmp_query(pkt) {
            return false;
        }

        if code == ICMP_REJECT_RST
            && !(pkt.is_tcp()
                && pkt.has_ulp()
                && pkt.tcp.is_some()
                && !pkt.tcp_flags().contains(TcpFlags::RST))
        {
            return false;
        }

        self.ctx.providers.io.send_reset_or_icmp_unreachable(pkt, code);
        true
    }

    /// Execute a rule's action.
    fn action(&self, rule: &Arc<Rule>, cmd: &Cmd) -> Step {
        let done = |v| Step::Done(v, Arc::clone(rule));

        match cmd {
            Cmd::Accept => done(Verdict::Accept),
            Cmd::Deny => done(Verdict::Deny),

            Cmd::Reject(code) => {
                if self.send_reject(*code) {
                    done(Verdict::Reject { code: *code })
                } else {
                    done(Verdict::Deny)
                }
            }

            Cmd::Count | Cmd::Skipto(_) => {
                rule.count(self.pkt.ip_len, self.ctx.now);
                Step::ContinueAfter(Arc::clone(rule))
            }

            Cmd::Pipe(id) => {
                done(Verdict::ToShaper { id: *id, is_pipe: true })
            }
            Cmd::Queue(id) => {
                done(Verdict::ToShaper { id: *id, is_pipe: false })
            }
            Cmd::Divert(port) => done(Verdict::Divert { port: *port }),
            Cmd::Tee(port) => done(Verdict::Tee { port: *port }),

            Cmd::ForwardIp { addr, port } => {
                // Not applicable to link-layer packets.
                if self.pkt.layer2 {
                    return Step::NextRule;
                }

                // The reply direction of a forwarded flow is not
                // forwarded again.
                match self.dyn_dir() {
                    None | Some(MatchDir::Forward) => {
                        done(Verdict::ForwardTo {
                            addr: Ipv4Addr::from(*addr),
                            port: *port,
                        })
                    }
                    Some(MatchDir::Reverse) => done(Verdict::Accept),
                }
            }

            Cmd::CheckState => Step::NextRule,

            // Validation only lets actions into the action slot.
            _ => done(Verdict::Deny),
        }
    }

    /// Run the instructions of `rule` from `start`.
    fn run_body(&mut self, rule: &Arc<Rule>, start: usize) -> Step {
        let mut skip_or = false;

        for insn in &rule.insns()[start..] {
            if skip_or {
                if !insn.is_or() {
                    skip_or = false;
                }
                continue;
            }

            let matched = match &insn.cmd {
                Cmd::CheckState | Cmd::ProbeState => {
                    if self.dyn_match.is_none() {
                        let found =
                            self.ctx.states.lookup(self.pkt, self.ctx.now);
                        self.dyn_match = Some(found.clone());
                        if let Some(m) = found {
                            return Step::Jump(Arc::clone(m.entry.rule()));
                        }
                    }

                    if matches!(insn.cmd, Cmd::CheckState) {
                        return Step::NextRule;
                    }
                    true
                }

                Cmd::KeepState => {
                    if !self.install_state(rule, StateKind::KeepState) {
                        return Step::Done(Verdict::Deny, Arc::clone(rule));
                    }
                    true
                }

                Cmd::Limit { mask, conn_limit } => {
                    let kind = StateKind::Limit {
                        mask: *mask,
                        conn_limit: *conn_limit,
                    };
                    if !self.install_state(rule, kind) {
                        return Step::Done(Verdict::Deny, Arc::clone(rule));
                    }
                    true
                }

                Cmd::Log { .. } => {
                    self.log_match(rule);
                    true
                }

                cmd if cmd.is_action() => return self.action(rule, cmd),

                cmd => predicate::is_match(
                    cmd,
                    self.pkt,
                    self.ctx.providers.rand.as_ref(),
                ),
            };

            if matched != insn.is_not() {
                if insn.is_or() {
                    skip_or = true;
                }
            } else if !insn.is_or() {
                return Step::NextRule;
            }
        }

        Step::NextRule
    }

    /// Position to continue at after `rule` declined to decide.
    fn continue_after(&self, rule: &Rule) -> usize {
        let chain = self.ctx.chain;
        match chain.index_of(rule) {
            Some(idx) => chain.next_rule_after(idx),
            None => {
                chain.first_after_num(rule.rulenum()).unwrap_or(chain.len())
            }
        }
    }

    /// Where a packet starts: the head of the chain, after the rule
    /// it was handed out by, or after the rule that diverted it.
    fn start(&self, resume: Option<&Arc<Rule>>) -> Result<usize, Outcome> {
        let ctx = self.ctx;

        if let Some(rule) = resume {
            if ctx.one_pass {
                return Err(Outcome::without_rule(Verdict::Accept));
            }

            // Removed while the packet was away.
            if rule.is_invalid() {
                return Err(Outcome::without_rule(Verdict::Deny));
            }

            return Ok(self.continue_after(rule));
        }

        if let Some(tag) = self.pkt.divert_tag {
            if tag >= DEFAULT_RULENUM {
                return Err(Outcome::without_rule(Verdict::Deny));
            }
            return ctx
                .chain
                .first_after_num(tag)
                .ok_or(Outcome::without_rule(Verdict::Deny));
        }

        Ok(0)
    }
}

/// Decide what to do with `pkt`.
///
/// `resume` is the rule a re-injected packet was handed out by.
/// Evaluation always produces a verdict; when nothing decides, the
/// packet is denied.
pub fn evaluate(
    ctx: &EvalCtx,
    pkt: &PacketDescriptor,
    resume: Option<&Arc<Rule>>,
) -> Outcome {
    if pkt.generated {
        return Outcome::without_rule(Verdict::Accept);
    }

    let mut eval = Eval { ctx, pkt, dyn_match: None };
    let mut idx = match eval.start(resume) {
        Ok(idx) => idx,
        Err(outcome) => return outcome,
    };

    let chain = ctx.chain;
    while let Some(rule) = chain.get(idx) {
        if ctx.set_disable & (1 << rule.set()) != 0 {
            idx += 1;
            continue;
        }

        let mut body = Arc::clone(rule);
        let mut start = 0;
        let step = loop {
            match eval.run_body(&body, start) {
                Step::Jump(parent) => {
                    start = parent.act_idx();
                    body = parent;
                }
                step => break step,
            }
        };

        match step {
            Step::NextRule => idx += 1,
            Step::ContinueAfter(r) => idx = eval.continue_after(&r),
            Step::Done(verdict, r) => {
                r.count(pkt.ip_len, ctx.now);
                return Outcome {
                    verdict,
                    rule: Some(r),
                    dyn_dir: eval.dyn_dir(),
                };
            }
            Step::Jump(_) => unreachable!("jumps are followed above"),
        }
    }

    eval.log(
        LogLevel::Error,
        &format!(
            "ipfw: ran off the end of the rules, denying {}",
            pkt.flow_id
        ),
    );
    Outcome::without_rule(Verdict::Deny)
}
