// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The firewall instance: a published rule chain, the dynamic state
//! table and the control operations that change them.
//!
//! Packet evaluation never takes a control lock. It loads the current
//! chain snapshot and works on it; control operations are serialized
//! by `ctl`, build a modified copy of the chain and publish it.
//!
//! Removing rules that create state follows a fixed order:
//!
//! 1. Clear state creation on the rules being removed. The state table
//!    checks this flag under its exclusive lock.
//! 2. Flush their dynamic entries, which takes that same lock; any
//!    install that raced with step 1 has either completed (and is
//!    flushed now) or will observe the cleared flag.
//! 3. Publish the chain without them.
//! 4. Mark them invalid, so that packets parked in the shaper or a
//!    divert socket with a token for them are denied on return.

use super::chain::ChainError;
use super::chain::RuleChain;
use super::chk;
use super::chk::EvalCtx;
use super::chk::LogRate;
use super::chk::Outcome;
use super::ctl::ControlError;
use super::dyn_state::DynStateTable;
use super::packet::PacketDescriptor;
use super::packet::Verdict;
use super::rule::ResumeToken;
use super::rule::Rule;
use super::rule::RuleHandle;
use super::rule::ValidationError;
use super::rule::ValidationReason;
use crate::bit_on;
use crate::cfg::ConfigError;
use crate::cfg::FwConfig;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use crate::ddi::time::Periodic;
use crate::dynamic::Dynamic;
use crate::provider::LogLevel;
use crate::provider::Providers;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;
use ipfw_api::DEFAULT_RULENUM;
use ipfw_api::DEFAULT_SET;
use ipfw_api::DumpRulesResp;
use ipfw_api::DumpStatesResp;
use ipfw_api::IocRule;
use ipfw_api::MAX_USER_SET;
use std::sync::Arc;

/// What one timer pass did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    pub expired: u32,
    pub probed: usize,
}

pub struct Firewall {
    name: String,
    cfg: FwConfig,
    // Serializes control operations; holds the next rule id.
    ctl: KMutex<u64>,
    chain: Dynamic<RuleChain>,
    set_disable: AtomicU32,
    states: DynStateTable,
    providers: Providers,
    // Packets denied without any rule deciding.
    norule: AtomicU64,
    state_log: LogRate,
}

impl Firewall {
    pub fn new(
        name: &str,
        cfg: FwConfig,
        providers: Providers,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let salt = providers.rand.random_u32();
        let default = Rule::new_default(0, cfg.default_action);
        let fw = Self {
            name: name.to_string(),
            ctl: KMutex::new(1),
            chain: Dynamic::from(RuleChain::new(Arc::new(default))),
            set_disable: AtomicU32::new(0),
            states: DynStateTable::new(cfg.dyn_config(), salt),
            providers,
            norule: AtomicU64::new(0),
            state_log: LogRate::default(),
            cfg,
        };

        fw.log(
            LogLevel::Note,
            &format!(
                "initialized, default to {:?}, logging {}",
                fw.cfg.default_action,
                if fw.cfg.verbose { "enabled" } else { "disabled" },
            ),
        );
        Ok(fw)
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.providers.log.log(level, &format!("{}: {msg}", self.name));
    }

    fn now(&self) -> Moment {
        self.providers.clock.current_time()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FwConfig {
        &self.cfg
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// The number of rules, the default rule included.
    pub fn rule_count(&self) -> usize {
        self.chain.load().len()
    }

    /// The generation of the published chain.
    pub fn chain_generation(&self) -> u64 {
        self.chain.load().generation()
    }

    pub fn set_disable_mask(&self) -> u32 {
        self.set_disable.load(Ordering::SeqCst)
    }

    pub fn norule_count(&self) -> u64 {
        self.norule.load(Ordering::Relaxed)
    }

    pub fn state_count(&self) -> u32 {
        self.states.len()
    }

    pub fn states(&self) -> &DynStateTable {
        &self.states
    }

    // ================================================================
    // Packet path
    // ================================================================

    /// Classify `pkt`. `resume` is the token a re-injected packet was
    /// handed out with.
    pub fn check(
        &self,
        pkt: &PacketDescriptor,
        resume: Option<&ResumeToken>,
    ) -> Outcome {
        let chain = self.chain.load();
        let ctx = EvalCtx {
            chain: &chain,
            set_disable: self.set_disable.load(Ordering::SeqCst),
            states: &self.states,
            providers: &self.providers,
            one_pass: self.cfg.one_pass,
            verbose: self.cfg.verbose,
            state_log: &self.state_log,
            now: self.now(),
        };

        let out = chk::evaluate(&ctx, pkt, resume.map(|t| &t.0));
        if out.rule.is_none() && out.verdict == Verdict::Deny {
            self.norule.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    /// The verdict for `pkt`.
    pub fn evaluate(&self, pkt: &PacketDescriptor) -> Verdict {
        self.check(pkt, None).verdict
    }

    /// Classify `pkt` and carry out the hand-offs the verdict calls
    /// for: packets for the shaper or a divert socket are passed to
    /// [`crate::provider::PacketIo`] along with a token to resume
    /// evaluation with when they come back.
    pub fn process(&self, pkt: &PacketDescriptor) -> Verdict {
        let out = self.check(pkt, None);
        self.dispatch(pkt, out)
    }

    /// Continue evaluating a packet that came back from the shaper or a
    /// divert socket.
    pub fn process_resumed(
        &self,
        pkt: &PacketDescriptor,
        token: &ResumeToken,
    ) -> Verdict {
        let out = self.check(pkt, Some(token));
        self.dispatch(pkt, out)
    }

    fn dispatch(&self, pkt: &PacketDescriptor, out: Outcome) -> Verdict {
        let Some(rule) = out.rule else {
            return out.verdict;
        };
        let io = &self.providers.io;
        let token = ResumeToken(rule);

        match out.verdict {
            Verdict::ToShaper { id, is_pipe } => {
                io.enqueue_to_shaper(pkt, id, is_pipe, pkt.dir, token);
            }
            Verdict::Divert { port } => {
                io.divert_or_tee(pkt, port, false, token);
            }
            Verdict::Tee { port } => io.divert_or_tee(pkt, port, true, token),
            _ => (),
        }

        out.verdict
    }

    // ================================================================
    // Rule administration
    // ================================================================

    /// Validate and install a rule received from a client.
    pub fn add_rule(&self, bytes: &[u8]) -> Result<RuleHandle, ControlError> {
        let ioc = IocRule::from_bytes(bytes).map_err(|e| {
            ControlError::Validation(ValidationError::from(
                ValidationReason::Decode(e.to_string()),
            ))
        })?;
        self.add_rule_ioc(&ioc)
    }

    /// Validate and install a rule. Rule number 0 asks for the next
    /// free number: `autoinc_step` past the highest one in use.
    pub fn add_rule_ioc(
        &self,
        ioc: &IocRule,
    ) -> Result<RuleHandle, ControlError> {
        let mut next_id = self.ctl.lock();
        let mut chain = RuleChain::clone(&self.chain.load());

        let mut ioc = ioc.clone();
        if ioc.rulenum == 0 {
            let step = self.cfg.autoinc_step;
            let last = chain.last_rulenum().unwrap_or(0);
            ioc.rulenum = if last < DEFAULT_RULENUM - step {
                last + step
            } else {
                last
            };
        }

        let rule = Rule::from_ioc(*next_id, &ioc, self.cfg.verbose_limit)?;
        *next_id += 1;

        let rule = Arc::new(rule);
        let handle = RuleHandle { id: rule.id(), rulenum: rule.rulenum() };

        // A rule added to a disabled set must not create state either.
        let mask = self.set_disable.load(Ordering::SeqCst);
        if mask & bit_on(rule.set()) != 0 {
            rule.disable_state();
        }

        chain.insert(Arc::clone(&rule));
        self.chain.store(chain);
        self.log(LogLevel::Note, &format!("added rule {rule}"));
        Ok(handle)
    }

    /// Remove the rules `select` picks from a copy of the chain,
    /// following the removal order described at the top of this
    /// module. Must be called with `ctl` held.
    fn disable_state_then_flush_then_remove<F>(
        &self,
        select: F,
    ) -> Result<Vec<Arc<Rule>>, ChainError>
    where
        F: FnOnce(&mut RuleChain) -> Result<Vec<Arc<Rule>>, ChainError>,
    {
        let mut chain = RuleChain::clone(&self.chain.load());
        let removed = select(&mut chain)?;
        if removed.is_empty() {
            return Ok(removed);
        }

        self.quiesce(&removed);
        self.chain.store(chain);
        for rule in &removed {
            rule.mark_invalid();
        }

        Ok(removed)
    }

    /// Stop `rules` from creating state and drop the state they own.
    fn quiesce(&self, rules: &[Arc<Rule>]) {
        let stateful: Vec<_> =
            rules.iter().filter(|r| r.creates_state()).collect();
        if stateful.is_empty() {
            return;
        }

        for rule in &stateful {
            rule.disable_state();
        }

        let now = self.now();
        let ids: Vec<u64> = stateful.iter().map(|r| r.id()).collect();
        let n = self.states.flush(|e| ids.contains(&e.rule().id()), now);
        if n > 0 {
            self.log(LogLevel::Note, &format!("flushed {n} dynamic entries"));
        }
    }

    /// Delete every rule numbered `rulenum`.
    pub fn delete_rule(&self, rulenum: u16) -> Result<(), ControlError> {
        let _ctl = self.ctl.lock();
        let removed = self.disable_state_then_flush_then_remove(|chain| {
            chain.delete_by_number(rulenum)
        })?;
        self.log(
            LogLevel::Note,
            &format!("deleted {} rule(s) numbered {rulenum}", removed.len()),
        );
        Ok(())
    }

    /// Delete every rule in `set`. An empty set is not an error.
    pub fn delete_set(&self, set: u8) -> Result<usize, ControlError> {
        if set > MAX_USER_SET {
            return Err(ControlError::InvalidSet(set));
        }

        let _ctl = self.ctl.lock();
        let removed = self.disable_state_then_flush_then_remove(|chain| {
            Ok(chain.delete_by_set(set))
        })?;
        Ok(removed.len())
    }

    /// Delete every rule but the default one. Returns the number of
    /// rules removed.
    pub fn flush(&self) -> usize {
        let _ctl = self.ctl.lock();
        let removed = self
            .disable_state_then_flush_then_remove(|chain| Ok(chain.flush(true)))
            .unwrap_or_default();
        self.log(LogLevel::Note, &format!("flushed {} rule(s)", removed.len()));
        removed.len()
    }

    /// Change set membership or the disabled mask, keeping state
    /// creation consistent with it: a stateful rule that ends up in a
    /// disabled set is quiesced before the change takes effect, and
    /// one that ends up in an enabled set may create state again
    /// afterwards.
    ///
    /// `target` gives the set a rule will be in after the change.
    fn retarget_sets<T, A>(&self, new_mask: u32, target: T, apply: A)
    where
        T: Fn(&Rule) -> u8,
        A: FnOnce(&RuleChain),
    {
        let chain = self.chain.load();
        let stateful =
            chain.select(|r| r.creates_state() && !r.is_invalid());

        let (disabled, enabled): (Vec<_>, Vec<_>) = stateful
            .into_iter()
            .partition(|r| new_mask & bit_on(target(&**r)) != 0);

        self.quiesce(&disabled);
        apply(&*chain);
        for rule in enabled {
            rule.enable_state();
        }
    }

    /// Move every rule numbered `rulenum` to `new_set`. Returns the
    /// number moved; none is not an error.
    pub fn move_rule(
        &self,
        rulenum: u16,
        new_set: u8,
    ) -> Result<usize, ControlError> {
        if rulenum == DEFAULT_RULENUM {
            return Err(ControlError::DefaultRule);
        }
        if new_set > MAX_USER_SET {
            return Err(ControlError::InvalidSet(new_set));
        }

        let _ctl = self.ctl.lock();
        let mask = self.set_disable_mask();
        let mut moved = 0;
        self.retarget_sets(
            mask,
            |r| if r.rulenum() == rulenum { new_set } else { r.set() },
            |chain| moved = chain.move_rule_to_set(rulenum, new_set),
        );
        Ok(moved)
    }

    /// Move every rule of `set` to `new_set`.
    pub fn move_set(
        &self,
        set: u8,
        new_set: u8,
    ) -> Result<usize, ControlError> {
        for s in [set, new_set] {
            if s > MAX_USER_SET {
                return Err(ControlError::InvalidSet(s));
            }
        }

        let _ctl = self.ctl.lock();
        let mask = self.set_disable_mask();
        let mut moved = 0;
        self.retarget_sets(
            mask,
            |r| if r.set() == set { new_set } else { r.set() },
            |chain| moved = chain.move_set_to_set(set, new_set),
        );
        Ok(moved)
    }

    /// Exchange the members of sets `a` and `b`.
    pub fn swap_sets(&self, a: u8, b: u8) -> Result<(), ControlError> {
        for s in [a, b] {
            if s > MAX_USER_SET {
                return Err(ControlError::InvalidSet(s));
            }
        }

        let _ctl = self.ctl.lock();
        let mask = self.set_disable_mask();
        self.retarget_sets(
            mask,
            |r| match r.set() {
                s if s == a => b,
                s if s == b => a,
                s => s,
            },
            |chain| chain.swap_sets(a, b),
        );
        Ok(())
    }

    /// Disable the sets in `disable` and enable those in `enable`;
    /// enabling wins when a set is in both. The default rule's set
    /// cannot be disabled.
    pub fn set_enable(
        &self,
        disable: u32,
        enable: u32,
    ) -> Result<(), ControlError> {
        if disable & bit_on(DEFAULT_SET) != 0 {
            return Err(ControlError::InvalidSet(DEFAULT_SET));
        }

        let _ctl = self.ctl.lock();
        let enable = enable | bit_on(DEFAULT_SET);
        let new_mask = (self.set_disable_mask() | disable) & !enable;

        self.retarget_sets(
            new_mask,
            |r| r.set(),
            |_| self.set_disable.store(new_mask, Ordering::SeqCst),
        );
        Ok(())
    }

    /// Zero the counters of every rule, or of the rules numbered
    /// `rulenum`. With `log_only` only the logging budgets are reset.
    pub fn zero_counters(
        &self,
        rulenum: Option<u16>,
        log_only: bool,
    ) -> Result<(), ControlError> {
        let _ctl = self.ctl.lock();
        let chain = self.chain.load();

        let Some(num) = rulenum else {
            chain.rules().iter().for_each(|r| r.zero(log_only));
            if !log_only {
                self.norule.store(0, Ordering::Relaxed);
            }
            self.log(
                LogLevel::Note,
                if log_only {
                    "logging counts reset"
                } else {
                    "accounting cleared"
                },
            );
            return Ok(());
        };

        let mut found = false;
        for rule in chain.rules().iter().filter(|r| r.rulenum() == num) {
            rule.zero(log_only);
            found = true;
        }

        if !found {
            return Err(ControlError::RuleNotFound(num));
        }
        Ok(())
    }

    // ================================================================
    // Dynamic state administration
    // ================================================================

    /// Remove every dynamic entry.
    pub fn flush_states(&self) -> u32 {
        let _ctl = self.ctl.lock();
        self.states.flush_all(self.now())
    }

    /// Change the number of state table buckets. Applied the next time
    /// the table is empty.
    pub fn set_dyn_buckets(&self, n: u32) -> Result<(), ControlError> {
        if !self.states.set_buckets(n) {
            return Err(ControlError::InvalidBuckets(n));
        }
        Ok(())
    }

    /// Expire old state and send keepalives.
    pub fn tick(&self) -> TickReport {
        let now = self.now();
        let expired = self.states.age_sweep(now);
        let probed =
            self.states.keepalive_tick(self.providers.io.as_ref(), now);
        TickReport { expired, probed }
    }

    /// Run [`Firewall::tick`] in the background every keepalive
    /// period, until the returned handle is dropped.
    pub fn start_timers(self: &Arc<Self>) -> Periodic {
        let fw = Arc::clone(self);
        let period =
            Duration::from_secs(u64::from(self.cfg.dyn_keepalive_period));
        Periodic::new(&format!("{}-tick", self.name), period, move || {
            fw.tick();
        })
    }

    // ================================================================
    // Snapshots
    // ================================================================

    pub fn get_rules_snapshot(&self) -> DumpRulesResp {
        let chain = self.chain.load();
        DumpRulesResp::new(
            self.set_disable_mask(),
            chain.rules().iter().map(|r| r.dump()).collect(),
        )
    }

    pub fn get_dynamic_snapshot(&self) -> DumpStatesResp {
        DumpStatesResp::new(self.states.dump(self.now()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::FixedRandom;
    use crate::provider::ManualClock;
    use crate::provider::RecordingIo;
    use crate::provider::RecordingLog;
    use crate::engine::dyn_state::StateError;
    use crate::engine::dyn_state::StateKind;
    use core::net::Ipv4Addr;
    use ipfw_api::Cmd;
    use ipfw_api::Direction;
    use ipfw_api::FlowId;
    use ipfw_api::IPPROTO_UDP;
    use ipfw_api::RuleBuilder;

    fn fw() -> (Firewall, RecordingLog) {
        let log = RecordingLog::default();
        let providers = Providers {
            log: Box::new(log.clone()),
            clock: Arc::new(ManualClock::default()),
            rand: Box::new(FixedRandom::new(7)),
            io: Arc::new(RecordingIo::default()),
        };
        (Firewall::new("fw0", FwConfig::default(), providers).unwrap(), log)
    }

    #[test]
    fn autoinc_numbering() {
        let (fw, log) = fw();
        let add = |n| {
            fw.add_rule_ioc(&RuleBuilder::new(n, Cmd::Accept).finalize())
                .unwrap()
                .rulenum
        };

        assert_eq!(add(0), 100);
        assert_eq!(add(0), 200);
        assert_eq!(add(65500), 65500);
        // No room for another step below the default rule.
        assert_eq!(add(0), 65500);
        assert_eq!(fw.rule_count(), 5);
        assert_eq!(log.count(LogLevel::Note, "fw0: added rule 00100"), 1);
    }

    #[test]
    fn default_set_cannot_be_disabled() {
        let (fw, _) = fw();
        assert_eq!(
            fw.set_enable(1 << DEFAULT_SET, 0),
            Err(ControlError::InvalidSet(DEFAULT_SET))
        );
        fw.set_enable(0b110, 0).unwrap();
        fw.set_enable(0b001, 0b010).unwrap();
        assert_eq!(fw.set_disable_mask(), 0b101);
    }

    #[test]
    fn bad_bytes_are_a_validation_error() {
        let (fw, _) = fw();
        assert!(matches!(
            fw.add_rule(&[0xff, 0xff, 0xff]),
            Err(ControlError::Validation(ValidationError {
                reason: ValidationReason::Decode(_)
            }))
        ));
        assert_eq!(fw.rule_count(), 1);
    }

    #[test]
    fn removed_rule_refuses_late_install() {
        let (fw, _) = fw();
        let rule = RuleBuilder::new(100, Cmd::Accept).keep_state().finalize();
        fw.add_rule_ioc(&rule).unwrap();

        // What an evaluation that loaded the chain before the delete
        // still holds.
        let held = Arc::clone(&fw.chain.load().rules()[0]);
        fw.delete_rule(100).unwrap();

        let flow = FlowId::new(
            IPPROTO_UDP,
            Ipv4Addr::new(10, 0, 0, 1),
            1000,
            Ipv4Addr::new(10, 0, 0, 2),
            53,
        );
        let pkt = PacketDescriptor::new(flow, Direction::In, 40);
        assert_eq!(
            fw.states.install(&pkt, StateKind::KeepState, &held, fw.now()),
            Err(StateError::CreationDisabled { rulenum: 100 })
        );
        assert!(held.is_invalid());
        assert_eq!(fw.state_count(), 0);
    }
}
