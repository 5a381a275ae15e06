// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The ordered list of static rules.
//!
//! A [`RuleChain`] value is never mutated once published. The control
//! plane clones the current chain, edits the clone and publishes it as
//! a whole; packets being evaluated keep using the snapshot they
//! started with. Cloning resets the `next_rule` memo, which is how
//! every change of shape invalidates it.

use super::rule::Rule;
use ipfw_api::Cmd;
use ipfw_api::DEFAULT_RULENUM;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainError {
    RuleNotFound(u16),
    DefaultRule,
}

pub struct RuleChain {
    rules: Vec<Arc<Rule>>,
    // Memoized `next_rule_after()` per position.
    next: Vec<OnceLock<usize>>,
    by_id: HashMap<u64, usize>,
    generation: u64,
}

impl Clone for RuleChain {
    fn clone(&self) -> Self {
        let mut chain = Self {
            rules: self.rules.clone(),
            next: Vec::new(),
            by_id: HashMap::new(),
            generation: self.generation,
        };
        chain.flush_rule_ptrs();
        chain
    }
}

impl RuleChain {
    pub fn new(default_rule: Arc<Rule>) -> Self {
        let mut chain = Self {
            rules: vec![default_rule],
            next: Vec::new(),
            by_id: HashMap::new(),
            generation: 0,
        };
        chain.flush_rule_ptrs();
        chain
    }

    /// Drop every memoized jump target and rebuild the id index. Must
    /// follow any change to the order or membership of `rules`.
    fn flush_rule_ptrs(&mut self) {
        self.next = (0..self.rules.len()).map(|_| OnceLock::new()).collect();
        self.by_id = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id(), i))
            .collect();
    }

    fn changed(&mut self) {
        self.flush_rule_ptrs();
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Only true after `flush(false)` at teardown.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<Rule>> {
        self.rules.get(idx)
    }

    pub fn default_rule(&self) -> Option<&Arc<Rule>> {
        self.rules.last().filter(|r| r.is_default())
    }

    pub fn index_of(&self, rule: &Rule) -> Option<usize> {
        self.by_id.get(&rule.id()).copied()
    }

    /// Position of the first rule numbered strictly above `rulenum`.
    pub fn first_after_num(&self, rulenum: u16) -> Option<usize> {
        let idx = self.rules.partition_point(|r| r.rulenum() <= rulenum);
        (idx < self.rules.len()).then_some(idx)
    }

    /// Where evaluation continues after the rule at `idx` declines to
    /// decide: the first later rule numbered at or above the target of
    /// a `skipto`, otherwise the next rule. Returns `len()` when there
    /// is none.
    pub fn next_rule_after(&self, idx: usize) -> usize {
        let Some(slot) = self.next.get(idx) else {
            return self.rules.len();
        };

        *slot.get_or_init(|| {
            let rule = &self.rules[idx];
            match rule.action() {
                Cmd::Skipto(target) => {
                    let target = *target;
                    self.rules[idx + 1..]
                        .iter()
                        .position(|r| r.rulenum() >= target)
                        .map(|off| idx + 1 + off)
                        .unwrap_or(self.rules.len())
                }
                _ => idx + 1,
            }
        })
    }

    /// Insert in ascending rule number order, after any rules that
    /// already carry the same number.
    pub fn insert(&mut self, rule: Arc<Rule>) -> usize {
        let pos = self.rules.partition_point(|r| r.rulenum() <= rule.rulenum());
        self.rules.insert(pos, rule);
        self.changed();
        pos
    }

    /// The highest number in use below the default rule, if any.
    pub fn last_rulenum(&self) -> Option<u16> {
        self.rules
            .iter()
            .rev()
            .map(|r| r.rulenum())
            .find(|n| *n != DEFAULT_RULENUM)
    }

    /// Rules selected by `pred`, excluding the default rule.
    pub fn select<P>(&self, pred: P) -> Vec<Arc<Rule>>
    where
        P: Fn(&Rule) -> bool,
    {
        self.rules
            .iter()
            .filter(|r| !r.is_default() && pred(r))
            .cloned()
            .collect()
    }

    fn remove_where<P>(&mut self, pred: P) -> Vec<Arc<Rule>>
    where
        P: Fn(&Rule) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .rules
            .drain(..)
            .partition(|r| !r.is_default() && pred(r));
        self.rules = kept;
        if !removed.is_empty() {
            self.changed();
        }
        removed
    }

    /// Remove every rule numbered `rulenum`.
    pub fn delete_by_number(
        &mut self,
        rulenum: u16,
    ) -> Result<Vec<Arc<Rule>>, ChainError> {
        if rulenum == DEFAULT_RULENUM {
            return Err(ChainError::DefaultRule);
        }

        let removed = self.remove_where(|r| r.rulenum() == rulenum);
        if removed.is_empty() {
            return Err(ChainError::RuleNotFound(rulenum));
        }
        Ok(removed)
    }

    pub fn delete_by_set(&mut self, set: u8) -> Vec<Arc<Rule>> {
        self.remove_where(|r| r.set() == set)
    }

    /// Remove every rule, keeping the default rule unless told not to.
    pub fn flush(&mut self, keep_default: bool) -> Vec<Arc<Rule>> {
        let mut removed = self.remove_where(|_| true);
        if !keep_default {
            removed.extend(self.rules.drain(..));
            self.changed();
        }
        removed
    }

    // Set membership is not part of the chain's shape, so the moves
    // below leave the memo and generation alone.

    pub fn move_rule_to_set(&self, rulenum: u16, new_set: u8) -> usize {
        let moved = self.select(|r| r.rulenum() == rulenum);
        moved.iter().for_each(|r| r.set_set(new_set));
        moved.len()
    }

    pub fn move_set_to_set(&self, set: u8, new_set: u8) -> usize {
        let moved = self.select(|r| r.set() == set);
        moved.iter().for_each(|r| r.set_set(new_set));
        moved.len()
    }

    pub fn swap_sets(&self, a: u8, b: u8) {
        for r in self.rules.iter().filter(|r| !r.is_default()) {
            if r.set() == a {
                r.set_set(b);
            } else if r.set() == b {
                r.set_set(a);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::rule::DefaultAction;
    use ipfw_api::RuleBuilder;

    fn rule(id: u64, rulenum: u16, set: u8, action: Cmd) -> Arc<Rule> {
        let ioc = RuleBuilder::new(rulenum, action).set(set).finalize();
        Arc::new(Rule::from_ioc(id, &ioc, 0).unwrap())
    }

    fn chain() -> RuleChain {
        RuleChain::new(Arc::new(Rule::new_default(0, DefaultAction::Deny)))
    }

    fn nums(c: &RuleChain) -> Vec<(u64, u16)> {
        c.rules().iter().map(|r| (r.id(), r.rulenum())).collect()
    }

    #[test]
    fn insert_orders_and_keeps_ties_stable() {
        let mut c = chain();
        c.insert(rule(1, 200, 0, Cmd::Accept));
        c.insert(rule(2, 100, 0, Cmd::Accept));
        c.insert(rule(3, 200, 0, Cmd::Deny));
        c.insert(rule(4, 150, 0, Cmd::Count));

        assert_eq!(
            nums(&c),
            vec![(2, 100), (4, 150), (1, 200), (3, 200), (0, DEFAULT_RULENUM)]
        );
        assert_eq!(c.generation(), 4);
        assert_eq!(c.last_rulenum(), Some(200));
        assert_eq!(c.first_after_num(150), Some(2));
        assert_eq!(c.first_after_num(200), Some(4));
        assert_eq!(c.first_after_num(DEFAULT_RULENUM), None);
    }

    #[test]
    fn skipto_targets() {
        let mut c = chain();
        c.insert(rule(1, 100, 0, Cmd::Skipto(200)));
        c.insert(rule(2, 150, 0, Cmd::Accept));
        c.insert(rule(3, 300, 0, Cmd::Accept));
        c.insert(rule(4, 50, 0, Cmd::Skipto(10)));

        // 50 -> first later rule >= 10 is simply the next one.
        assert_eq!(c.next_rule_after(0), 1);
        // 100 -> no rule 200, so 300.
        assert_eq!(c.next_rule_after(1), 3);
        assert_eq!(c.next_rule_after(2), 3);
        // The memo survives a second lookup.
        assert_eq!(c.next_rule_after(1), 3);

        // A clone is a fresh chain: adding rule 200 must be honored.
        let mut c2 = c.clone();
        c2.insert(rule(5, 200, 0, Cmd::Accept));
        assert_eq!(c2.next_rule_after(1), 3);
        assert_eq!(c2.rules()[3].rulenum(), 200);
        assert_eq!(c.next_rule_after(1), 3);
        assert_eq!(c.rules()[3].rulenum(), 300);
    }

    #[test]
    fn deletes_and_sets() {
        let mut c = chain();
        c.insert(rule(1, 100, 1, Cmd::Accept));
        c.insert(rule(2, 100, 2, Cmd::Accept));
        c.insert(rule(3, 200, 2, Cmd::Accept));
        c.insert(rule(4, 300, 3, Cmd::Accept));

        assert_eq!(
            c.delete_by_number(DEFAULT_RULENUM).unwrap_err(),
            ChainError::DefaultRule
        );
        assert_eq!(
            c.delete_by_number(150).unwrap_err(),
            ChainError::RuleNotFound(150)
        );
        assert_eq!(c.delete_by_number(100).unwrap().len(), 2);

        assert_eq!(c.move_set_to_set(2, 5), 1);
        assert!(c.delete_by_set(2).is_empty());
        c.swap_sets(5, 3);
        assert_eq!(c.rules()[0].set(), 3);
        assert_eq!(c.rules()[1].set(), 5);
        assert_eq!(c.move_rule_to_set(9999, 1), 0);

        assert_eq!(c.delete_by_set(5).len(), 1);
        assert_eq!(c.flush(true).len(), 1);
        assert_eq!(nums(&c), vec![(0, DEFAULT_RULENUM)]);
        assert!(c.default_rule().is_some());
        assert_eq!(c.flush(false).len(), 1);
        assert!(c.is_empty());
    }
}
