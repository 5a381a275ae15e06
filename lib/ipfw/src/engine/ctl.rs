// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Administrative requests, as they arrive from a client.

use super::chain::ChainError;
use super::firewall::Firewall;
use super::rule::ValidationError;
use ipfw_api::DelCmd;
use ipfw_api::SetEnableReq;
use ipfw_api::ZeroReq;
use ipfw_api::encode_resp;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ControlError {
    #[error("no rule numbered {0}")]
    RuleNotFound(u16),

    #[error("invalid set {0}")]
    InvalidSet(u8),

    #[error("the default rule cannot be changed")]
    DefaultRule,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid number of buckets {0}")]
    InvalidBuckets(u32),

    #[error("failed to encode response: {0}")]
    Encode(String),
}

impl From<ChainError> for ControlError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::RuleNotFound(n) => Self::RuleNotFound(n),
            ChainError::DefaultRule => Self::DefaultRule,
        }
    }
}

impl Firewall {
    /// Carry out a delete, move or swap request.
    pub fn handle_del(&self, cmd: DelCmd) -> Result<(), ControlError> {
        match cmd {
            DelCmd::Rule { rulenum } => self.delete_rule(rulenum),
            DelCmd::Set { set } => self.delete_set(set).map(|_| ()),
            DelCmd::MoveRule { rulenum, new_set } => {
                self.move_rule(rulenum, new_set).map(|_| ())
            }
            DelCmd::MoveSet { set, new_set } => {
                self.move_set(set, new_set).map(|_| ())
            }
            DelCmd::SwapSets { set, new_set } => self.swap_sets(set, new_set),
        }
    }

    pub fn handle_zero(&self, req: ZeroReq) -> Result<(), ControlError> {
        self.zero_counters(req.rulenum, req.log_only)
    }

    pub fn handle_set_enable(
        &self,
        req: SetEnableReq,
    ) -> Result<(), ControlError> {
        self.set_enable(req.disable_mask, req.enable_mask)
    }

    /// The rule snapshot, encoded for a client.
    pub fn dump_rules(&self) -> Result<Vec<u8>, ControlError> {
        encode_resp(&self.get_rules_snapshot())
            .map_err(|e| ControlError::Encode(e.to_string()))
    }

    /// The dynamic state snapshot, encoded for a client.
    pub fn dump_states(&self) -> Result<Vec<u8>, ControlError> {
        encode_resp(&self.get_dynamic_snapshot())
            .map_err(|e| ControlError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::FwConfig;
    use crate::provider::FixedRandom;
    use crate::provider::ManualClock;
    use crate::provider::Providers;
    use crate::provider::RecordingIo;
    use crate::provider::RecordingLog;
    use ipfw_api::Cmd;
    use ipfw_api::DumpRulesResp;
    use ipfw_api::RuleBuilder;
    use ipfw_api::decode_resp;
    use std::sync::Arc;

    fn fw() -> Firewall {
        let providers = Providers {
            log: Box::new(RecordingLog::default()),
            clock: Arc::new(ManualClock::default()),
            rand: Box::new(FixedRandom::new(1)),
            io: Arc::new(RecordingIo::default()),
        };
        Firewall::new("fw0", FwConfig::default(), providers).unwrap()
    }

    #[test]
    fn del_requests() {
        let fw = fw();
        for n in [100, 200, 300] {
            let rule = RuleBuilder::new(n, Cmd::Accept).set(3).finalize();
            fw.add_rule_ioc(&rule).unwrap();
        }

        fw.handle_del(DelCmd::Rule { rulenum: 100 }).unwrap();
        assert_eq!(
            fw.handle_del(DelCmd::Rule { rulenum: 100 }),
            Err(ControlError::RuleNotFound(100))
        );
        assert_eq!(
            fw.handle_del(DelCmd::Rule { rulenum: 65535 }),
            Err(ControlError::DefaultRule)
        );

        fw.handle_del(DelCmd::MoveRule { rulenum: 200, new_set: 4 }).unwrap();
        fw.handle_del(DelCmd::Set { set: 3 }).unwrap();
        let rules = fw.get_rules_snapshot().rules;
        assert_eq!(rules.len(), 2);
        assert_eq!((rules[0].rule.rulenum, rules[0].rule.set), (200, 4));

        assert_eq!(
            fw.handle_del(DelCmd::MoveSet { set: 4, new_set: 31 }),
            Err(ControlError::InvalidSet(31))
        );
    }

    #[test]
    fn encoded_dump_decodes() {
        let fw = fw();
        let req = SetEnableReq { disable_mask: 0b10, enable_mask: 0 };
        fw.handle_set_enable(req).unwrap();
        let bytes = fw.dump_rules().unwrap();
        let resp: DumpRulesResp = decode_resp(&bytes).unwrap();
        assert_eq!(resp.set_disable, 0b10);
        assert_eq!(resp.rules.len(), 1);
        assert!(resp.rules[0].is_default());

        assert_eq!(
            fw.handle_zero(ZeroReq { rulenum: Some(7), log_only: false }),
            Err(ControlError::RuleNotFound(7))
        );
    }
}
