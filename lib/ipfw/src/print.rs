// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print snapshots in a human-friendly manner.
//!
//! Shared by ipfwadm and the integration tests.

use ipfw_api::Cmd;
use ipfw_api::DEFAULT_SET;
use ipfw_api::DumpRulesResp;
use ipfw_api::DumpStatesResp;
use ipfw_api::IocRule;
use ipfw_api::RuleDump;
use ipfw_api::StateDump;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpRulesResp`].
pub fn print_rules(resp: &DumpRulesResp) -> std::io::Result<()> {
    print_rules_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpRulesResp`] into a given writer.
pub fn print_rules_into(
    writer: &mut impl Write,
    resp: &DumpRulesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    let disabled: Vec<String> = (0..DEFAULT_SET)
        .filter(|s| resp.set_disable & (1 << s) != 0)
        .map(|s| s.to_string())
        .collect();
    if !disabled.is_empty() {
        writeln!(t, "Disabled sets: {}", disabled.join(" "))?;
    }

    print_rule_header(&mut t)?;
    for rule in &resp.rules {
        print_rule(&mut t, rule)?;
    }
    t.flush()
}

/// Print the header for the [`print_rule()`] output.
pub fn print_rule_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "NUM\tSET\tPKTS\tBYTES\tLAST\tBODY")
}

/// Print one rule and its counters.
pub fn print_rule(
    t: &mut impl Write,
    rule: &RuleDump,
) -> std::io::Result<()> {
    writeln!(
        t,
        "{:05}\t{}\t{}\t{}\t{}\t{}",
        rule.rule.rulenum,
        rule.rule.set,
        rule.pkt_cnt,
        rule.byte_cnt,
        rule.timestamp,
        rule_body(&rule.rule),
    )
}

/// The instructions of `rule` as text. The implicit `probe-state` the
/// builder adds to stateful rules is left out.
pub fn rule_body(rule: &IocRule) -> String {
    match rule.insns() {
        Ok(insns) => insns
            .iter()
            .filter(|(_, i)| !matches!(i.cmd, Cmd::ProbeState))
            .map(|(_, i)| i.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        Err(e) => format!("<{e}>"),
    }
}

/// Print a [`DumpStatesResp`].
pub fn print_states(resp: &DumpStatesResp) -> std::io::Result<()> {
    print_states_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpStatesResp`] into a given writer.
pub fn print_states_into(
    writer: &mut impl Write,
    resp: &DumpStatesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Dynamic states: {}", resp.states.len())?;
    print_state_header(&mut t)?;
    for state in &resp.states {
        print_state(&mut t, state)?;
    }
    t.flush()
}

pub fn print_state_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "RULE\tTYPE\tEXPIRE\tPKTS\tBYTES\tTCP\tCOUNT\tFLOW")
}

pub fn print_state(
    t: &mut impl Write,
    state: &StateDump,
) -> std::io::Result<()> {
    writeln!(
        t,
        "{:05}\t{}\t{}s\t{}\t{}\t0x{:04x}\t{}\t{}",
        state.rulenum,
        state.dyn_type,
        state.expire_in,
        state.pkt_cnt,
        state.byte_cnt,
        state.tcp_state,
        state.limit_count,
        state.id,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use ipfw_api::RuleBuilder;

    #[test]
    fn rules_table() {
        let rule = RuleBuilder::new(100, Cmd::Accept)
            .add_match(Cmd::Proto(6))
            .keep_state()
            .finalize();
        let resp = DumpRulesResp::new(
            1 << 4,
            vec![RuleDump { rule, pkt_cnt: 3, byte_cnt: 180, timestamp: 9 }],
        );

        let mut out = Vec::new();
        print_rules_into(&mut out, &resp).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Disabled sets: 4");
        assert!(lines[1].starts_with("NUM"));
        assert!(lines[2].starts_with("00100"));
        assert!(!lines[2].contains("probe-state"));
    }
}
