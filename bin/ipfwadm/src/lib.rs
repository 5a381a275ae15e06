// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Packet filter administration library.
//!
//! Rulesets and traffic scenarios are written in RON and run against
//! an in-process [`Firewall`]. Rules cross into the engine in their
//! encoded form and snapshots come back encoded, the same path an
//! out-of-process client would take.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use ipfw::ConfigError;
use ipfw::ControlError;
use ipfw::Firewall;
use ipfw::FwConfig;
use ipfw::PacketDescriptor;
use ipfw::ResumeToken;
use ipfw::TickReport;
use ipfw::Verdict;
use ipfw::api::Cmd;
use ipfw::api::Direction;
use ipfw::api::DumpRulesResp;
use ipfw::api::DumpStatesResp;
use ipfw::api::FlowId;
use ipfw::api::Insn;
use ipfw::api::RuleBuilder;
use ipfw::api::TcpFlags;
use ipfw::api::decode_resp;
use ipfw::ddi::time::Moment;
use ipfw::provider::Clock;
use ipfw::provider::PacketIo;
use ipfw::provider::Providers;
use ipfw::provider::SlogLog;
use ipfw::provider::ThreadRandom;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Logger;
use slog::info;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {err}")]
    Io { path: String, err: std::io::Error },

    #[error("failed to parse {path}: {err}")]
    Ron { path: String, err: ron::error::SpannedError },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("failed to encode rule {rulenum}: {err}")]
    Encode { rulenum: u16, err: postcard::Error },

    #[error("failed to decode response: {0}")]
    Decode(postcard::Error),
}

/// One rule of a ruleset file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuleDef {
    /// Zero picks the next free number.
    #[serde(default)]
    pub rulenum: u16,
    #[serde(default)]
    pub set: u8,
    #[serde(default)]
    pub matches: Vec<Insn>,
    /// Log matches, at most this many times.
    #[serde(default)]
    pub log: Option<u32>,
    pub action: Cmd,
}

impl RuleDef {
    pub fn build(&self) -> RuleBuilder {
        let mut b = RuleBuilder::new(self.rulenum, self.action.clone())
            .set(self.set);
        for m in &self.matches {
            b = b.add_match(m.clone());
        }
        if let Some(max_log) = self.log {
            b = b.log(max_log);
        }
        b
    }
}

/// One step of a traffic scenario.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Step {
    /// Run a packet through the filter.
    Packet(PacketDescriptor),
    /// Move the clock forward, in seconds.
    Advance(u64),
    /// Run the aging and keepalive timer once.
    Tick,
    /// Delete every rule with this number.
    Delete(u16),
    /// Change which sets are disabled.
    SetEnable { disable: u32, enable: u32 },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Scenario {
    #[serde(default)]
    pub rules: Vec<RuleDef>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// What a scenario step produced.
#[derive(Clone, Debug)]
pub enum StepResult {
    Verdict { flow: FlowId, dir: Direction, verdict: Verdict },
    Advanced(u64),
    Ticked(TickReport),
    Done,
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| Error::Io {
        path: path.display().to_string(),
        err,
    })
}

fn parse_ron<T: for<'de> Deserialize<'de>>(
    path: &Path,
    contents: &str,
) -> Result<T, Error> {
    ron::from_str(contents).map_err(|err| Error::Ron {
        path: path.display().to_string(),
        err,
    })
}

/// Load an engine configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<FwConfig, Error> {
    Ok(FwConfig::from_toml(&read(path)?)?)
}

/// Load a ruleset: a RON list of [`RuleDef`].
pub fn load_rules(path: &Path) -> Result<Vec<RuleDef>, Error> {
    parse_ron(path, &read(path)?)
}

pub fn load_scenario(path: &Path) -> Result<Scenario, Error> {
    parse_ron(path, &read(path)?)
}

/// Build the root logger. `RUST_LOG` selects the level.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!())
}

/// A clock that starts at zero and only moves when a scenario says so.
#[derive(Default)]
pub struct SimClock(AtomicU64);

impl SimClock {
    pub fn advance(&self, d: Duration) {
        self.0.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn current_time(&self) -> Moment {
        Moment::from_millis(self.0.load(Ordering::SeqCst))
    }
}

/// Packet output has nowhere to go here; note it in the log instead.
pub struct LogIo(pub Logger);

impl PacketIo for LogIo {
    fn send_reset_or_icmp_unreachable(
        &self,
        pkt: &PacketDescriptor,
        code: u16,
    ) {
        info!(self.0, "reject"; "flow" => %pkt.flow_id, "code" => code);
    }

    fn send_tcp_probe(
        &self,
        flow: &FlowId,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
    ) {
        info!(self.0, "keepalive";
            "flow" => %flow, "seq" => seq, "ack" => ack,
            "flags" => ?flags);
    }

    fn enqueue_to_shaper(
        &self,
        pkt: &PacketDescriptor,
        id: u16,
        is_pipe: bool,
        dir: Direction,
        token: ResumeToken,
    ) {
        info!(self.0, "to shaper";
            "flow" => %pkt.flow_id, "id" => id, "pipe" => is_pipe,
            "dir" => %dir, "rule" => token.rulenum());
    }

    fn divert_or_tee(
        &self,
        pkt: &PacketDescriptor,
        port: u16,
        tee: bool,
        token: ResumeToken,
    ) {
        info!(self.0, "divert";
            "flow" => %pkt.flow_id, "port" => port, "tee" => tee,
            "rule" => token.rulenum());
    }
}

/// The handle used to administer an in-process firewall.
pub struct IpfwAdm {
    fw: Firewall,
    clock: Arc<SimClock>,
}

impl IpfwAdm {
    pub fn open(cfg: FwConfig, log: &Logger) -> Result<Self, Error> {
        let clock = Arc::new(SimClock::default());
        let providers = Providers {
            log: Box::new(SlogLog(log.new(slog::o!("component" => "ipfw")))),
            clock: clock.clone(),
            rand: Box::new(ThreadRandom),
            io: Arc::new(LogIo(log.new(slog::o!("component" => "io")))),
        };
        let fw = Firewall::new("ipfw0", cfg, providers)?;
        Ok(Self { fw, clock })
    }

    pub fn firewall(&self) -> &Firewall {
        &self.fw
    }

    /// Encode and install every rule, stopping at the first refusal.
    pub fn add_rules(&self, rules: &[RuleDef]) -> Result<(), Error> {
        for def in rules {
            let ioc = def.build().finalize();
            let bytes = ioc.to_bytes().map_err(|err| Error::Encode {
                rulenum: def.rulenum,
                err,
            })?;
            self.fw.add_rule(&bytes)?;
        }
        Ok(())
    }

    pub fn dump_rules(&self) -> Result<DumpRulesResp, Error> {
        decode_resp(&self.fw.dump_rules()?).map_err(Error::Decode)
    }

    pub fn dump_states(&self) -> Result<DumpStatesResp, Error> {
        decode_resp(&self.fw.dump_states()?).map_err(Error::Decode)
    }

    pub fn run_step(&self, step: &Step) -> Result<StepResult, Error> {
        let res = match step {
            Step::Packet(pkt) => StepResult::Verdict {
                flow: pkt.flow_id,
                dir: pkt.dir,
                verdict: self.fw.process(pkt),
            },
            Step::Advance(secs) => {
                self.clock.advance(Duration::from_secs(*secs));
                StepResult::Advanced(*secs)
            }
            Step::Tick => StepResult::Ticked(self.fw.tick()),
            Step::Delete(rulenum) => {
                self.fw.delete_rule(*rulenum)?;
                StepResult::Done
            }
            Step::SetEnable { disable, enable } => {
                self.fw.set_enable(*disable, *enable)?;
                StepResult::Done
            }
        };
        Ok(res)
    }
}
