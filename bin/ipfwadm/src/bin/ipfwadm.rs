// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use clap::Parser;
use ipfw::FwConfig;
use ipfw::print::print_rules;
use ipfw::print::print_states;
use ipfwadm::IpfwAdm;
use ipfwadm::StepResult;
use tabwriter::TabWriter;

/// Administer an ipfw-style packet filter
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Validate an engine configuration and print it in full.
    CheckConfig {
        /// TOML configuration file.
        config: PathBuf,
    },

    /// Load a ruleset and print the resulting rule chain.
    ShowRules {
        #[command(flatten)]
        cfg: ConfigArg,

        /// RON list of rules.
        rules: PathBuf,
    },

    /// Run a traffic scenario and print each verdict, the rule
    /// counters and the dynamic state left behind.
    Simulate {
        #[command(flatten)]
        cfg: ConfigArg,

        /// RON scenario: rules plus steps.
        scenario: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ConfigArg {
    /// TOML configuration file; defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ConfigArg {
    fn load(&self) -> anyhow::Result<FwConfig> {
        match &self.config {
            Some(path) => Ok(ipfwadm::load_config(path)?),
            None => Ok(FwConfig::default()),
        }
    }
}

fn open(cfg: &ConfigArg) -> anyhow::Result<IpfwAdm> {
    let log = ipfwadm::logger();
    IpfwAdm::open(cfg.load()?, &log).context("failed to start firewall")
}

fn simulate(adm: &IpfwAdm, path: &Path) -> anyhow::Result<()> {
    let scenario = ipfwadm::load_scenario(path)?;
    adm.add_rules(&scenario.rules)?;

    let mut t = TabWriter::new(std::io::stdout());
    writeln!(t, "STEP\tDIR\tFLOW\tRESULT")?;
    for (i, step) in scenario.steps.iter().enumerate() {
        match adm.run_step(step).with_context(|| format!("step {i}"))? {
            StepResult::Verdict { flow, dir, verdict } => {
                writeln!(t, "{i}\t{dir}\t{flow}\t{verdict}")?;
            }
            StepResult::Advanced(secs) => {
                writeln!(t, "{i}\t\t\tclock +{secs}s")?;
            }
            StepResult::Ticked(rep) => {
                writeln!(
                    t,
                    "{i}\t\t\texpired {} probed {}",
                    rep.expired, rep.probed
                )?;
            }
            StepResult::Done => writeln!(t, "{i}\t\t\tok")?,
        }
    }
    t.flush()?;

    println!();
    print_rules(&adm.dump_rules()?)?;
    println!();
    print_states(&adm.dump_states()?)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::CheckConfig { config } => {
            let cfg = ipfwadm::load_config(&config)?;
            let pretty = ron::ser::PrettyConfig::default();
            println!("{}", ron::ser::to_string_pretty(&cfg, pretty)?);
        }

        Command::ShowRules { cfg, rules } => {
            let adm = open(&cfg)?;
            adm.add_rules(&ipfwadm::load_rules(&rules)?)?;
            print_rules(&adm.dump_rules()?)?;
        }

        Command::Simulate { cfg, scenario } => {
            let adm = open(&cfg)?;
            simulate(&adm, &scenario)?;
        }
    }

    Ok(())
}
