// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Lifetimes are in seconds.

use crate::ddi::time::Ttl;
use crate::engine::dyn_state::DYN_DEF_BUCKETS;
use crate::engine::dyn_state::DYN_DEF_MAX;
use crate::engine::dyn_state::DYN_MAX_BUCKETS;
use crate::engine::dyn_state::DynConfig;
use crate::engine::rule::DefaultAction;
use crate::engine::tcp_state::Lifetimes;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub const AUTOINC_STEP_MAX: u16 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("autoinc_step must be between 1 and 1000, got {0}")]
    AutoincStep(u16),

    #[error(
        "dyn_buckets must be a power of two no larger than {max}, got {got}"
    )]
    DynBuckets { got: u32, max: u32 },

    #[error("dyn_max must be non-zero")]
    DynMax,

    #[error("{what} must be non-zero")]
    ZeroLifetime { what: &'static str },

    #[error("{shorter} ({a}s) must be {rel} {longer} ({b}s)")]
    LifetimeOrder {
        shorter: &'static str,
        a: u32,
        rel: &'static str,
        longer: &'static str,
        b: u32,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FwConfig {
    /// Action of the default rule.
    pub default_action: DefaultAction,
    /// Accept packets coming back from the shaper or a divert socket
    /// instead of resuming evaluation.
    pub one_pass: bool,
    /// Honor `log` instructions.
    pub verbose: bool,
    /// Log budget of a `log` instruction without its own.
    pub verbose_limit: u32,
    /// Gap left between automatically numbered rules.
    pub autoinc_step: u16,
    pub dyn_buckets: u32,
    pub dyn_max: u32,
    pub dyn_ack_lifetime: u32,
    pub dyn_syn_lifetime: u32,
    pub dyn_fin_lifetime: u32,
    pub dyn_rst_lifetime: u32,
    pub dyn_udp_lifetime: u32,
    pub dyn_short_lifetime: u32,
    pub dyn_keepalive: bool,
    pub dyn_keepalive_interval: u32,
    pub dyn_keepalive_period: u32,
}

impl Default for FwConfig {
    fn default() -> Self {
        Self {
            default_action: DefaultAction::Deny,
            one_pass: false,
            verbose: false,
            verbose_limit: 0,
            autoinc_step: 100,
            dyn_buckets: DYN_DEF_BUCKETS,
            dyn_max: DYN_DEF_MAX,
            dyn_ack_lifetime: 300,
            dyn_syn_lifetime: 20,
            dyn_fin_lifetime: 1,
            dyn_rst_lifetime: 1,
            dyn_udp_lifetime: 10,
            dyn_short_lifetime: 5,
            dyn_keepalive: true,
            dyn_keepalive_interval: 20,
            dyn_keepalive_period: 5,
        }
    }
}

impl FwConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autoinc_step == 0 || self.autoinc_step > AUTOINC_STEP_MAX {
            return Err(ConfigError::AutoincStep(self.autoinc_step));
        }

        if !self.dyn_buckets.is_power_of_two()
            || self.dyn_buckets > DYN_MAX_BUCKETS
        {
            return Err(ConfigError::DynBuckets {
                got: self.dyn_buckets,
                max: DYN_MAX_BUCKETS,
            });
        }

        if self.dyn_max == 0 {
            return Err(ConfigError::DynMax);
        }

        for (what, val) in [
            ("dyn_ack_lifetime", self.dyn_ack_lifetime),
            ("dyn_syn_lifetime", self.dyn_syn_lifetime),
            ("dyn_fin_lifetime", self.dyn_fin_lifetime),
            ("dyn_rst_lifetime", self.dyn_rst_lifetime),
            ("dyn_udp_lifetime", self.dyn_udp_lifetime),
            ("dyn_short_lifetime", self.dyn_short_lifetime),
            ("dyn_keepalive_interval", self.dyn_keepalive_interval),
            ("dyn_keepalive_period", self.dyn_keepalive_period),
        ] {
            if val == 0 {
                return Err(ConfigError::ZeroLifetime { what });
            }
        }

        let order = |shorter, a: u32, strict: bool, longer, b: u32| {
            let ok = if strict { a < b } else { a <= b };
            if ok {
                Ok(())
            } else {
                Err(ConfigError::LifetimeOrder {
                    shorter,
                    a,
                    rel: if strict { "less than" } else { "at most" },
                    longer,
                    b,
                })
            }
        };

        let (ack, syn) = (self.dyn_ack_lifetime, self.dyn_syn_lifetime);
        let (fin, rst) = (self.dyn_fin_lifetime, self.dyn_rst_lifetime);
        let period = self.dyn_keepalive_period;
        let interval = self.dyn_keepalive_interval;

        order("dyn_syn_lifetime", syn, true, "dyn_ack_lifetime", ack)?;
        order("dyn_fin_lifetime", fin, false, "dyn_ack_lifetime", ack)?;
        order("dyn_rst_lifetime", rst, false, "dyn_fin_lifetime", fin)?;
        order("dyn_fin_lifetime", fin, true, "dyn_keepalive_period", period)?;
        order("dyn_rst_lifetime", rst, true, "dyn_keepalive_period", period)?;
        let ka = "dyn_keepalive_interval";
        order("dyn_fin_lifetime", fin, true, ka, interval)?;
        order("dyn_rst_lifetime", rst, true, ka, interval)?;

        Ok(())
    }

    pub fn lifetimes(&self) -> Lifetimes {
        let secs = |s: u32| Ttl::new_seconds(u64::from(s));
        Lifetimes {
            ack: secs(self.dyn_ack_lifetime),
            syn: secs(self.dyn_syn_lifetime),
            fin: secs(self.dyn_fin_lifetime),
            rst: secs(self.dyn_rst_lifetime),
            udp: secs(self.dyn_udp_lifetime),
            short: secs(self.dyn_short_lifetime),
        }
    }

    pub fn dyn_config(&self) -> DynConfig {
        DynConfig {
            buckets: self.dyn_buckets,
            max: self.dyn_max,
            lifetimes: self.lifetimes(),
            keepalive: self.dyn_keepalive,
            keepalive_interval: Ttl::new_seconds(u64::from(
                self.dyn_keepalive_interval,
            )),
            keepalive_period: Ttl::new_seconds(u64::from(
                self.dyn_keepalive_period,
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let cfg = FwConfig::from_toml("").unwrap();
        assert_eq!(cfg.default_action, DefaultAction::Deny);
        assert_eq!(cfg.dyn_buckets, 256);
        assert_eq!(cfg.lifetimes().ack, Ttl::new_seconds(300));
    }

    #[test]
    fn overrides_and_unknown_keys() {
        let cfg = FwConfig::from_toml(
            "default_action = \"accept\"\ndyn_max = 8\nverbose = true\n",
        )
        .unwrap();
        assert_eq!(cfg.default_action, DefaultAction::Accept);
        assert_eq!(cfg.dyn_max, 8);
        assert!(cfg.verbose);

        assert!(matches!(
            FwConfig::from_toml("dyn_maximum = 8"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn lifetime_contract() {
        let mut cfg = FwConfig::default();
        cfg.validate().unwrap();

        cfg.dyn_syn_lifetime = 300;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LifetimeOrder { shorter: "dyn_syn_lifetime", .. })
        ));

        let mut cfg = FwConfig { dyn_fin_lifetime: 5, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "dyn_fin_lifetime (5s) must be less than dyn_keepalive_period (5s)"
        );

        cfg.dyn_fin_lifetime = 1;
        cfg.dyn_rst_lifetime = 2;
        assert!(cfg.validate().is_err());

        let cfg = FwConfig { dyn_buckets: 100, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DynBuckets { got: 100, .. })
        ));

        let cfg = FwConfig { autoinc_step: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::AutoincStep(0))));
    }
}
