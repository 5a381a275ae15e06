// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A stateful, rule-numbered IPv4 packet filter.
//!
//! Rules are compiled into instruction sequences and kept in a chain
//! ordered by rule number. Every packet is evaluated against a
//! snapshot of the chain, consulting and creating dynamic state as the
//! rules ask. See [`engine::firewall::Firewall`] for the entry points.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cfg;
pub mod ddi;
pub mod dynamic;
pub mod engine;
pub mod print;
pub mod provider;

pub use cfg::ConfigError;
pub use cfg::FwConfig;
pub use engine::ctl::ControlError;
pub use engine::firewall::Firewall;
pub use engine::firewall::TickReport;
pub use engine::packet::PacketDescriptor;
pub use engine::packet::Verdict;
pub use engine::rule::ResumeToken;
pub use engine::rule::RuleHandle;
pub use ipfw_api as api;

/// Return a set mask with `bit` set.
pub const fn bit_on(bit: u8) -> u32 {
    0x1 << bit
}
