// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The packet filter engine.

pub mod chain;
pub mod chk;
pub mod ctl;
pub mod dyn_state;
pub mod firewall;
pub mod packet;
pub mod predicate;
pub mod rule;
pub mod tcp_state;

pub use ipfw_api::Direction;
