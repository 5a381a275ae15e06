// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Types shared between the packet filter engine and its
//! administrative clients.
//!
//! Everything here is plain data: the flow key, the instruction
//! codec used to move rules across the control boundary, and the
//! snapshot types returned by the dump operations.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod flow;
pub mod insn;

pub use cmd::*;
pub use flow::*;
pub use insn::*;

/// The overall version of the API. Bump it whenever the wire
/// encoding of a rule or any of the request/response types changes.
pub const API_VERSION: u64 = 3;

/// The rule number reserved for the default rule.
pub const DEFAULT_RULENUM: u16 = 65535;

/// The set holding the default rule. It can never be disabled.
pub const DEFAULT_SET: u8 = 31;

/// The highest set number a user rule may be placed in.
pub const MAX_USER_SET: u8 = DEFAULT_SET - 1;

/// Which way a packet is travelling through the filter.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    In = 1,
    Out = 2,
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            _ => Err(format!("invalid direction: {s}")),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };

        write!(f, "{dirstr}")
    }
}
