// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Providers let the engine run in different contexts by plugging
//! in the services it consumes but does not implement: logging, the
//! clock, randomness and packet I/O.
//!
//! The engine never constructs packets or talks to the network. When
//! it decides that a reset, an unreachable, a keepalive probe, a
//! shaper hand-off or a divert is needed, it asks [`PacketIo`].

use crate::ddi::time::Moment;
use crate::engine::packet::PacketDescriptor;
use crate::engine::rule::ResumeToken;
use core::fmt;
use core::fmt::Display;
use ipfw_api::Direction;
use ipfw_api::FlowId;
use ipfw_api::TcpFlags;
use std::sync::Arc;
use std::time::Instant;

/// The set of all services the engine consumes.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
    pub clock: Arc<dyn Clock>,
    pub rand: Box<dyn RandomSource>,
    pub io: Arc<dyn PacketIo>,
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
///
/// For example, in a unit test this could map to `println!`. In a
/// daemon it maps to a `slog` logger.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Log through a `slog` logger.
pub struct SlogLog(pub slog::Logger);

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Note => slog::info!(self.0, "{}", msg),
            LogLevel::Warn => slog::warn!(self.0, "{}", msg),
            LogLevel::Error => slog::error!(self.0, "{}", msg),
        }
    }
}

/// The source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> Moment;
}

/// Monotonic wall clock, with its origin at construction.
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn current_time(&self) -> Moment {
        Moment::from_millis(self.origin.elapsed().as_millis() as u64)
    }
}

/// Randomness for probabilistic matching and hash salting.
pub trait RandomSource: Send + Sync {
    fn random_u32(&self) -> u32;
}

#[derive(Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn random_u32(&self) -> u32 {
        rand::random()
    }
}

/// Packet output on behalf of the engine.
pub trait PacketIo: Send + Sync {
    /// Answer `pkt` with a TCP RST (when `code` is
    /// [`ipfw_api::ICMP_REJECT_RST`]) or an ICMP unreachable with
    /// `code`.
    fn send_reset_or_icmp_unreachable(&self, pkt: &PacketDescriptor, code: u16);

    /// Send a zero-length TCP segment along `flow` (source to
    /// destination) with the given sequence numbers.
    fn send_tcp_probe(
        &self,
        flow: &FlowId,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
    );

    /// Hand `pkt` to pipe or queue `id` of the traffic shaper. The
    /// shaper re-injects it later with `token`.
    fn enqueue_to_shaper(
        &self,
        pkt: &PacketDescriptor,
        id: u16,
        is_pipe: bool,
        dir: Direction,
        token: ResumeToken,
    );

    /// Divert `pkt` (or, when `tee` is set, a copy of it) to the
    /// divert socket bound to `port`.
    fn divert_or_tee(
        &self,
        pkt: &PacketDescriptor,
        port: u16,
        tee: bool,
        token: ResumeToken,
    );
}

#[cfg(any(feature = "test-help", test))]
pub use test_help::*;

#[cfg(any(feature = "test-help", test))]
mod test_help {
    use super::*;
    use crate::ddi::sync::KMutex;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::AtomicU64;
    use core::sync::atomic::Ordering;
    use core::time::Duration;

    /// A clock that only moves when told to.
    #[derive(Default)]
    pub struct ManualClock {
        now: AtomicU64,
    }

    impl ManualClock {
        pub fn new(start: Moment) -> Self {
            Self { now: AtomicU64::new(start.raw_millis()) }
        }

        pub fn advance(&self, d: Duration) {
            self.now.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
        }

        pub fn set(&self, now: Moment) {
            self.now.store(now.raw_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn current_time(&self) -> Moment {
            Moment::from_millis(self.now.load(Ordering::SeqCst))
        }
    }

    /// Returns whatever value was last set.
    #[derive(Default)]
    pub struct FixedRandom(AtomicU32);

    impl FixedRandom {
        pub fn new(val: u32) -> Self {
            Self(AtomicU32::new(val))
        }

        pub fn set(&self, val: u32) {
            self.0.store(val, Ordering::SeqCst);
        }
    }

    impl RandomSource for FixedRandom {
        fn random_u32(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl RandomSource for Arc<FixedRandom> {
        fn random_u32(&self) -> u32 {
            self.as_ref().random_u32()
        }
    }

    /// Everything the engine asked [`RecordingIo`] to do.
    #[derive(Clone, Debug)]
    pub enum IoEvent {
        Reject { flow: FlowId, code: u16 },
        Probe { flow: FlowId, seq: u32, ack: u32, flags: TcpFlags },
        Shaper { flow: FlowId, id: u16, is_pipe: bool, token: ResumeToken },
        Divert { flow: FlowId, port: u16, tee: bool, token: ResumeToken },
    }

    #[derive(Default)]
    pub struct RecordingIo {
        events: KMutex<Vec<IoEvent>>,
    }

    impl RecordingIo {
        pub fn take(&self) -> Vec<IoEvent> {
            core::mem::take(&mut *self.events.lock())
        }

        pub fn len(&self) -> usize {
            self.events.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl PacketIo for RecordingIo {
        fn send_reset_or_icmp_unreachable(
            &self,
            pkt: &PacketDescriptor,
            code: u16,
        ) {
            let flow = pkt.flow_id;
            self.events.lock().push(IoEvent::Reject { flow, code });
        }

        fn send_tcp_probe(
            &self,
            flow: &FlowId,
            seq: u32,
            ack: u32,
            flags: TcpFlags,
        ) {
            let ev = IoEvent::Probe { flow: *flow, seq, ack, flags };
            self.events.lock().push(ev);
        }

        fn enqueue_to_shaper(
            &self,
            pkt: &PacketDescriptor,
            id: u16,
            is_pipe: bool,
            _dir: Direction,
            token: ResumeToken,
        ) {
            self.events.lock().push(IoEvent::Shaper {
                flow: pkt.flow_id,
                id,
                is_pipe,
                token,
            });
        }

        fn divert_or_tee(
            &self,
            pkt: &PacketDescriptor,
            port: u16,
            tee: bool,
            token: ResumeToken,
        ) {
            self.events.lock().push(IoEvent::Divert {
                flow: pkt.flow_id,
                port,
                tee,
                token,
            });
        }
    }

    /// Keeps every message for later inspection.
    #[derive(Clone, Default)]
    pub struct RecordingLog {
        msgs: Arc<KMutex<Vec<(LogLevel, String)>>>,
    }

    impl RecordingLog {
        pub fn messages(&self) -> Vec<(LogLevel, String)> {
            self.msgs.lock().clone()
        }

        pub fn count(&self, level: LogLevel, needle: &str) -> usize {
            self.msgs
                .lock()
                .iter()
                .filter(|(l, m)| *l == level && m.contains(needle))
                .count()
        }
    }

    impl LogProvider for RecordingLog {
        fn log(&self, level: LogLevel, msg: &str) {
            self.msgs.lock().push((level, msg.to_string()));
        }
    }
}
