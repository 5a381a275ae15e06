// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The dynamic state table.
//!
//! Entries are created by `keep-state` and `limit` rules and matched
//! by `check-state`/`probe-state` in either direction of the flow.
//! The table is a fixed array of buckets indexed by a hash that is
//! symmetric in source and destination, so both directions of a flow
//! land in the same bucket.
//!
//! Locking: the table sits behind one reader/writer lock. Lookups take
//! it shared and update their own entry's counters and expiry through
//! the entry's mutex. Anything that adds or removes entries takes it
//! exclusively. The keepalive pass drops the lock around every call
//! out to packet I/O and checks the table generation when it comes
//! back; a resize in between ends the pass.

use super::packet::PacketDescriptor;
use super::rule::Rule;
use super::tcp_state::Lifetimes;
use super::tcp_state::TcpTrack;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockType;
use crate::ddi::time::Moment;
use crate::ddi::time::Ttl;
use crate::provider::PacketIo;
use core::fmt;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use ipfw_api::DynType;
use ipfw_api::FlowId;
use ipfw_api::IPPROTO_TCP;
use ipfw_api::IPPROTO_UDP;
use ipfw_api::LimitMask;
use ipfw_api::StateDump;
use ipfw_api::TcpFlags;
use std::sync::Arc;
use thiserror::Error;

pub const DYN_DEF_BUCKETS: u32 = 256;
pub const DYN_MAX_BUCKETS: u32 = 65536;
pub const DYN_DEF_MAX: u32 = 4096;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum StateError {
    #[error("too many dynamic entries ({max})")]
    Capacity { max: u32 },

    #[error("too many sessions for limit key ({limit})")]
    LimitExceeded { limit: u16 },

    #[error("state creation disabled for rule {rulenum}")]
    CreationDisabled { rulenum: u16 },
}

/// What a matching `keep-state` or `limit` asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StateKind {
    KeepState,
    Limit { mask: LimitMask, conn_limit: u16 },
}

/// Which way a packet travels relative to the flow that created the
/// entry it matched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchDir {
    Forward,
    Reverse,
}

/// Tunables of the state table.
#[derive(Clone, Copy, Debug)]
pub struct DynConfig {
    pub buckets: u32,
    pub max: u32,
    pub lifetimes: Lifetimes,
    pub keepalive: bool,
    pub keepalive_interval: Ttl,
    pub keepalive_period: Ttl,
}

#[derive(Clone, Copy, Debug)]
struct FlowState {
    expire: Moment,
    tcp: TcpTrack,
    pkt_cnt: u64,
    byte_cnt: u64,
    keepalive_last_sent: Option<Moment>,
}

pub struct DynEntry {
    id: FlowId,
    dyn_type: DynType,
    rule: Arc<Rule>,
    parent: Option<Arc<DynEntry>>,
    // Live children, `LimitParent` entries only.
    limit_count: AtomicU32,
    st: KMutex<FlowState>,
}

impl DynEntry {
    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn dyn_type(&self) -> DynType {
        self.dyn_type
    }

    /// The rule that created this entry.
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn expire(&self) -> Moment {
        self.st.lock().expire
    }

    pub fn limit_count(&self) -> u32 {
        self.limit_count.load(Ordering::SeqCst)
    }

    pub fn tcp(&self) -> TcpTrack {
        self.st.lock().tcp
    }

    pub fn counters(&self) -> (u64, u64) {
        let st = self.st.lock();
        (st.pkt_cnt, st.byte_cnt)
    }

    fn is_expired(&self, now: Moment) -> bool {
        self.st.lock().expire <= now
    }

    fn has_parent(&self, parent: &Arc<DynEntry>) -> bool {
        self.parent.as_ref().is_some_and(|p| Arc::ptr_eq(p, parent))
    }

    /// Apply one packet to the entry's TCP state and expiry.
    fn refresh(
        &self,
        pkt: &PacketDescriptor,
        dir: MatchDir,
        lt: &Lifetimes,
        now: Moment,
    ) {
        let mut st = self.st.lock();
        let ttl = match pkt.flow_id.proto {
            IPPROTO_TCP => {
                st.tcp.update(dir == MatchDir::Forward, pkt.tcp.as_ref(), lt)
            }
            IPPROTO_UDP => Some(lt.udp),
            _ => Some(lt.short),
        };

        if let Some(ttl) = ttl {
            st.expire = now + ttl;
        }
    }

    fn dump(&self, now: Moment) -> StateDump {
        let st = self.st.lock();
        StateDump {
            id: self.id,
            rulenum: self.rule.rulenum(),
            dyn_type: self.dyn_type,
            expire_in: st.expire.delta_as_millis(now) / 1_000,
            pkt_cnt: st.pkt_cnt,
            byte_cnt: st.byte_cnt,
            tcp_state: st.tcp.state,
            limit_count: self.limit_count(),
        }
    }
}

impl fmt::Debug for DynEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DynEntry")
            .field("id", &self.id)
            .field("dyn_type", &self.dyn_type)
            .field("rulenum", &self.rule.rulenum())
            .field("limit_count", &self.limit_count())
            .finish()
    }
}

/// A successful lookup.
#[derive(Clone, Debug)]
pub struct DynMatch {
    pub entry: Arc<DynEntry>,
    pub dir: MatchDir,
}

struct DynTable {
    buckets: Vec<Vec<Arc<DynEntry>>>,
    count: u32,
    generation: u64,
    pending_buckets: Option<u32>,
}

impl DynTable {
    fn new(nbuckets: u32) -> Self {
        Self {
            buckets: (0..nbuckets).map(|_| Vec::new()).collect(),
            count: 0,
            generation: 0,
            pending_buckets: None,
        }
    }

    fn mask(&self) -> u32 {
        self.buckets.len() as u32 - 1
    }

    /// Apply a requested bucket count. Only possible while empty.
    fn maybe_resize(&mut self) {
        if self.count != 0 {
            return;
        }

        if let Some(n) = self.pending_buckets.take() {
            if n as usize != self.buckets.len() {
                self.buckets = (0..n).map(|_| Vec::new()).collect();
                self.generation += 1;
            }
        }
    }

    /// Remove the entries selected by `pred`: children first, then
    /// `LimitParent` entries that no longer have any. Unless `force`
    /// is set only expired entries go. Returns the number removed.
    fn remove_where<P>(&mut self, pred: P, force: bool, now: Moment) -> u32
    where
        P: Fn(&DynEntry) -> bool,
    {
        let mut removed = 0;

        for bucket in self.buckets.iter_mut() {
            bucket.retain(|e| {
                let reap = e.dyn_type != DynType::LimitParent
                    && pred(e)
                    && (force || e.is_expired(now));
                if reap {
                    if let Some(parent) = &e.parent {
                        parent.limit_count.fetch_sub(1, Ordering::SeqCst);
                    }
                    removed += 1;
                }
                !reap
            });
        }

        for bucket in self.buckets.iter_mut() {
            bucket.retain(|e| {
                let reap = e.dyn_type == DynType::LimitParent
                    && pred(e)
                    && e.limit_count() == 0
                    && (force || e.is_expired(now));
                if reap {
                    removed += 1;
                }
                !reap
            });
        }

        self.count -= removed;
        removed
    }
}

pub struct DynStateTable {
    inner: KRwLock<DynTable>,
    cfg: DynConfig,
    salt: u32,
}

/// Bucket index of `id`. Both orientations of a flow hash alike.
fn hash_flow(id: &FlowId, salt: u32, mask: u32) -> usize {
    let x = id.src_ip ^ id.dst_ip ^ u32::from(id.src_port ^ id.dst_port);
    let x = (x ^ salt).wrapping_mul(0x9e37_79b1);
    ((x ^ (x >> 16)) & mask) as usize
}

fn limit_key(id: &FlowId, mask: LimitMask) -> FlowId {
    let mut key = FlowId { proto: id.proto, ..Default::default() };
    if mask.contains(LimitMask::SRC_ADDR) {
        key.src_ip = id.src_ip;
    }
    if mask.contains(LimitMask::SRC_PORT) {
        key.src_port = id.src_port;
    }
    if mask.contains(LimitMask::DST_ADDR) {
        key.dst_ip = id.dst_ip;
    }
    if mask.contains(LimitMask::DST_PORT) {
        key.dst_port = id.dst_port;
    }
    key
}

impl DynStateTable {
    /// `cfg.buckets` must be a power of two no larger than
    /// [`DYN_MAX_BUCKETS`]; configuration validation guarantees it.
    pub fn new(cfg: DynConfig, salt: u32) -> Self {
        let mut inner = KRwLock::new(DynTable::new(cfg.buckets));
        inner.init(KRwLockType::Driver);
        Self { inner, cfg, salt }
    }

    pub fn config(&self) -> &DynConfig {
        &self.cfg
    }

    pub fn len(&self) -> u32 {
        self.inner.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.read().buckets.len()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Ask for a new bucket count, applied the next time an entry is
    /// added to an empty table.
    pub fn set_buckets(&self, n: u32) -> bool {
        if n == 0 || !n.is_power_of_two() || n > DYN_MAX_BUCKETS {
            return false;
        }
        self.inner.write().pending_buckets = Some(n);
        true
    }

    /// Find the live entry for the packet's flow in either direction,
    /// account the packet to it and refresh its expiry. Expired
    /// entries are treated as absent.
    pub fn lookup(
        &self,
        pkt: &PacketDescriptor,
        now: Moment,
    ) -> Option<DynMatch> {
        let table = self.inner.read();
        if table.count == 0 {
            return None;
        }

        let id = &pkt.flow_id;
        let b = hash_flow(id, self.salt, table.mask());

        for e in &table.buckets[b] {
            if e.dyn_type == DynType::LimitParent {
                continue;
            }

            let Some(fwd) = e.id.orientation(id) else {
                continue;
            };

            if e.is_expired(now) {
                continue;
            }

            let dir = if fwd { MatchDir::Forward } else { MatchDir::Reverse };
            e.refresh(pkt, dir, &self.cfg.lifetimes, now);
            {
                let mut st = e.st.lock();
                st.pkt_cnt += 1;
                st.byte_cnt += u64::from(pkt.ip_len);
            }

            return Some(DynMatch { entry: Arc::clone(e), dir });
        }

        None
    }

    fn find_live(
        table: &DynTable,
        id: &FlowId,
        salt: u32,
        now: Moment,
    ) -> bool {
        let b = hash_flow(id, salt, table.mask());
        table.buckets[b].iter().any(|e| {
            e.dyn_type != DynType::LimitParent
                && e.id.orientation(id).is_some()
                && !e.is_expired(now)
        })
    }

    fn insert(
        &self,
        table: &mut DynTable,
        id: FlowId,
        dyn_type: DynType,
        rule: &Arc<Rule>,
        parent: Option<Arc<DynEntry>>,
        now: Moment,
    ) -> Arc<DynEntry> {
        let entry = Arc::new(DynEntry {
            id,
            dyn_type,
            rule: Arc::clone(rule),
            parent,
            limit_count: AtomicU32::new(0),
            st: KMutex::new(FlowState {
                expire: now + self.cfg.lifetimes.syn,
                tcp: TcpTrack::default(),
                pkt_cnt: 0,
                byte_cnt: 0,
                keepalive_last_sent: None,
            }),
        });

        if let Some(p) = &entry.parent {
            p.limit_count.fetch_add(1, Ordering::SeqCst);
        }

        let b = hash_flow(&id, self.salt, table.mask());
        table.buckets[b].insert(0, Arc::clone(&entry));
        table.count += 1;
        entry
    }

    /// Make room for `need` more entries, reclaiming expired ones if
    /// the table is full.
    fn reserve(
        &self,
        table: &mut DynTable,
        need: u32,
        now: Moment,
    ) -> Result<(), StateError> {
        if table.count + need > self.cfg.max {
            table.remove_where(|_| true, false, now);
        }

        if table.count + need > self.cfg.max {
            return Err(StateError::Capacity { max: self.cfg.max });
        }

        Ok(())
    }

    /// Create state for the packet's flow on behalf of `rule`.
    ///
    /// Succeeds without doing anything if live state for the flow
    /// already exists.
    pub fn install(
        &self,
        pkt: &PacketDescriptor,
        kind: StateKind,
        rule: &Arc<Rule>,
        now: Moment,
    ) -> Result<(), StateError> {
        let mut table = self.inner.write();

        // Checked under the table lock: the control plane clears this
        // flag and then flushes the rule's entries under the same lock.
        if !rule.state_enabled() {
            return Err(StateError::CreationDisabled {
                rulenum: rule.rulenum(),
            });
        }

        table.maybe_resize();

        let id = pkt.flow_id;
        if Self::find_live(&table, &id, self.salt, now) {
            return Ok(());
        }

        let entry = match kind {
            StateKind::KeepState => {
                self.reserve(&mut table, 1, now)?;
                self.insert(&mut table, id, DynType::KeepState, rule, None, now)
            }

            StateKind::Limit { mask, conn_limit } => {
                let key = limit_key(&id, mask);
                let parent = self.find_parent(&table, &key, rule);
                let need = if parent.is_some() { 1 } else { 2 };
                self.reserve(&mut table, need, now)?;

                // The reservation may have reaped an idle parent, in
                // which case room for a new parent and its child is
                // needed after all.
                let parent = match parent {
                    Some(p) if table_holds(&table, &p, self.salt) => p,
                    _ => match self.find_parent(&table, &key, rule) {
                        Some(p) => p,
                        None => {
                            self.reserve(&mut table, 2, now)?;
                            self.insert(
                                &mut table,
                                key,
                                DynType::LimitParent,
                                rule,
                                None,
                                now,
                            )
                        }
                    },
                };
                parent.st.lock().expire = now + self.cfg.lifetimes.short;

                if parent.limit_count() >= u32::from(conn_limit) {
                    table.remove_where(|e| e.has_parent(&parent), false, now);
                    if parent.limit_count() >= u32::from(conn_limit) {
                        return Err(StateError::LimitExceeded {
                            limit: conn_limit,
                        });
                    }
                }

                self.insert(
                    &mut table,
                    id,
                    DynType::Limit,
                    rule,
                    Some(parent),
                    now,
                )
            }
        };

        entry.refresh(pkt, MatchDir::Forward, &self.cfg.lifetimes, now);
        Ok(())
    }

    fn find_parent(
        &self,
        table: &DynTable,
        key: &FlowId,
        rule: &Arc<Rule>,
    ) -> Option<Arc<DynEntry>> {
        let b = hash_flow(key, self.salt, table.mask());
        table.buckets[b]
            .iter()
            .find(|e| {
                e.dyn_type == DynType::LimitParent
                    && Arc::ptr_eq(&e.rule, rule)
                    && e.id == *key
            })
            .cloned()
    }

    /// Remove every expired entry.
    pub fn age_sweep(&self, now: Moment) -> u32 {
        self.inner.write().remove_where(|_| true, false, now)
    }

    /// Remove every entry selected by `pred`, expired or not.
    pub fn flush<P>(&self, pred: P, now: Moment) -> u32
    where
        P: Fn(&DynEntry) -> bool,
    {
        self.inner.write().remove_where(pred, true, now)
    }

    /// Remove every entry created by `rule`.
    pub fn flush_rule(&self, rule: &Rule, now: Moment) -> u32 {
        let id = rule.id();
        self.flush(|e| e.rule.id() == id, now)
    }

    pub fn flush_all(&self, now: Moment) -> u32 {
        self.flush(|_| true, now)
    }

    /// Send keepalives for established TCP flows about to expire.
    /// Returns the number of flows probed.
    pub fn keepalive_tick(&self, io: &dyn PacketIo, now: Moment) -> usize {
        if !self.cfg.keepalive {
            return 0;
        }

        let interval = self.cfg.keepalive_interval;
        let period = self.cfg.keepalive_period;
        let mut probed = 0;
        let mut b = 0;
        let mut generation = None;

        loop {
            let mut probes = Vec::new();
            {
                let table = self.inner.write();
                match generation {
                    None => generation = Some(table.generation),
                    Some(g) if g != table.generation => break,
                    Some(_) => (),
                }

                while b < table.buckets.len() && probes.is_empty() {
                    for e in &table.buckets[b] {
                        if e.dyn_type == DynType::LimitParent
                            || e.id.proto != IPPROTO_TCP
                        {
                            continue;
                        }

                        let mut st = e.st.lock();
                        if !st.tcp.is_established()
                            || st.expire <= now
                            || now + interval <= st.expire
                            || st.tcp.ack_fwd == 0
                            || st.tcp.ack_rev == 0
                        {
                            continue;
                        }

                        if let Some(last) = st.keepalive_last_sent {
                            if !period.is_expired(last, now) {
                                continue;
                            }
                        }

                        st.keepalive_last_sent = Some(now);
                        probes.push((e.id, st.tcp.ack_fwd, st.tcp.ack_rev));
                    }
                    b += 1;
                }
            }

            if probes.is_empty() {
                break;
            }

            for (id, ack_fwd, ack_rev) in probes {
                io.send_tcp_probe(
                    &id,
                    ack_rev.wrapping_sub(1),
                    ack_fwd,
                    TcpFlags::ACK,
                );
                io.send_tcp_probe(
                    &id.reversed(),
                    ack_fwd.wrapping_sub(1),
                    ack_rev,
                    TcpFlags::ACK,
                );
                probed += 1;
            }
        }

        probed
    }

    pub fn dump(&self, now: Moment) -> Vec<StateDump> {
        let table = self.inner.read();
        table
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|e| e.dump(now)))
            .collect()
    }

    /// Visit every entry, for invariant checks.
    #[cfg(any(feature = "test-help", test))]
    pub fn for_each<F: FnMut(&DynEntry)>(&self, mut f: F) {
        let table = self.inner.read();
        table.buckets.iter().flatten().for_each(|e| f(e));
    }
}

fn table_holds(table: &DynTable, entry: &Arc<DynEntry>, salt: u32) -> bool {
    let b = hash_flow(&entry.id, salt, table.mask());
    table.buckets[b].iter().any(|e| Arc::ptr_eq(e, entry))
}
