//! Transactional-memory conflict detection over resolved mainstore addresses.
//!
//! Every resolved guest storage access passes through [`TxCpu::intercept`],
//! which tracks transactional ownership of 256-byte cache lines in a
//! system-wide [status table](CacheLineStatusTable) and resolves conflicts
//! between transactional and ordinary accesses on different CPUs. Two
//! strategies exist, selected at system construction:
//!
//! - [`TxStrategy::Backout`] checks for conflicts inline on every access.
//!   Transactional stores log pre-images so a conflicting ordinary access
//!   can force the whole transaction to be backed out of mainstore; a
//!   genuine cross-transaction conflict aborts the requesting transaction
//!   on the spot.
//! - [`TxStrategy::Commit`] does no inline checking; transactional accesses
//!   are redirected into per-transaction shadow pages and conflicts surface
//!   when the commit-time snapshot comparison fails.
//! - [`TxStrategy::Both`] runs the backout bookkeeping for cross-validation
//!   while the commit-mode redirection governs the returned location;
//!   inline conflicts only flag a pending abort that the commit reports.

mod status;

pub use status::{CacheLineStatusTable, CACHE_LINE_SHIFT, CACHE_LINE_SIZE, LINES_PER_PAGE};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use status::{fetched_of, span_mask, stored_of};
use talos_mem::{HostAddr, MainStore, PAGE_SIZE};
use thiserror::Error;

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// Another CPU's access conflicted with a line this transaction stored,
    /// or this transaction's store hit a line claimed elsewhere.
    StoreConflict,
    /// This transaction's fetch hit a line stored by another transaction.
    FetchConflict,
    /// Any other cause (explicit abort instruction, unsupported condition).
    Other,
}

impl AbortCause {
    fn code(self) -> u8 {
        match self {
            AbortCause::StoreConflict => 1,
            AbortCause::FetchConflict => 2,
            AbortCause::Other => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AbortCause::StoreConflict),
            2 => Some(AbortCause::FetchConflict),
            3 => Some(AbortCause::Other),
            _ => None,
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortCause::StoreConflict => "store conflict",
            AbortCause::FetchConflict => "fetch conflict",
            AbortCause::Other => "other",
        };
        f.write_str(s)
    }
}

/// A transaction abort. This is a control transfer, not a recoverable
/// return: the access that provoked it does not complete, and the caller's
/// dispatch loop unwinds to the transaction's abort handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transaction aborted: {cause}")]
pub struct TransactionAbort {
    pub cause: AbortCause,
}

/// Conflict-handling strategy, fixed for the lifetime of a [`TxSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStrategy {
    Backout,
    Commit,
    /// Both at once, for cross-validation: backout bookkeeping runs, commit
    /// redirection wins.
    Both,
}

impl TxStrategy {
    #[inline]
    fn backout_checks(self) -> bool {
        matches!(self, TxStrategy::Backout | TxStrategy::Both)
    }

    #[inline]
    fn commit_redirect(self) -> bool {
        matches!(self, TxStrategy::Commit | TxStrategy::Both)
    }
}

/// System-wide transaction counters.
///
/// `active_cpus` gates the cross-transaction ownership scan: with a single
/// transactionally-active CPU, any status mark must be self-owned and the
/// scan is skipped.
#[derive(Debug, Default)]
pub struct TxStats {
    active_cpus: AtomicU32,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TxStats {
    #[inline]
    pub fn active_cpus(&self) -> u32 {
        self.active_cpus.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }
}

/// One logged cache line: its host base and, for stored lines, the bytes it
/// held before the first transactional store.
struct BackoutRecord {
    line: usize,
    pre_image: Option<Box<[u8; CACHE_LINE_SIZE]>>,
}

/// Commit-mode shadow of one guest page: the live snapshot taken on first
/// touch and the private copy transactional accesses are redirected into.
struct ShadowPage {
    save: [u8; PAGE_SIZE],
    alt: [u8; PAGE_SIZE],
}

#[derive(Default)]
struct SlotInner {
    records: Vec<BackoutRecord>,
    shadow: HashMap<usize, Box<ShadowPage>>,
}

struct CpuSlot {
    /// Abort cause flagged for this CPU's in-flight transaction; zero when
    /// none. Written by other CPUs (forced backout) and by deferred-conflict
    /// flagging, consumed when the transaction ends.
    pending_abort: AtomicU8,
    inner: Mutex<SlotInner>,
}

impl CpuSlot {
    fn new() -> Self {
        Self {
            pending_abort: AtomicU8::new(0),
            inner: Mutex::new(SlotInner::default()),
        }
    }
}

/// System-wide transactional-execution context.
///
/// Owns the cache-line status table, the transaction statistics, and one
/// slot per CPU holding that CPU's backout records and shadow pages. CPU
/// contexts reference it through an [`Arc`]; only this structure is ever
/// touched across thread boundaries.
pub struct TxSystem {
    strategy: TxStrategy,
    store: Arc<MainStore>,
    table: CacheLineStatusTable,
    stats: TxStats,
    /// Serializes commit-time shadow verification/publication.
    commit_lock: Mutex<()>,
    slots: Box<[CpuSlot]>,
}

impl TxSystem {
    pub fn new(store: Arc<MainStore>, strategy: TxStrategy, cpus: usize) -> Self {
        assert!(cpus > 0);
        let table = CacheLineStatusTable::new(&store);
        let slots = (0..cpus).map(|_| CpuSlot::new()).collect::<Vec<_>>();
        Self {
            strategy,
            store,
            table,
            stats: TxStats::default(),
            commit_lock: Mutex::new(()),
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn strategy(&self) -> TxStrategy {
        self.strategy
    }

    #[inline]
    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    #[inline]
    pub fn store(&self) -> &Arc<MainStore> {
        &self.store
    }

    #[inline]
    pub fn cpu_count(&self) -> usize {
        self.slots.len()
    }

    fn take_pending(&self, cpu: usize) -> Option<AbortCause> {
        AbortCause::from_code(self.slots[cpu].pending_abort.swap(0, Ordering::SeqCst))
    }

    fn peek_pending(&self, cpu: usize) -> Option<AbortCause> {
        AbortCause::from_code(self.slots[cpu].pending_abort.load(Ordering::SeqCst))
    }

    /// Flags an abort for `cpu`'s transaction; keeps the first cause.
    /// Returns whether the flag was newly set.
    fn flag_abort(&self, cpu: usize, cause: AbortCause) -> bool {
        self.slots[cpu]
            .pending_abort
            .compare_exchange(0, cause.code(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn snapshot_line(line: usize) -> Box<[u8; CACHE_LINE_SIZE]> {
        let mut buf = Box::new([0u8; CACHE_LINE_SIZE]);
        HostAddr::from_mut_ptr(line as *mut u8).copy_into(&mut buf[..]);
        buf
    }

    /// Appends backout records for the lines an access spans; for stores,
    /// captures the pre-image of any line not already captured. Returns the
    /// lines newly recorded, so a failed status swap can retract them.
    fn record_access(&self, cpu: usize, addr: HostAddr, len: usize, is_write: bool) -> Vec<usize> {
        let mut added = Vec::new();
        let mut inner = self.slots[cpu].inner.lock().unwrap();
        for line in self.table.lines(addr, len) {
            match inner.records.iter_mut().find(|r| r.line == line) {
                Some(rec) => {
                    if is_write && rec.pre_image.is_none() {
                        rec.pre_image = Some(Self::snapshot_line(line));
                    }
                }
                None => {
                    let pre_image = is_write.then(|| Self::snapshot_line(line));
                    inner.records.push(BackoutRecord { line, pre_image });
                    added.push(line);
                }
            }
        }
        added
    }

    fn unrecord(&self, cpu: usize, lines: &[usize]) {
        if lines.is_empty() {
            return;
        }
        let mut inner = self.slots[cpu].inner.lock().unwrap();
        inner.records.retain(|r| !lines.contains(&r.line));
    }

    /// Whether every marked line the access spans is recorded by `cpu`'s
    /// own transaction. Unmarked spanned lines are claimed by nobody and do
    /// not participate.
    fn owns_marked_lines(&self, cpu: usize, addr: HostAddr, marked: u16) -> bool {
        let page = self.table.page_base(addr).as_ptr() as usize;
        let inner = self.slots[cpu].inner.lock().unwrap();
        (0..LINES_PER_PAGE)
            .filter(|i| marked & (1 << i) != 0)
            .all(|i| {
                let line = page + (i << CACHE_LINE_SHIFT);
                inner.records.iter().any(|r| r.line == line)
            })
    }

    /// Unwinds every other CPU's transaction that holds a line in the
    /// spanned range: restores pre-images into mainstore (backout strategy
    /// only; in dual mode the stores only ever reached shadow pages), clears
    /// the victim's marks and records, and flags it aborted.
    fn force_backout_others(&self, forcer: usize, addr: HostAddr, len: usize, is_write: bool) {
        let span: Vec<usize> = self.table.lines(addr, len).collect();
        for victim in 0..self.slots.len() {
            if victim == forcer {
                continue;
            }
            let mut inner = self.slots[victim].inner.lock().unwrap();
            if !inner.records.iter().any(|r| span.contains(&r.line)) {
                continue;
            }
            let stored_conflict = inner
                .records
                .iter()
                .any(|r| r.pre_image.is_some() && span.contains(&r.line));
            if self.strategy == TxStrategy::Backout {
                for rec in inner.records.iter() {
                    if let Some(pre) = &rec.pre_image {
                        HostAddr::from_mut_ptr(rec.line as *mut u8).copy_from(&pre[..]);
                    }
                }
            }
            self.table.clear_lines(inner.records.iter().map(|r| &r.line));
            inner.records.clear();
            inner.shadow.clear();
            let cause = if stored_conflict {
                AbortCause::StoreConflict
            } else {
                AbortCause::FetchConflict
            };
            if self.flag_abort(victim, cause) {
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(victim, forcer, is_write, ?cause, "forced transaction backout");
        }
    }

    /// Redirects a transactional access into `cpu`'s shadow copy of the
    /// page, capturing the live page on first touch. The returned location
    /// stays valid until the transaction ends.
    fn redirect(&self, cpu: usize, addr: HostAddr, _len: usize) -> HostAddr {
        let page_base = self.table.page_base(addr);
        let page_off = self.table.page_off(addr);
        let mut inner = self.slots[cpu].inner.lock().unwrap();
        let sp = inner
            .shadow
            .entry(page_base.as_ptr() as usize)
            .or_insert_with(|| {
                let mut sp = Box::new(ShadowPage {
                    save: [0u8; PAGE_SIZE],
                    alt: [0u8; PAGE_SIZE],
                });
                page_base.copy_into(&mut sp.save);
                sp.alt = sp.save;
                sp
            });
        HostAddr::from_mut_ptr(sp.alt.as_mut_ptr()).byte_add(page_off)
    }

    /// Restores `cpu`'s logged pre-images into mainstore. Used by inline
    /// aborts under the backout strategy.
    fn restore_own(inner: &SlotInner) {
        for rec in inner.records.iter() {
            if let Some(pre) = &rec.pre_image {
                HostAddr::from_mut_ptr(rec.line as *mut u8).copy_from(&pre[..]);
            }
        }
    }

    fn clear_slot_state(&self, inner: &mut SlotInner) {
        self.table.clear_lines(inner.records.iter().map(|r| &r.line));
        inner.records.clear();
        inner.shadow.clear();
    }

    /// Completes an outermost commit: observes a pending forced/deferred
    /// abort, verifies and publishes shadow pages (commit strategies), and
    /// clears this CPU's marks and logs. Serialized against forced backout
    /// by the slot lock and against other commits by the commit lock.
    fn finish_commit(&self, cpu: usize) -> Result<(), AbortCause> {
        let _commit = self.commit_lock.lock().unwrap();
        let mut inner = self.slots[cpu].inner.lock().unwrap();
        if let Some(cause) = self.take_pending(cpu) {
            self.clear_slot_state(&mut inner);
            return Err(cause);
        }
        if self.strategy.commit_redirect() {
            for (&page, sp) in inner.shadow.iter() {
                let mut live = [0u8; PAGE_SIZE];
                HostAddr::from_mut_ptr(page as *mut u8).copy_into(&mut live);
                if live[..] != sp.save[..] {
                    tracing::debug!(cpu, page, "commit conflict: mainstore changed under shadow page");
                    self.clear_slot_state(&mut inner);
                    self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                    return Err(AbortCause::StoreConflict);
                }
            }
            for (&page, sp) in inner.shadow.iter() {
                HostAddr::from_mut_ptr(page as *mut u8).copy_from(&sp.alt[..]);
            }
        }
        self.clear_slot_state(&mut inner);
        Ok(())
    }

    /// Completes an outermost abort. Returns the pending cause if a forced
    /// backout already unwound the storage side.
    fn finish_abort(&self, cpu: usize) -> Option<AbortCause> {
        let mut inner = self.slots[cpu].inner.lock().unwrap();
        let pending = self.take_pending(cpu);
        if pending.is_none() && self.strategy == TxStrategy::Backout {
            Self::restore_own(&inner);
        }
        self.clear_slot_state(&mut inner);
        pending
    }

    fn reset_slot(&self, cpu: usize) {
        let mut inner = self.slots[cpu].inner.lock().unwrap();
        inner.records.clear();
        inner.shadow.clear();
        self.slots[cpu].pending_abort.store(0, Ordering::SeqCst);
    }
}

/// One resolved access, as seen by the conflict detector.
#[derive(Debug, Clone, Copy)]
pub struct TxAccess {
    /// Resolved host location of the access.
    pub addr: HostAddr,
    /// Access length in bytes; must not extend past the end of the page
    /// (callers split page-crossing accesses).
    pub len: usize,
    /// Whether the access stores into guest memory.
    pub is_write: bool,
    /// Instruction-fetch and real-address translation accesses bypass
    /// conflict interception entirely.
    pub exempt: bool,
}

/// Per-CPU transactional execution state.
///
/// Owned by its CPU context and thread; holds a non-owning handle to the
/// shared [`TxSystem`].
pub struct TxCpu {
    sys: Arc<TxSystem>,
    index: usize,
    depth: u32,
    ntstg: bool,
}

impl TxCpu {
    /// Binds CPU `index`'s transactional state to a shared system context.
    pub fn attach(sys: Arc<TxSystem>, index: usize) -> Self {
        assert!(index < sys.cpu_count());
        Self {
            sys,
            index,
            depth: 0,
            ntstg: false,
        }
    }

    #[inline]
    pub fn system(&self) -> &Arc<TxSystem> {
        &self.sys
    }

    #[inline]
    pub fn cpu_index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn nesting_depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Abort cause flagged for this CPU's transaction, if any (set by a
    /// forced backout or a deferred dual-mode conflict).
    pub fn pending_abort(&self) -> Option<AbortCause> {
        self.sys.peek_pending(self.index)
    }

    /// Marks the next intercepted access as a non-transactional store; it
    /// bypasses conflict interception once, then the override clears.
    pub fn set_non_transactional_store(&mut self) {
        self.ntstg = true;
    }

    /// Enters a transaction level. The outermost level registers this CPU
    /// as transactionally active and starts a fresh backout log.
    pub fn begin(&mut self) {
        self.depth += 1;
        if self.depth == 1 {
            self.sys.reset_slot(self.index);
            self.sys.stats.started.fetch_add(1, Ordering::Relaxed);
            self.sys.stats.active_cpus.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Leaves the current transaction level. Nested levels flatten into the
    /// outermost; the outermost level publishes or fails the transaction.
    pub fn commit(&mut self) -> Result<(), TransactionAbort> {
        debug_assert!(self.in_transaction());
        if self.depth > 1 {
            self.depth -= 1;
            return Ok(());
        }
        self.depth = 0;
        match self.sys.finish_commit(self.index) {
            Ok(()) => {
                self.sys.stats.committed.fetch_add(1, Ordering::Relaxed);
                self.sys.stats.active_cpus.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            Err(cause) => {
                self.sys.stats.active_cpus.fetch_sub(1, Ordering::SeqCst);
                Err(TransactionAbort { cause })
            }
        }
    }

    /// Aborts the whole transaction (all nesting levels), restoring logged
    /// pre-images under the backout strategy.
    pub fn abort(&mut self, cause: AbortCause) -> TransactionAbort {
        debug_assert!(self.in_transaction());
        self.depth = 0;
        let forced = self.sys.finish_abort(self.index);
        if forced.is_none() {
            self.sys.stats.aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.sys.stats.active_cpus.fetch_sub(1, Ordering::SeqCst);
        TransactionAbort {
            cause: forced.unwrap_or(cause),
        }
    }

    /// Conflict-checks one resolved access and returns the location the
    /// caller must actually use (possibly redirected into a shadow page).
    ///
    /// An `Err` means the current transaction was aborted and the access
    /// must not complete.
    pub fn intercept(&mut self, access: TxAccess) -> Result<HostAddr, TransactionAbort> {
        debug_assert!(access.len > 0);
        if access.exempt {
            return Ok(access.addr);
        }
        if self.ntstg {
            self.ntstg = false;
            return Ok(access.addr);
        }
        if self.sys.strategy.backout_checks() {
            self.backout_check(access.addr, access.len, access.is_write)?;
        }
        if self.sys.strategy.commit_redirect() && self.in_transaction() {
            return Ok(self.sys.redirect(self.index, access.addr, access.len));
        }
        Ok(access.addr)
    }

    /// Inline conflict check and status maintenance (backout bookkeeping).
    fn backout_check(
        &mut self,
        addr: HostAddr,
        len: usize,
        is_write: bool,
    ) -> Result<(), TransactionAbort> {
        let sys = Arc::clone(&self.sys);
        let table = &sys.table;
        loop {
            let word = table.load(addr);
            let mask = span_mask(table.page_off(addr), len);
            let stored = stored_of(word) & mask;
            let marked = (fetched_of(word) | stored_of(word)) & mask;
            let window = stored != 0 || (marked != 0 && is_write);

            if !window {
                if !self.in_transaction() {
                    return Ok(());
                }
                // Clean lines, transactional access: log, then claim them.
                // The swap is validated against the loaded snapshot; if the
                // word moved underneath us the claim is retracted and the
                // whole decision re-runs against fresh status.
                let added = sys.record_access(self.index, addr, len, is_write);
                match table.try_mark(addr, len, is_write, word) {
                    Ok(()) => return Ok(()),
                    Err(_) => {
                        sys.unrecord(self.index, &added);
                        continue;
                    }
                }
            }

            if !self.in_transaction() {
                // Ordinary access hitting transactionally-claimed lines: the
                // conflicting transactions are unwound first, then the
                // access proceeds on this CPU.
                if stored != 0 {
                    tracing::trace!(cpu = self.index, "non-transactional store conflict");
                } else {
                    tracing::trace!(cpu = self.index, "non-transactional fetch conflict");
                }
                sys.force_backout_others(self.index, addr, len, is_write);
                return Ok(());
            }

            if self.sys.strategy == TxStrategy::Both && sys.peek_pending(self.index).is_some() {
                // Already condemned; the commit will report it.
                return Ok(());
            }

            let mut owned = true;
            if sys.stats.active_cpus() > 1 {
                owned = sys.owns_marked_lines(self.index, addr, marked);
                if !owned {
                    let cause = if is_write {
                        AbortCause::StoreConflict
                    } else {
                        AbortCause::FetchConflict
                    };
                    if self.sys.strategy == TxStrategy::Both {
                        // Commit mode takes precedence: the conflict only
                        // fails the transaction at commit time.
                        if sys.flag_abort(self.index, cause) {
                            sys.stats.aborted.fetch_add(1, Ordering::Relaxed);
                        }
                        tracing::trace!(cpu = self.index, ?cause, "conflict deferred to commit");
                        return Ok(());
                    }
                    tracing::trace!(cpu = self.index, ?cause, "transactional access conflict");
                    return Err(self.abort(cause));
                }
            }

            if stored == 0 && (sys.stats.active_cpus() <= 1 || owned) {
                // Lines were only fetch-claimed so far and this store owns
                // them (or no other transaction exists): upgrade to STORED.
                // A stale snapshot means someone applied a superseding
                // update; the upgrade is abandoned, not an error.
                if table.try_upgrade_stored(addr, len, word) {
                    sys.record_access(self.index, addr, len, true);
                } else {
                    tracing::trace!(cpu = self.index, "cache line status changed, upgrade abandoned");
                }
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests;
