//! Logical-address resolution fast path with a per-CPU translation cache.
//!
//! Every guest storage access goes through [`CpuContext::resolve`]:
//! - a translation-cache hit returns the memoized host location directly;
//! - a miss calls out to the external [`FullTranslator`], which walks the
//!   full translation structures and populates the cache as a side effect;
//! - the resolved location then passes through the transactional conflict
//!   detector (`talos-txmem`) when the CPU has transactional execution
//!   enabled, which may redirect it or abort the current transaction.
//!
//! The cache itself is exclusively owned by its CPU context; only the
//! conflict detector's shared state crosses thread boundaries.

mod tlb;

use bitflags::bitflags;
use talos_mem::{HostAddr, PAGE_SIZE};
use talos_txmem::{TransactionAbort, TxAccess, TxCpu};
use thiserror::Error;
use tlb::{Tlb, EPOCH_MASK};


/// Control registers shadowed per CPU.
pub const CR_COUNT: usize = 16;
/// Access registers per CPU.
pub const AR_COUNT: usize = 16;

bitflags! {
    /// Kinds of storage access a translation is requested, and a cache
    /// entry validated, for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const INSTFETCH = 1 << 2;
        /// Propagate the cached storage key for the downstream protection
        /// check.
        const CHECK = 1 << 3;
    }
}

/// Which address space an access resolves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceSelector {
    /// Access-register mode through the numbered access register.
    Ar(u8),
    /// AR-mode translation forced regardless of the current address-space
    /// control.
    ForcedAr(u8),
    Primary,
    Secondary,
    Home,
    /// Instruction fetching through the instruction space.
    InstSpace,
    /// Real-address translation.
    RealAddr,
}

impl SpaceSelector {
    /// Instruction fetches and real-address translation follow the
    /// non-transactional rules and are never conflict-intercepted.
    #[inline]
    fn is_conflict_exempt(self) -> bool {
        matches!(self, SpaceSelector::InstSpace | SpaceSelector::RealAddr)
    }
}

/// One logical storage access to resolve.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest {
    /// Logical address.
    pub addr: u64,
    /// Access length in bytes; accesses never cross a page boundary (the
    /// bus layer splits them).
    pub len: usize,
    pub selector: SpaceSelector,
    pub acc: AccessFlags,
    /// Storage-protection access key; zero matches any cached key.
    pub key: u8,
}

/// Raised by the full translator on an unmapped, invalid, or protected
/// address. This crate never constructs one; it only propagates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("translation fault at {addr:#x} (interruption code {code:#06x})")]
pub struct TranslationFault {
    pub addr: u64,
    pub code: u16,
}

/// Everything that can unwind out of [`CpuContext::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error(transparent)]
    Translation(#[from] TranslationFault),
    #[error(transparent)]
    Abort(#[from] TransactionAbort),
}

/// The full table-walk translation service invoked on a cache miss.
///
/// The translator performs the complete walk with every protection and
/// special-address-space check, raises [`TranslationFault`] on invalid
/// translations, and populates the cache through
/// [`CpuContext::install_entry`] so subsequent accesses hit.
pub trait FullTranslator {
    fn translate(
        &mut self,
        req: &AccessRequest,
        cpu: &mut CpuContext,
    ) -> Result<HostAddr, TranslationFault>;
}

impl<T: FullTranslator + ?Sized> FullTranslator for &mut T {
    #[inline]
    fn translate(
        &mut self,
        req: &AccessRequest,
        cpu: &mut CpuContext,
    ) -> Result<HostAddr, TranslationFault> {
        <T as FullTranslator>::translate(&mut **self, req, cpu)
    }
}

/// Address-space-number services consumed by dual-address-space builds.
/// Declared here for those builds; nothing in this crate calls them.
#[cfg(feature = "dual-address-space")]
pub trait AsnServices {
    fn translate_asn(
        &mut self,
        asn: u16,
        cpu: &mut CpuContext,
    ) -> Result<u32, TranslationFault>;

    fn authorize_asn(
        &mut self,
        ax: u16,
        aste: u32,
        cpu: &mut CpuContext,
    ) -> Result<bool, TranslationFault>;
}

/// Optional translation-cache statistics.
///
/// When the `stats` feature is disabled this type is empty and
/// [`CpuContext::stats`] always returns `None`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DatStats {
    /// Cache lookups performed.
    #[cfg(feature = "stats")]
    pub lookups: u64,
    /// Lookups satisfied from the cache.
    #[cfg(feature = "stats")]
    pub hits: u64,
    /// Lookups that called out to the full translator.
    #[cfg(feature = "stats")]
    pub misses: u64,
}

impl DatStats {
    #[inline]
    pub fn lookups(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.lookups
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn hits(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.hits
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn misses(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.misses
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }
}

/// Attributes of a translation being installed into the cache by the full
/// translator.
#[derive(Debug, Clone, Copy)]
pub struct EntryAttributes {
    /// Address-space designator the translation was performed under.
    pub asd: u64,
    /// Common-segment membership bits for the page.
    pub common: u8,
    /// Storage-protection key the translation was validated with.
    pub key: u8,
    /// Access kinds the translation is valid for.
    pub acc: AccessFlags,
    /// Host location of the page frame.
    pub frame: HostAddr,
    /// Storage key snapshot to propagate on protection-checked hits.
    pub storkey: u8,
}

/// Per-CPU translation state: the translation cache, the control-register
/// and access-register shadows the validity check consults, and the CPU's
/// transactional-execution state.
pub struct CpuContext {
    cr: [u64; CR_COUNT],
    /// Access register -> control register shadow map; zero means the
    /// selector resolves outside designator comparison.
    aea_ar: [u8; AR_COUNT],
    /// Per control register: common-segment bits currently addressable.
    aea_common: [u8; CR_COUNT],
    /// Cache identity tag; bumping it invalidates every entry at once.
    epoch: u16,
    tlb: Tlb,
    /// Storage key propagated by the latest protection-checked hit,
    /// consumed by the external protection-check stage.
    op_storage_key: u8,
    tx: Option<TxCpu>,
    #[cfg(feature = "stats")]
    stats: DatStats,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuContext {
    pub fn new() -> Self {
        let mut aea_ar = [0u8; AR_COUNT];
        // AR0 designates the primary space.
        aea_ar[0] = 1;
        Self {
            cr: [0; CR_COUNT],
            aea_ar,
            aea_common: [0; CR_COUNT],
            epoch: 1,
            tlb: Tlb::new(),
            op_storage_key: 0,
            tx: None,
            #[cfg(feature = "stats")]
            stats: DatStats::default(),
        }
    }

    /// A context with transactional execution enabled.
    pub fn with_transactions(tx: TxCpu) -> Self {
        let mut ctx = Self::new();
        ctx.tx = Some(tx);
        ctx
    }

    #[inline]
    pub fn control(&self, n: usize) -> u64 {
        self.cr[n]
    }

    #[inline]
    pub fn set_control(&mut self, n: usize, value: u64) {
        self.cr[n] = value;
    }

    /// Points access register `ar` at control register `crn` (zero takes
    /// the register out of designator comparison).
    #[inline]
    pub fn set_ar_map(&mut self, ar: usize, crn: u8) {
        debug_assert!((crn as usize) < CR_COUNT);
        self.aea_ar[ar] = crn;
    }

    /// Common-segment bits currently addressable through control register
    /// `crn`.
    #[inline]
    pub fn set_common_mask(&mut self, crn: usize, mask: u8) {
        self.aea_common[crn] = mask;
    }

    /// Control register index a selector resolves through.
    #[inline]
    pub fn control_reg_index(&self, selector: SpaceSelector) -> usize {
        match selector {
            SpaceSelector::ForcedAr(_) | SpaceSelector::InstSpace | SpaceSelector::RealAddr => 0,
            SpaceSelector::Ar(n) => self.aea_ar[n as usize] as usize,
            SpaceSelector::Primary => 1,
            SpaceSelector::Secondary => 7,
            SpaceSelector::Home => 13,
        }
    }

    /// Storage key left behind by the latest protection-checked hit.
    #[inline]
    pub fn op_storage_key(&self) -> u8 {
        self.op_storage_key
    }

    #[inline]
    pub fn tx(&self) -> Option<&TxCpu> {
        self.tx.as_ref()
    }

    #[inline]
    pub fn tx_mut(&mut self) -> Option<&mut TxCpu> {
        self.tx.as_mut()
    }

    /// Invalidates the whole translation cache by bumping the identity
    /// epoch. Entries are only rewritten when the tag space wraps and old
    /// tags could otherwise come back to life.
    pub fn purge_tlb(&mut self) {
        self.epoch += 1;
        if u64::from(self.epoch) > EPOCH_MASK {
            self.epoch = 1;
            self.tlb.clear();
        }
    }

    /// Current-epoch virtual identity of a logical address.
    #[inline]
    fn identity(&self, addr: u64) -> u64 {
        (addr & !EPOCH_MASK) | u64::from(self.epoch)
    }

    /// Populates the cache with a completed translation. Called by the
    /// full translator as its side effect; the next matching access hits.
    pub fn install_entry(&mut self, addr: u64, attrs: EntryAttributes) {
        let ident = self.identity(addr);
        self.tlb.install(
            ident,
            attrs.asd,
            attrs.common,
            attrs.key,
            attrs.acc,
            attrs.frame,
            attrs.storkey,
        );
    }

    /// Returns current statistics when the `stats` feature is enabled.
    #[inline]
    pub fn stats(&self) -> Option<DatStats> {
        #[cfg(feature = "stats")]
        {
            Some(self.stats)
        }

        #[cfg(not(feature = "stats"))]
        {
            None
        }
    }

    /// Resets statistics counters when the `stats` feature is enabled.
    #[inline]
    pub fn reset_stats(&mut self) {
        #[cfg(feature = "stats")]
        {
            self.stats = DatStats::default();
        }
    }

    /// Resolves a logical address to a directly usable host location.
    ///
    /// Cache hit or not, the result passes through the transactional
    /// conflict detector when this CPU has transactional execution
    /// enabled; the location actually returned may therefore be a shadow
    /// redirect, and a genuine cross-transaction conflict unwinds as
    /// [`AccessError::Abort`] without completing the access.
    pub fn resolve(
        &mut self,
        translator: &mut impl FullTranslator,
        req: &AccessRequest,
    ) -> Result<HostAddr, AccessError> {
        debug_assert!(req.len > 0);
        debug_assert!((req.addr as usize & (PAGE_SIZE - 1)) + req.len <= PAGE_SIZE);

        #[cfg(feature = "stats")]
        {
            self.stats.lookups = self.stats.lookups.wrapping_add(1);
        }

        let crn = self.control_reg_index(req.selector);
        let ident = self.identity(req.addr);
        let hit = self
            .tlb
            .lookup(ident, crn, self.cr[crn], self.aea_common[crn], req.key, req.acc)
            .map(|entry| (entry.frame(), entry.storkey()));

        let maddr = match hit {
            Some((frame, storkey)) => {
                #[cfg(feature = "stats")]
                {
                    self.stats.hits = self.stats.hits.wrapping_add(1);
                }
                if req.acc.contains(AccessFlags::CHECK) {
                    self.op_storage_key = storkey;
                }
                frame.byte_add(req.addr as usize & (PAGE_SIZE - 1))
            }
            None => {
                #[cfg(feature = "stats")]
                {
                    self.stats.misses = self.stats.misses.wrapping_add(1);
                }
                translator.translate(req, self)?
            }
        };

        let Some(tx) = self.tx.as_mut() else {
            return Ok(maddr);
        };
        let access = TxAccess {
            addr: maddr,
            len: req.len,
            is_write: req.acc.contains(AccessFlags::WRITE),
            exempt: req.selector.is_conflict_exempt(),
        };
        Ok(tx.intercept(access)?)
    }
}
