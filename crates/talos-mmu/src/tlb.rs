use talos_mem::{HostAddr, PAGE_SHIFT};

use crate::AccessFlags;

pub(crate) const TLB_ENTRIES: usize = 256;

/// The cache epoch tag occupies the page-offset bits of a recorded virtual
/// identity, so `page | epoch` is a single comparable word.
pub(crate) const EPOCH_MASK: u64 = (1 << PAGE_SHIFT) - 1;

/// One memoized translation.
///
/// `vaddr_id` is the translated page address combined with the owning CPU's
/// cache epoch at population time. Entries from an earlier epoch can never
/// match a current identity, which is what makes [`purge`](crate::CpuContext::purge_tlb)
/// free of per-entry work. A zeroed entry never matches either, since live
/// epochs start at 1.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntry {
    asd: u64,
    common: u8,
    key: u8,
    vaddr_id: u64,
    acc: AccessFlags,
    frame: HostAddr,
    storkey: u8,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            asd: 0,
            common: 0,
            key: 0,
            vaddr_id: 0,
            acc: AccessFlags::empty(),
            frame: HostAddr::from_mut_ptr(core::ptr::null_mut()),
            storkey: 0,
        }
    }
}

impl TlbEntry {
    /// The address space still matches when the selector resolved to
    /// control register 0 (real, instruction-space, or forced-AR
    /// addressing), when the live designator equals the recorded one, or
    /// when the page sits in a segment both bitmasks flag as common.
    #[inline]
    pub(crate) fn space_matches(&self, crn: usize, asd: u64, common: u8) -> bool {
        crn == 0 || asd == self.asd || (common & self.common) != 0
    }

    /// Key zero accesses everything; otherwise the requested key must be
    /// the one the translation was validated with.
    #[inline]
    pub(crate) fn key_matches(&self, key: u8) -> bool {
        key == 0 || key == self.key
    }

    #[inline]
    pub(crate) fn identity_matches(&self, ident: u64) -> bool {
        ident == self.vaddr_id
    }

    /// Storage must be accessed a way this entry was validated for.
    #[inline]
    pub(crate) fn access_matches(&self, acc: AccessFlags) -> bool {
        self.acc.intersects(acc)
    }

    #[inline]
    pub(crate) fn frame(&self) -> HostAddr {
        self.frame
    }

    #[inline]
    pub(crate) fn storkey(&self) -> u8 {
        self.storkey
    }
}

/// Per-CPU translation cache: a direct-mapped array indexed by a hash of
/// the logical page number. Owned and mutated only by its CPU context.
#[derive(Debug)]
pub(crate) struct Tlb {
    entries: Box<[TlbEntry]>,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![TlbEntry::default(); TLB_ENTRIES].into_boxed_slice(),
        }
    }

    #[inline]
    fn entry_index(page: u64) -> usize {
        // Simple xor folding of the page number.
        let tag = page >> PAGE_SHIFT;
        let x = tag ^ (tag >> 17) ^ (tag >> 35);
        (x as usize) & (TLB_ENTRIES - 1)
    }

    /// The validity check: all four sub-predicates must hold at once.
    /// There is no point short-circuiting cleverly; a miss re-derives
    /// everything through the full translator anyway.
    #[inline]
    pub(crate) fn lookup(
        &self,
        ident: u64,
        crn: usize,
        asd: u64,
        common: u8,
        key: u8,
        acc: AccessFlags,
    ) -> Option<&TlbEntry> {
        let entry = &self.entries[Self::entry_index(ident & !EPOCH_MASK)];
        let hit = entry.space_matches(crn, asd, common)
            && entry.key_matches(key)
            && entry.identity_matches(ident)
            && entry.access_matches(acc);
        hit.then_some(entry)
    }

    pub(crate) fn install(
        &mut self,
        ident: u64,
        asd: u64,
        common: u8,
        key: u8,
        acc: AccessFlags,
        frame: HostAddr,
        storkey: u8,
    ) {
        self.entries[Self::entry_index(ident & !EPOCH_MASK)] = TlbEntry {
            asd,
            common,
            key,
            vaddr_id: ident,
            acc,
            frame,
            storkey,
        };
    }

    pub(crate) fn clear(&mut self) {
        self.entries.fill(TlbEntry::default());
    }
}
