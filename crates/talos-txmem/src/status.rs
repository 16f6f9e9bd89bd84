use std::sync::atomic::{AtomicU32, Ordering};

use talos_mem::{HostAddr, MainStore, PAGE_SHIFT, PAGE_SIZE};

/// log2 of the conflict-tracking granule.
pub const CACHE_LINE_SHIFT: u32 = 8;
/// Conflict-tracking granule in bytes.
pub const CACHE_LINE_SIZE: usize = 1 << CACHE_LINE_SHIFT;
/// Cache lines per guest page.
pub const LINES_PER_PAGE: usize = PAGE_SIZE / CACHE_LINE_SIZE;

/// FETCHED bits occupy the low half of a status word, one bit per line.
#[inline]
pub(crate) fn fetched_bits(mask: u16) -> u32 {
    mask as u32
}

/// STORED bits occupy the high half of a status word, one bit per line.
#[inline]
pub(crate) fn stored_bits(mask: u16) -> u32 {
    (mask as u32) << LINES_PER_PAGE
}

#[inline]
pub(crate) fn fetched_of(word: u32) -> u16 {
    word as u16
}

#[inline]
pub(crate) fn stored_of(word: u32) -> u16 {
    (word >> LINES_PER_PAGE) as u16
}

/// Per-line mask for the cache lines an access spans, clamped to its page.
///
/// `page_off` is the access offset within its page. Callers split accesses
/// at page boundaries, so clamping only matters for ranges that would run
/// past the end of the page.
#[inline]
pub(crate) fn span_mask(page_off: usize, len: usize) -> u16 {
    debug_assert!(page_off < PAGE_SIZE);
    let len = len.max(1);
    let first = page_off >> CACHE_LINE_SHIFT;
    let last_off = (page_off + len - 1).min(PAGE_SIZE - 1);
    let last = last_off >> CACHE_LINE_SHIFT;
    let width = last - first + 1;
    if width >= LINES_PER_PAGE {
        u16::MAX
    } else {
        (((1u32 << width) - 1) as u16) << first
    }
}

/// Status-update value for an access: writes claim lines as stored, reads
/// only as fetched.
#[inline]
pub(crate) fn merge_bits(mask: u16, is_write: bool) -> u32 {
    if is_write {
        fetched_bits(mask) | stored_bits(mask)
    } else {
        fetched_bits(mask)
    }
}

/// System-wide transactional status of every mainstore cache line.
///
/// One atomic word per guest page: a FETCHED and a STORED bit per 256-byte
/// line. Any CPU may update any word; all updates go through sequentially
/// consistent compare-and-swap so that a published STORED bit is observed by
/// every other CPU before the owning transaction can commit or be seen
/// aborted. Fast-path loads may be arbitrarily stale; every decision that
/// mutates the word re-validates against the loaded snapshot.
pub struct CacheLineStatusTable {
    base: *mut u8,
    words: Box<[AtomicU32]>,
}

// The raw base pointer is only used for address arithmetic relative to the
// mainstore the table was built from; the words themselves are atomics.
unsafe impl Send for CacheLineStatusTable {}
unsafe impl Sync for CacheLineStatusTable {}

impl CacheLineStatusTable {
    pub(crate) fn new(store: &MainStore) -> Self {
        let words = (0..store.page_count())
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            base: store.base().as_ptr(),
            words,
        }
    }

    #[inline]
    fn offset(&self, addr: HostAddr) -> usize {
        let off = addr.offset_from(HostAddr::from_mut_ptr(self.base));
        debug_assert!(off >> PAGE_SHIFT < self.words.len());
        off
    }

    /// Offset of `addr` within its page.
    #[inline]
    pub(crate) fn page_off(&self, addr: HostAddr) -> usize {
        self.offset(addr) & (PAGE_SIZE - 1)
    }

    /// Host location of the page containing `addr`.
    #[inline]
    pub(crate) fn page_base(&self, addr: HostAddr) -> HostAddr {
        let off = self.offset(addr) & !(PAGE_SIZE - 1);
        HostAddr::from_mut_ptr(self.base).byte_add(off)
    }

    #[inline]
    fn word(&self, addr: HostAddr) -> &AtomicU32 {
        &self.words[self.offset(addr) >> PAGE_SHIFT]
    }

    /// Snapshot of the status word covering `addr`'s page.
    #[inline]
    pub(crate) fn load(&self, addr: HostAddr) -> u32 {
        self.word(addr).load(Ordering::SeqCst)
    }

    /// Host locations of the line bases an access spans, clamped to its page.
    pub(crate) fn lines(&self, addr: HostAddr, len: usize) -> impl Iterator<Item = usize> + '_ {
        let page_off = self.page_off(addr);
        let mask = span_mask(page_off, len);
        let page = self.page_base(addr).as_ptr() as usize;
        (0..LINES_PER_PAGE)
            .filter(move |i| mask & (1 << i) != 0)
            .map(move |i| page + (i << CACHE_LINE_SHIFT))
    }

    /// Marks the spanned lines for an access, validating that the status
    /// word still matches `expected`. On mismatch the caller re-reads and
    /// re-decides; a blind OR here would let two CPUs publish first stores
    /// to the same line without either observing the other.
    pub(crate) fn try_mark(
        &self,
        addr: HostAddr,
        len: usize,
        is_write: bool,
        expected: u32,
    ) -> Result<(), u32> {
        let mask = span_mask(self.page_off(addr), len);
        let desired = expected | merge_bits(mask, is_write);
        match self
            .word(addr)
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(observed) => Err(observed),
        }
    }

    /// Upgrades the spanned lines to STORED, starting from the `snapshot`
    /// the caller based its conflict decision on.
    ///
    /// Retries while only unrelated lines' bits move underneath the swap.
    /// Once the spanned bits themselves no longer match the snapshot, the
    /// upgrade is stale (someone else applied an equivalent or superseding
    /// update) and is abandoned; returns whether the upgrade was applied.
    pub(crate) fn try_upgrade_stored(&self, addr: HostAddr, len: usize, snapshot: u32) -> bool {
        let mask = span_mask(self.page_off(addr), len);
        let span_bits = fetched_bits(mask) | stored_bits(mask);
        let mut expected = snapshot;
        loop {
            let desired = expected | stored_bits(mask);
            match self
                .word(addr)
                .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(observed) => {
                    if observed & span_bits != snapshot & span_bits {
                        return false;
                    }
                    expected = observed;
                }
            }
        }
    }

    /// Clears both status bits of each given line (absolute host locations
    /// of line bases, as kept in backout records).
    pub(crate) fn clear_lines<'a>(&self, lines: impl Iterator<Item = &'a usize>) {
        for &line in lines {
            let addr = HostAddr::from_mut_ptr(line as *mut u8);
            let i = (self.page_off(addr) >> CACHE_LINE_SHIFT) as u16;
            let bits = fetched_bits(1 << i) | stored_bits(1 << i);
            self.word(addr).fetch_and(!bits, Ordering::SeqCst);
        }
    }
}
