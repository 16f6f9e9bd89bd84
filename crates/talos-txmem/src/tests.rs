use super::*;

use crate::status::{fetched_of, merge_bits, span_mask, stored_of};
use std::sync::Arc;
use talos_mem::{HostAddr, MainStore, PAGE_SIZE};

fn setup(strategy: TxStrategy, cpus: usize) -> (Arc<MainStore>, Arc<TxSystem>) {
    let store = Arc::new(MainStore::new(4 * PAGE_SIZE));
    let sys = Arc::new(TxSystem::new(Arc::clone(&store), strategy, cpus));
    (store, sys)
}

fn write_access(addr: HostAddr, len: usize) -> TxAccess {
    TxAccess {
        addr,
        len,
        is_write: true,
        exempt: false,
    }
}

fn read_access(addr: HostAddr, len: usize) -> TxAccess {
    TxAccess {
        addr,
        len,
        is_write: false,
        exempt: false,
    }
}

#[test]
fn span_mask_single_line() {
    assert_eq!(span_mask(0, 1), 0x0001);
    assert_eq!(span_mask(0, CACHE_LINE_SIZE), 0x0001);
    assert_eq!(span_mask(0x100, 1), 0x0002);
    assert_eq!(span_mask(0xf00, 0x100), 0x8000);
}

#[test]
fn span_mask_multi_line() {
    // 8 bytes straddling the line 0 / line 1 boundary.
    assert_eq!(span_mask(0xfc, 8), 0x0003);
    // Three full lines starting at line 4.
    assert_eq!(span_mask(0x400, 3 * CACHE_LINE_SIZE), 0x0070);
}

#[test]
fn span_mask_clamps_to_page() {
    // A run that would extend past the page stops at the last line.
    assert_eq!(span_mask(0xf80, 0x400), 0x8000);
    assert_eq!(span_mask(0, 10 * PAGE_SIZE), u16::MAX);
}

#[test]
fn merge_bits_by_access_kind() {
    assert_eq!(merge_bits(0x0004, false), 0x0000_0004);
    assert_eq!(merge_bits(0x0004, true), 0x0004_0004);
}

#[test]
fn stored_upgrade_abandoned_on_stale_snapshot() {
    let (store, sys) = setup(TxStrategy::Backout, 1);
    let addr = store.addr(0x100).unwrap();

    sys.table.try_mark(addr, 1, false, 0).unwrap();
    let snapshot = sys.table.load(addr);

    assert!(sys.table.try_upgrade_stored(addr, 1, snapshot));
    // The spanned bits moved since the old snapshot: abandoned, not retried.
    assert!(!sys.table.try_upgrade_stored(addr, 1, snapshot));
}

#[test]
fn stored_upgrade_retries_past_unrelated_lines() {
    let (store, sys) = setup(TxStrategy::Backout, 1);
    let line0 = store.addr(0).unwrap();
    let line5 = store.addr(5 * CACHE_LINE_SIZE as u64).unwrap();

    sys.table.try_mark(line0, 1, false, 0).unwrap();
    let snapshot = sys.table.load(line0);
    // Another line's bits move underneath the upgrade; it must still land.
    sys.table.try_mark(line5, 1, false, snapshot).unwrap();

    assert!(sys.table.try_upgrade_stored(line0, 1, snapshot));
    let word = sys.table.load(line0);
    assert_ne!(stored_of(word) & 0x0001, 0);
}

#[test]
fn transactional_store_marks_and_commit_clears() {
    let (store, sys) = setup(TxStrategy::Backout, 1);
    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(0x40).unwrap();

    cpu.begin();
    let resolved = cpu.intercept(write_access(addr, 8)).unwrap();
    assert_eq!(resolved, addr);
    resolved.write_u8(0xaa);

    let word = sys.table.load(addr);
    assert_ne!(stored_of(word) & 0x0001, 0);
    assert_ne!(fetched_of(word) & 0x0001, 0);

    cpu.commit().unwrap();
    assert_eq!(sys.table.load(addr), 0);
    assert_eq!(addr.read_u8(), 0xaa);
    assert_eq!(sys.stats().started(), 1);
    assert_eq!(sys.stats().committed(), 1);
    assert_eq!(sys.stats().aborted(), 0);
}

#[test]
fn sole_transaction_never_aborts_on_its_own_lines() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut other = TxCpu::attach(Arc::clone(&sys), 1);
    // The other CPU's transaction is already finished.
    other.begin();
    other.commit().unwrap();

    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(PAGE_SIZE as u64).unwrap();
    cpu.begin();
    for _ in 0..16 {
        cpu.intercept(write_access(addr, 4)).unwrap();
        cpu.intercept(read_access(addr, 4)).unwrap();
    }
    cpu.commit().unwrap();
    assert_eq!(sys.stats().aborted(), 0);
}

#[test]
fn cross_transaction_store_conflict_aborts() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x200).unwrap();

    cpu0.begin();
    cpu1.begin();
    cpu0.intercept(write_access(addr, 8)).unwrap();

    let err = cpu1.intercept(write_access(addr, 8)).unwrap_err();
    assert_eq!(err.cause, AbortCause::StoreConflict);
    assert!(!cpu1.in_transaction());

    cpu0.commit().unwrap();
    assert_eq!(sys.stats().aborted(), 1);
}

#[test]
fn cross_transaction_fetch_conflict_aborts() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x200).unwrap();

    cpu0.begin();
    cpu1.begin();
    cpu0.intercept(write_access(addr, 1)).unwrap();

    let err = cpu1.intercept(read_access(addr, 1)).unwrap_err();
    assert_eq!(err.cause, AbortCause::FetchConflict);
}

#[test]
fn concurrent_readers_share_lines() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x300).unwrap();

    cpu0.begin();
    cpu1.begin();
    cpu0.intercept(read_access(addr, 8)).unwrap();
    cpu1.intercept(read_access(addr, 8)).unwrap();
    cpu0.commit().unwrap();
    cpu1.commit().unwrap();
    assert_eq!(sys.stats().aborted(), 0);
}

#[test]
fn ordinary_access_forces_backout() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(PAGE_SIZE as u64 + 0x100).unwrap();
    addr.write_u8(0x11);

    cpu0.begin();
    let resolved = cpu0.intercept(write_access(addr, 1)).unwrap();
    resolved.write_u8(0xaa);
    assert_eq!(addr.read_u8(), 0xaa);

    // cpu1 is not in a transaction; its read unwinds cpu0's stores first.
    let seen = cpu1.intercept(read_access(addr, 1)).unwrap();
    assert_eq!(seen, addr);
    assert_eq!(addr.read_u8(), 0x11);
    assert_eq!(sys.table.load(addr), 0);

    assert_eq!(cpu0.pending_abort(), Some(AbortCause::StoreConflict));
    let err = cpu0.commit().unwrap_err();
    assert_eq!(err.cause, AbortCause::StoreConflict);
    assert_eq!(sys.stats().aborted(), 1);
}

#[test]
fn exempt_access_is_never_intercepted() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x500).unwrap();

    cpu0.begin();
    let resolved = cpu0.intercept(write_access(addr, 1)).unwrap();
    resolved.write_u8(0xbb);

    let mut access = read_access(addr, 1);
    access.exempt = true;
    let seen = cpu1.intercept(access).unwrap();
    assert_eq!(seen, addr);
    // No backout happened: the store and its marks are intact.
    assert_eq!(addr.read_u8(), 0xbb);
    assert_eq!(cpu0.pending_abort(), None);
    assert_ne!(sys.table.load(addr), 0);
}

#[test]
fn non_transactional_store_override_is_consumed_once() {
    let (store, sys) = setup(TxStrategy::Backout, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x600).unwrap();

    cpu0.begin();
    cpu0.intercept(write_access(addr, 1)).unwrap();

    cpu1.begin();
    cpu1.set_non_transactional_store();
    // Bypasses interception once...
    cpu1.intercept(write_access(addr, 1)).unwrap();
    // ...and the next access conflicts as usual.
    let err = cpu1.intercept(write_access(addr, 1)).unwrap_err();
    assert_eq!(err.cause, AbortCause::StoreConflict);
}

#[test]
fn explicit_abort_restores_pre_images() {
    let (store, sys) = setup(TxStrategy::Backout, 1);
    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(0x700).unwrap();
    addr.write_u8(0x11);

    cpu.begin();
    let resolved = cpu.intercept(write_access(addr, 1)).unwrap();
    resolved.write_u8(0x22);

    let abort = cpu.abort(AbortCause::Other);
    assert_eq!(abort.cause, AbortCause::Other);
    assert_eq!(addr.read_u8(), 0x11);
    assert_eq!(sys.table.load(addr), 0);
    assert_eq!(sys.stats().aborted(), 1);
}

#[test]
fn nested_levels_flatten_into_outermost() {
    let (store, sys) = setup(TxStrategy::Backout, 1);
    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(0x40).unwrap();

    cpu.begin();
    cpu.begin();
    assert_eq!(cpu.nesting_depth(), 2);
    cpu.intercept(write_access(addr, 1)).unwrap();
    cpu.commit().unwrap();
    // Inner commit keeps the transaction (and its marks) live.
    assert!(cpu.in_transaction());
    assert_ne!(sys.table.load(addr), 0);
    cpu.commit().unwrap();
    assert_eq!(sys.table.load(addr), 0);
    assert_eq!(sys.stats().started(), 1);
    assert_eq!(sys.stats().committed(), 1);
}

#[test]
fn commit_strategy_redirects_and_publishes() {
    let (store, sys) = setup(TxStrategy::Commit, 1);
    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(0x123).unwrap();

    cpu.begin();
    let resolved = cpu.intercept(write_access(addr, 1)).unwrap();
    assert_ne!(resolved, addr);
    resolved.write_u8(0x55);
    // The store went to the shadow page, not mainstore.
    assert_eq!(addr.read_u8(), 0);

    cpu.commit().unwrap();
    assert_eq!(addr.read_u8(), 0x55);
}

#[test]
fn commit_strategy_rereads_same_shadow_page() {
    let (store, sys) = setup(TxStrategy::Commit, 1);
    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let a = store.addr(0x10).unwrap();
    let b = store.addr(0x20).unwrap();

    cpu.begin();
    let ra = cpu.intercept(write_access(a, 1)).unwrap();
    ra.write_u8(0x77);
    // A later read of the same page must observe the transaction's store.
    let rb = cpu.intercept(read_access(b, 1)).unwrap();
    assert_eq!(rb.read_u8(), 0);
    let ra2 = cpu.intercept(read_access(a, 1)).unwrap();
    assert_eq!(ra2.read_u8(), 0x77);
    cpu.commit().unwrap();
}

#[test]
fn commit_strategy_fails_when_mainstore_moved() {
    let (store, sys) = setup(TxStrategy::Commit, 1);
    let mut cpu = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(0x123).unwrap();

    cpu.begin();
    let resolved = cpu.intercept(write_access(addr, 1)).unwrap();
    resolved.write_u8(0x55);

    // Mainstore changes under the captured snapshot before commit.
    addr.write_u8(0x99);
    let err = cpu.commit().unwrap_err();
    assert_eq!(err.cause, AbortCause::StoreConflict);
    assert_eq!(addr.read_u8(), 0x99);
    assert_eq!(sys.stats().aborted(), 1);
}

#[test]
fn dual_mode_redirects_while_backout_bookkeeping_runs() {
    let (store, sys) = setup(TxStrategy::Both, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let addr = store.addr(0x80).unwrap();

    cpu0.begin();
    let resolved = cpu0.intercept(write_access(addr, 1)).unwrap();
    // Commit-mode redirection wins; backout bookkeeping still marked the line.
    assert_ne!(resolved, addr);
    assert_ne!(stored_of(sys.table.load(addr)) & 0x0001, 0);
    resolved.write_u8(0x42);
    assert_eq!(addr.read_u8(), 0);

    cpu0.commit().unwrap();
    assert_eq!(addr.read_u8(), 0x42);
    assert_eq!(sys.table.load(addr), 0);
}

#[test]
fn dual_mode_defers_conflicts_to_commit() {
    let (store, sys) = setup(TxStrategy::Both, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x80).unwrap();

    cpu0.begin();
    cpu1.begin();
    cpu0.intercept(write_access(addr, 1)).unwrap();

    // The conflicting access itself succeeds under dual mode.
    let resolved = cpu1.intercept(write_access(addr, 1)).unwrap();
    resolved.write_u8(0x13);
    assert_eq!(cpu1.pending_abort(), Some(AbortCause::StoreConflict));

    let err = cpu1.commit().unwrap_err();
    assert_eq!(err.cause, AbortCause::StoreConflict);
    // The loser's stores never reached mainstore.
    assert_eq!(addr.read_u8(), 0);

    cpu0.commit().unwrap();
}

#[test]
fn dual_mode_forced_backout_leaves_mainstore_alone() {
    let (store, sys) = setup(TxStrategy::Both, 2);
    let mut cpu0 = TxCpu::attach(Arc::clone(&sys), 0);
    let mut cpu1 = TxCpu::attach(Arc::clone(&sys), 1);
    let addr = store.addr(0x900).unwrap();
    addr.write_u8(0x11);

    cpu0.begin();
    let resolved = cpu0.intercept(write_access(addr, 1)).unwrap();
    resolved.write_u8(0xaa);

    cpu1.intercept(read_access(addr, 1)).unwrap();
    // The victim's store only ever lived in its shadow page.
    assert_eq!(addr.read_u8(), 0x11);
    assert!(cpu0.commit().is_err());
    assert_eq!(addr.read_u8(), 0x11);
}

mod span_props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn span_mask_covers_expected_lines(off in 0usize..PAGE_SIZE, len in 1usize..2 * PAGE_SIZE) {
            let mask = span_mask(off, len);
            prop_assert_ne!(mask, 0);

            let first = off >> CACHE_LINE_SHIFT;
            let last = (off + len - 1).min(PAGE_SIZE - 1) >> CACHE_LINE_SHIFT;
            prop_assert_eq!(mask.trailing_zeros() as usize, first);
            prop_assert_eq!(mask.count_ones() as usize, last - first + 1);
            // Contiguous run of bits.
            let shifted = mask >> first;
            prop_assert_eq!(shifted & (shifted + 1), 0);
        }
    }
}
