//! End-to-end exercises of the MMU service against the emulated CPU:
//! the full bring-up sequence, the mapping API, context stealing,
//! attribute tracking and the failure paths.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmap::vmparam::{KERNEL_PID, MINCTX, NTLB, NUMCTX, PAGE_SIZE, PTMAP, VM_MIN_KERNEL_ADDRESS};
use kernel_pmap::{
    CpuMmu, EmulatedCpu, HeapVm, MapFlags, MemRegion, Mmu, PageAttr, PmapError, Prot, SlotFlags,
    TlbLo, VmBackend,
};

fn pa(v: u32) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

/// A board with 32 MiB of RAM, the kernel image in the first megabyte and
/// four reserved I/O windows, brought all the way up.
fn fixture() -> Mmu<EmulatedCpu, HeapVm> {
    let mut mmu = Mmu::new(EmulatedCpu::new(), HeapVm::new());
    for i in 0..4u32 {
        mmu.reserve(
            pa(0xEF60_0000 + i * 0x10_0000),
            va(0xEF60_0000 + i * 0x10_0000),
            0x10_0000,
            TlbLo::new().with_inhibited(true).with_guarded(true),
        );
    }
    let mem = [MemRegion {
        start: pa(0),
        size: 0x0200_0000,
    }];
    mmu.bootstrap(pa(0), pa(0x0010_0000), &mem, &mem, None);
    mmu.init();
    mmu
}

#[test]
fn bootstrap_establishes_the_layout() {
    let mut mmu = fixture();

    assert_eq!(mmu.tlb_reserved(), 4);
    for slot in 0..4 {
        let info = mmu.tlb_entry(slot);
        assert!(info.flags.contains(SlotFlags::LOCKED | SlotFlags::USED));
        assert_eq!(info.ctx, KERNEL_PID);
    }
    assert_eq!(mmu.cpu().zones().into_bits(), 0x1B00_0000);

    let kpm = mmu.kernel_pmap();
    assert_eq!(mmu.context_of(kpm), KERNEL_PID);
    assert_eq!(mmu.kernmap(), va(0x0010_0000));
    assert_eq!(mmu.physmem(), 0x0200_0000 >> 14);

    // message buffer at the tail of RAM, carved out of the free pages
    assert_eq!(mmu.msgbuf_paddr(), Some(pa(0x01FF_C000)));
    assert!(!mmu.backend().page_is_managed(pa(0x01FF_C000)));
    // the kernel image is not managed either, the rest is
    assert!(!mmu.backend().page_is_managed(pa(0x0008_0000)));
    assert!(mmu.backend().page_is_managed(pa(0x0010_0000)));
    assert_eq!(mmu.backend().page_size, Some(PAGE_SIZE));

    mmu.verify_invariants();
}

#[test]
fn wired_kernel_enter_defers_the_tlb() {
    // wired mappings defer their TLB preload until the first miss
    let mut mmu = fixture();
    let kpm = mmu.kernel_pmap();

    mmu.enter(kpm, va(0x8000_0000), pa(0x0010_0000), Prot::READ | Prot::WRITE, MapFlags::WIRED)
        .unwrap();

    assert_eq!(mmu.extract(kpm, va(0x8000_0000)), Some(pa(0x0010_0000)));
    assert_eq!(mmu.resident_count(kpm), 1);
    assert_eq!(mmu.wired_count(kpm), 1);
    // the wired path defers: nothing was installed
    assert_eq!(mmu.tlb_counters().enters, 0);
    assert_eq!(mmu.cpu_mut().tlb_search(va(0x8000_0000), KERNEL_PID), None);

    mmu.verify_invariants();

    mmu.unwire(kpm, va(0x8000_0000));
    assert_eq!(mmu.wired_count(kpm), 0);
    mmu.remove(kpm, va(0x8000_0000), va(0x8000_4000));
    assert_eq!(mmu.resident_count(kpm), 0);
    mmu.verify_invariants();
}

#[test]
fn user_mapping_faults_in_through_tlb_miss() {
    // contexts 2 and 3 are free initially; the first allocation gets 2
    let mut mmu = fixture();
    let pm2 = mmu.create();
    assert_eq!(mmu.ctx_alloc(pm2), 2);

    mmu.enter(pm2, va(0x1000), pa(0x0020_0000), Prot::READ | Prot::EXECUTE, MapFlags::empty())
        .unwrap();

    assert!(mmu.tlb_miss(va(0x1000), 2));
    assert!(mmu.cpu_mut().tlb_search(va(0x1000), 2).is_some());
    assert!(mmu.tlb_counters().misses >= 1);

    mmu.verify_invariants();
}

#[test]
fn tlb_miss_reports_unmapped_addresses() {
    let mut mmu = fixture();
    let pm = mmu.create();
    let ctx = mmu.ctx_alloc(pm);

    // no translation at all
    assert!(!mmu.tlb_miss(va(0x0004_0000), ctx));
    // kernel VA inside the managed range with no leaf table
    assert!(!mmu.tlb_miss(VM_MIN_KERNEL_ADDRESS, KERNEL_PID));
    // a context nobody owns
    assert!(!mmu.tlb_miss(va(0x0004_0000), 200));
}

#[test]
fn kernel_miss_in_the_physical_window_synthesizes_a_direct_map() {
    let mut mmu = fixture();

    assert!(mmu.tlb_miss(va(0x0123_4567), KERNEL_PID));
    let slot = mmu
        .cpu_mut()
        .tlb_search(va(0x0123_4567), KERNEL_PID)
        .expect("direct map installed");
    let raw = mmu.cpu().slot(slot);
    assert_eq!(raw.lo.rpn().as_u32(), 0x0100_0000);
    assert!(raw.lo.writable());
    assert_eq!(raw.hi.size(), 7); // 16 MiB

    mmu.verify_invariants();
}

#[test]
fn context_exhaustion_steals_the_oldest() {
    // fill every stealable context, then ask for one more
    let mut mmu = fixture();

    let mut pmaps = Vec::new();
    for _ in MINCTX as usize..NUMCTX {
        let pm = mmu.create();
        mmu.ctx_alloc(pm);
        pmaps.push(pm);
    }
    assert_eq!(mmu.context_of(pmaps[0]), 2);

    // give context 2 a TLB presence so the steal has something to flush
    mmu.enter(pmaps[0], va(0x4000), pa(0x0040_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    assert!(mmu.cpu().valid_for_ctx(2) > 0);

    let late = mmu.create();
    let got = mmu.ctx_alloc(late);
    assert_eq!(got, 2);
    assert_eq!(mmu.context_of(pmaps[0]), 0);
    assert_eq!(mmu.cpu().valid_for_ctx(2), 0);

    mmu.verify_invariants();
}

#[test]
fn modify_tracking_via_check_attr() {
    // enter, "write" (the write fault re-enters), then test CHG
    let mut mmu = fixture();
    let pm = mmu.create();
    let ctx = mmu.ctx_alloc(pm);
    let (mva, mpa) = (va(0x0002_8000), pa(0x0080_0000));

    mmu.enter(pm, mva, mpa, Prot::READ | Prot::WRITE, MapFlags::empty())
        .unwrap();
    assert!(!mmu.check_attr(mpa, PageAttr::CHG, false));

    // the write fault carries the access type
    mmu.enter(pm, mva, mpa, Prot::READ | Prot::WRITE, MapFlags::READ | MapFlags::WRITE)
        .unwrap();

    assert!(mmu.check_attr(mpa, PageAttr::CHG, true));
    // cleared now, and every mapping dropped to read-only + flushed
    assert!(!mmu.check_attr(mpa, PageAttr::CHG, false));
    assert_eq!(mmu.cpu_mut().tlb_search(mva, ctx), None);
    assert_eq!(mmu.extract(pm, mva), Some(mpa));

    // a non-write re-access leaves CHG clear
    mmu.enter(pm, mva, mpa, Prot::READ | Prot::WRITE, MapFlags::READ)
        .unwrap();
    assert!(!mmu.check_attr(mpa, PageAttr::CHG, false));
    assert!(mmu.check_attr(mpa, PageAttr::REF, false));

    mmu.verify_invariants();
}

#[test]
fn page_protect_none_unmaps_every_alias() {
    // one frame aliased by two address spaces
    let mut mmu = fixture();
    let pm_a = mmu.create();
    let pm_b = mmu.create();
    mmu.ctx_alloc(pm_a);
    mmu.ctx_alloc(pm_b);
    let frame = pa(0x0100_0000);

    mmu.enter(pm_a, va(0x0000_4000), frame, Prot::READ | Prot::WRITE, MapFlags::READ)
        .unwrap();
    mmu.enter(pm_b, va(0x0073_8000), frame, Prot::READ, MapFlags::READ)
        .unwrap();
    assert_eq!(mmu.page_mapping_count(frame), 2);

    mmu.page_protect(frame, Prot::empty());

    assert_eq!(mmu.extract(pm_a, va(0x0000_4000)), None);
    assert_eq!(mmu.extract(pm_b, va(0x0073_8000)), None);
    assert_eq!(mmu.page_mapping_count(frame), 0);
    assert_eq!(mmu.resident_count(pm_a), 0);
    assert_eq!(mmu.resident_count(pm_b), 0);

    mmu.verify_invariants();
}

#[test]
fn page_protect_read_strips_write_everywhere() {
    let mut mmu = fixture();
    let pm_a = mmu.create();
    let pm_b = mmu.create();
    mmu.ctx_alloc(pm_a);
    mmu.ctx_alloc(pm_b);
    let frame = pa(0x0100_0000);

    mmu.enter(pm_a, va(0x0000_4000), frame, Prot::READ | Prot::WRITE, MapFlags::WRITE)
        .unwrap();
    mmu.enter(pm_b, va(0x0073_8000), frame, Prot::READ | Prot::WRITE, MapFlags::WRITE)
        .unwrap();

    mmu.page_protect(frame, Prot::READ);

    // still mapped, still two aliases
    assert_eq!(mmu.extract(pm_a, va(0x0000_4000)), Some(frame));
    assert_eq!(mmu.page_mapping_count(frame), 2);
    mmu.verify_invariants();
}

#[test]
fn reserved_windows_resolve_through_mapiodev() {
    // a reserved window resolves physical ranges it covers
    let mut mmu = fixture();
    assert_eq!(mmu.mapiodev(pa(0xEF60_0100), 256), Some(va(0xEF60_0100)));
    assert_eq!(mmu.mapiodev(pa(0xEFA0_0000), 16), None);
}

#[test]
fn enter_then_remove_restores_the_counters() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    for i in 0..8u32 {
        mmu.enter(
            pm,
            va(0x0001_0000 + i * PAGE_SIZE),
            pa(0x0050_0000 + i * PAGE_SIZE),
            Prot::READ | Prot::WRITE,
            MapFlags::READ,
        )
        .unwrap();
    }
    assert_eq!(mmu.resident_count(pm), 8);
    mmu.verify_invariants();

    mmu.remove(pm, va(0x0001_0000), va(0x0001_0000 + 8 * PAGE_SIZE));
    assert_eq!(mmu.resident_count(pm), 0);
    assert_eq!(mmu.wired_count(pm), 0);
    for i in 0..8u32 {
        assert_eq!(mmu.extract(pm, va(0x0001_0000 + i * PAGE_SIZE)), None);
    }
    mmu.verify_invariants();
}

#[test]
fn reentering_a_mapping_replaces_it() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    mmu.enter(pm, va(0x4000), pa(0x0040_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    mmu.enter(pm, va(0x4000), pa(0x0044_0000), Prot::READ, MapFlags::READ)
        .unwrap();

    assert_eq!(mmu.extract(pm, va(0x4000)), Some(pa(0x0044_0000)));
    assert_eq!(mmu.resident_count(pm), 1);
    assert_eq!(mmu.page_mapping_count(pa(0x0040_0000)), 0);
    assert_eq!(mmu.page_mapping_count(pa(0x0044_0000)), 1);
    mmu.verify_invariants();
}

#[test]
fn protect_read_is_idempotent() {
    let mut mmu = fixture();
    let pm = mmu.create();
    let ctx = mmu.ctx_alloc(pm);

    mmu.enter(pm, va(0x4000), pa(0x0040_0000), Prot::READ | Prot::WRITE, MapFlags::WRITE)
        .unwrap();
    mmu.protect(pm, va(0x4000), va(0x8000), Prot::READ);
    let once = (
        mmu.extract(pm, va(0x4000)),
        mmu.resident_count(pm),
        mmu.cpu_mut().tlb_search(va(0x4000), ctx),
    );
    mmu.protect(pm, va(0x4000), va(0x8000), Prot::READ);
    let twice = (
        mmu.extract(pm, va(0x4000)),
        mmu.resident_count(pm),
        mmu.cpu_mut().tlb_search(va(0x4000), ctx),
    );
    assert_eq!(once, twice);
    mmu.verify_invariants();
}

#[test]
fn protect_without_read_degenerates_to_remove() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    mmu.enter(pm, va(0x4000), pa(0x0040_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    mmu.protect(pm, va(0x4000), va(0x8000), Prot::empty());
    assert_eq!(mmu.extract(pm, va(0x4000)), None);
    assert_eq!(mmu.resident_count(pm), 0);
}

#[test]
fn kenter_kremove_roundtrip() {
    let mut mmu = fixture();
    let kpm = mmu.kernel_pmap();
    let kva = va(0xC000_0000);

    mmu.kenter_pa(kva, pa(0x0060_0000), Prot::READ | Prot::WRITE, MapFlags::empty());
    assert_eq!(mmu.extract(kpm, kva), Some(pa(0x0060_0000)));
    assert_eq!(mmu.resident_count(kpm), 1);
    // no reverse-map tracking for kernel enters
    assert_eq!(mmu.page_mapping_count(pa(0x0060_0000)), 0);

    // a kernel miss inside the managed range now resolves from the table
    assert!(mmu.tlb_miss(kva, KERNEL_PID));

    mmu.kremove(kva, PAGE_SIZE);
    assert_eq!(mmu.extract(kpm, kva), None);
    assert_eq!(mmu.resident_count(kpm), 0);
    assert_eq!(mmu.cpu_mut().tlb_search(kva, KERNEL_PID), None);
    mmu.verify_invariants();
}

#[test]
fn enter_oom_with_canfail_backs_out_cleanly() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    mmu.backend_mut().fail_pt_allocs = 1;
    let r = mmu.enter(
        pm,
        va(0x4000),
        pa(0x0040_0000),
        Prot::READ,
        MapFlags::READ | MapFlags::CANFAIL,
    );
    assert_eq!(r, Err(PmapError::OutOfMemory));

    // no half-entered state: no PV entry, no translation, counters flat
    assert_eq!(mmu.page_mapping_count(pa(0x0040_0000)), 0);
    assert_eq!(mmu.extract(pm, va(0x4000)), None);
    assert_eq!(mmu.resident_count(pm), 0);
    assert_eq!(mmu.wired_count(pm), 0);
    mmu.verify_invariants();

    // the next attempt succeeds
    mmu.enter(pm, va(0x4000), pa(0x0040_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    assert_eq!(mmu.resident_count(pm), 1);
}

#[test]
#[should_panic(expected = "pte_enter")]
fn enter_oom_without_canfail_panics() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.backend_mut().fail_pt_allocs = 1;
    let _ = mmu.enter(pm, va(0x4000), pa(0x0040_0000), Prot::READ, MapFlags::READ);
}

#[test]
fn destroy_returns_every_leaf_table() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);
    let ctx = mmu.context_of(pm);

    // two mappings far apart: two leaf tables
    mmu.enter(pm, va(0x0000_4000), pa(0x0040_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    mmu.enter(pm, va(0x1000_0000), pa(0x0044_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    assert_eq!(mmu.backend().live_tables, 2);

    mmu.remove(pm, va(0x0000_4000), va(0x0000_8000));
    mmu.remove(pm, va(0x1000_0000), va(0x1000_4000));

    mmu.reference(pm);
    mmu.destroy(pm); // drops to 1, still alive
    assert_eq!(mmu.context_of(pm), ctx);
    mmu.destroy(pm); // retires

    assert_eq!(mmu.backend().live_tables, 0);
    assert!(mmu.cpu().valid_for_ctx(ctx) == 0);
}

#[test]
fn unwire_is_idempotent_and_soft() {
    let mut mmu = fixture();
    let pm = mmu.create();

    // unwiring an unmapped address is a no-op
    mmu.unwire(pm, va(0x4000));

    mmu.enter(pm, va(0x4000), pa(0x0040_0000), Prot::READ, MapFlags::READ | MapFlags::WIRED)
        .unwrap();
    assert_eq!(mmu.wired_count(pm), 1);
    mmu.unwire(pm, va(0x4000));
    assert_eq!(mmu.wired_count(pm), 0);
    mmu.unwire(pm, va(0x4000));
    assert_eq!(mmu.wired_count(pm), 0);
    mmu.verify_invariants();
}

#[test]
fn procwr_current_runs_through_the_user_context() {
    let mut mmu = fixture();
    let pm = mmu.create();

    // no context yet: procwr allocates one on the way
    mmu.procwr(pm, va(0x0001_0000), 64, true);
    let ctx = mmu.context_of(pm);
    assert_ne!(ctx, 0);
    assert_eq!(mmu.cpu().user_icache_syncs, vec![(ctx, va(0x0001_0000), 64)]);
}

#[test]
fn procwr_other_process_works_by_physical_address() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    mmu.enter(pm, va(0x0000_4000), pa(0x0040_0000), Prot::READ, MapFlags::READ)
        .unwrap();
    mmu.enter(pm, va(0x0000_8000), pa(0x0044_0000), Prot::READ, MapFlags::READ)
        .unwrap();

    // a range crossing the page boundary, starting mid-page
    mmu.procwr(pm, va(0x0000_7F00), 0x200, false);

    assert_eq!(
        mmu.cpu().icache_syncs,
        vec![(pa(0x0040_3F00), 0x100), (pa(0x0044_0000), 0x100)]
    );
}

#[test]
fn growkernel_populates_leaf_tables_by_stride() {
    let mut mmu = fixture();
    let kpm = mmu.kernel_pmap();
    let before = mmu.backend().live_tables;

    let mark = mmu.growkernel(va(VM_MIN_KERNEL_ADDRESS.as_u32() + 3 * PTMAP));
    assert_eq!(mark, va(VM_MIN_KERNEL_ADDRESS.as_u32() + 3 * PTMAP));
    assert_eq!(mmu.backend().live_tables, before + 3);

    // idempotent: the same watermark allocates nothing further
    mmu.growkernel(va(VM_MIN_KERNEL_ADDRESS.as_u32() + 3 * PTMAP));
    assert_eq!(mmu.backend().live_tables, before + 3);

    // kernel VAs under the watermark now resolve without allocation
    mmu.kenter_pa(VM_MIN_KERNEL_ADDRESS, pa(0x0060_0000), Prot::READ, MapFlags::empty());
    assert_eq!(mmu.extract(kpm, VM_MIN_KERNEL_ADDRESS), Some(pa(0x0060_0000)));
    assert_eq!(mmu.backend().live_tables, before + 3);
}

#[test]
fn real_memory_clamps_to_ram() {
    let mmu = fixture();
    // fully inside
    assert_eq!(mmu.real_memory(pa(0x0010_0000), 0x1000), (pa(0x0010_0000), 0x1000));
    // overhangs the end of RAM
    assert_eq!(
        mmu.real_memory(pa(0x01FF_0000), 0x0002_0000),
        (pa(0x01FF_0000), 0x0001_0000)
    );
    // entirely outside
    assert_eq!(mmu.real_memory(pa(0x4000_0000), 0x1000).1, 0);
}

#[test]
fn zero_and_copy_page_reach_the_cache_ops() {
    let mut mmu = fixture();
    mmu.zero_page(pa(0x0040_0000));
    mmu.copy_page(pa(0x0040_0000), pa(0x0044_0000));
    assert_eq!(mmu.cpu().zeroed_pages, vec![pa(0x0040_0000)]);
    assert_eq!(mmu.cpu().copied_pages, vec![(pa(0x0040_0000), pa(0x0044_0000))]);
}

#[test]
fn executable_enters_sync_the_icache() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    mmu.enter(
        pm,
        va(0x4000),
        pa(0x0040_0000),
        Prot::READ | Prot::EXECUTE,
        MapFlags::READ | MapFlags::EXECUTE,
    )
    .unwrap();
    assert_eq!(mmu.cpu().icache_syncs, vec![(pa(0x0040_0000), PAGE_SIZE)]);

    // but not for cache-inhibited mappings
    mmu.enter(
        pm,
        va(0x8000),
        pa(0xF000_0000),
        Prot::READ | Prot::EXECUTE,
        MapFlags::READ | MapFlags::EXECUTE | MapFlags::NOCACHE,
    )
    .unwrap();
    assert_eq!(mmu.cpu().icache_syncs.len(), 1);
}

#[test]
fn tlb_pressure_keeps_the_structures_consistent() {
    let mut mmu = fixture();
    let pm = mmu.create();
    mmu.ctx_alloc(pm);

    // map far more pages than the TLB holds, wired so the preload defers,
    // then fault every one of them in through the miss handler
    for i in 0..(2 * NTLB as u32) {
        let uva = va(0x0100_0000 + i * PAGE_SIZE);
        mmu.enter(
            pm,
            uva,
            pa(0x0040_0000 + i * PAGE_SIZE),
            Prot::READ,
            MapFlags::READ | MapFlags::WIRED,
        )
        .unwrap();
        assert!(mmu.tlb_miss(uva, mmu.context_of(pm)));
    }
    assert_eq!(mmu.resident_count(pm), 2 * NTLB as u32);
    assert_eq!(mmu.wired_count(pm), 2 * NTLB as u32);
    mmu.verify_invariants();

    mmu.remove(pm, va(0x0100_0000), va(0x0100_0000 + 2 * NTLB as u32 * PAGE_SIZE));
    assert_eq!(mmu.resident_count(pm), 0);
    mmu.verify_invariants();
}
