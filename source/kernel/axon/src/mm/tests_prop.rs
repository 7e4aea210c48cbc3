// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the Sv39 paging engine
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Map/translate round trips for arbitrary pages and permissions
//!   - Distinct pages never alias each other
//!   - Grow/shrink are inverses, including exact frame accounting
//!   - Copies survive arbitrary offsets and lengths across pages

use proptest::prelude::*;

use super::address_space::UserSpace;
use super::frame::EmulatedMemory;
use super::page_table::{PageTable, PteFlags};
use super::{OnExisting, MAX_VA, PAGE_SIZE};

const TRAMP_PA: usize = 0x8000_6000;

fn arb_perms() -> impl Strategy<Value = PteFlags> {
    (1u8..8, any::<bool>()).prop_map(|(rwx, user)| {
        let mut perms = PteFlags::empty();
        if rwx & 1 != 0 {
            perms |= PteFlags::READ;
        }
        if rwx & 2 != 0 {
            perms |= PteFlags::WRITE;
        }
        if rwx & 4 != 0 {
            perms |= PteFlags::EXECUTE;
        }
        if user {
            perms |= PteFlags::USER;
        }
        perms
    })
}

proptest! {
    #[test]
    fn map_then_translate_round_trips(
        page in 0usize..(MAX_VA / PAGE_SIZE),
        ppn in 1usize..(1 << 30),
        perms in arb_perms(),
    ) {
        let mut mem = EmulatedMemory::new();
        let mut table = PageTable::allocate(&mut mem).unwrap();
        let va = page * PAGE_SIZE;
        let pa = ppn * PAGE_SIZE;

        table.map_region(&mut mem, va, PAGE_SIZE, pa, perms, OnExisting::Reject).unwrap();
        prop_assert_eq!(table.translate(&mem, va).unwrap(), Some((pa, perms)));

        let user = table.translate_user(&mem, va).unwrap();
        if perms.contains(PteFlags::USER) {
            prop_assert_eq!(user, Some((pa, perms)));
        } else {
            prop_assert_eq!(user, None);
        }
    }

    #[test]
    fn distinct_pages_never_alias(
        page_a in 0usize..(MAX_VA / PAGE_SIZE),
        page_b in 0usize..(MAX_VA / PAGE_SIZE),
        perms in arb_perms(),
    ) {
        prop_assume!(page_a != page_b);
        let mut mem = EmulatedMemory::new();
        let mut table = PageTable::allocate(&mut mem).unwrap();
        let (va_a, va_b) = (page_a * PAGE_SIZE, page_b * PAGE_SIZE);
        let (pa_a, pa_b) = (0x10_0000usize, 0x20_0000usize);

        table.map_region(&mut mem, va_a, PAGE_SIZE, pa_a, perms, OnExisting::Reject).unwrap();
        table.map_region(&mut mem, va_b, PAGE_SIZE, pa_b, perms, OnExisting::Reject).unwrap();

        prop_assert_eq!(table.translate(&mem, va_a).unwrap(), Some((pa_a, perms)));
        prop_assert_eq!(table.translate(&mem, va_b).unwrap(), Some((pa_b, perms)));
    }

    #[test]
    fn grow_and_shrink_are_inverses(
        first in 1usize..(8 * PAGE_SIZE),
        second in 1usize..(8 * PAGE_SIZE),
    ) {
        prop_assume!(second > first);
        let mut mem = EmulatedMemory::new();
        let mut space = UserSpace::new(&mut mem, TRAMP_PA).unwrap();

        space.grow(&mut mem, first).unwrap();
        let live = mem.live_frames();

        space.grow(&mut mem, second).unwrap();
        prop_assert_eq!(space.size(), second);
        space.shrink(&mut mem, first).unwrap();

        prop_assert_eq!(space.size(), first);
        prop_assert_eq!(mem.live_frames(), live);
    }

    #[test]
    fn copies_round_trip_at_any_offset(
        offset in 0usize..(2 * PAGE_SIZE),
        data in proptest::collection::vec(any::<u8>(), 1..1024),
    ) {
        let mut mem = EmulatedMemory::new();
        let mut space = UserSpace::new(&mut mem, TRAMP_PA).unwrap();
        space.grow(&mut mem, 3 * PAGE_SIZE).unwrap();

        space.copy_out(&mut mem, offset, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        space.copy_in(&mem, &mut back, offset).unwrap();
        prop_assert_eq!(back, data);
    }
}
