// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table walker, region mapper, and table reclamation.

use core::fmt;

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert};

use super::frame::{Frame, PageData, PhysMemory};
use super::{
    page_round_down, Inconsistency, OnExisting, VmError, VmResult, MAX_VA, PAGE_SIZE, PT_ENTRIES,
    PT_LEVELS,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PteFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

const LEAF_PERMS: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXECUTE);

/// Bits of a PTE word that hold flags.
const FLAG_BITS: usize = 10;
const FLAG_MASK: usize = (1 << FLAG_BITS) - 1;
/// Width of the physical page number field.
const PPN_BITS: usize = 44;
const PPN_MASK: usize = (1 << PPN_BITS) - 1;

const SATP_MODE_SV39: usize = 8;

/// One Sv39 page-table entry word: `ppn << 10 | flags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

/// Decoded view of a [`Pte`]. Exactly three shapes are legal; everything
/// else decodes to [`Inconsistency::Malformed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PteKind {
    /// All bits zero: no mapping.
    Absent,
    /// Valid entry whose flags are exactly VALID: owns the next-level
    /// table stored in the frame.
    Table(Frame),
    /// Valid entry with at least one of R/W/X: terminates translation at
    /// a data page. Permissions exclude VALID.
    Leaf(Frame, PteFlags),
}

impl Pte {
    pub const ABSENT: Self = Self(0);

    /// Reconstructs an entry from a raw word.
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// Returns the raw word.
    pub const fn bits(self) -> usize {
        self.0
    }

    fn table(frame: Frame) -> Self {
        Self(frame.number() << FLAG_BITS | PteFlags::VALID.bits())
    }

    fn leaf(frame: Frame, perms: PteFlags) -> Self {
        Self(frame.number() << FLAG_BITS | perms.union(PteFlags::VALID).bits())
    }

    /// Decodes the entry into its tagged form.
    pub fn kind(self) -> VmResult<PteKind> {
        if self.0 == 0 {
            return Ok(PteKind::Absent);
        }
        // Reserved high bits must be clear in every entry this engine writes.
        if self.0 >> (FLAG_BITS + PPN_BITS) != 0 {
            return Err(Inconsistency::Malformed.into());
        }
        let flags = PteFlags::from_bits(self.0 & FLAG_MASK)
            .ok_or(VmError::Inconsistent(Inconsistency::Malformed))?;
        if !flags.contains(PteFlags::VALID) {
            return Err(Inconsistency::Malformed.into());
        }
        let frame = Frame::from_number((self.0 >> FLAG_BITS) & PPN_MASK);
        let perms = flags.difference(PteFlags::VALID);
        if perms.intersects(LEAF_PERMS) {
            Ok(PteKind::Leaf(frame, perms))
        } else if flags == PteFlags::VALID {
            Ok(PteKind::Table(frame))
        } else {
            Err(Inconsistency::Malformed.into())
        }
    }
}

assert_eq_size!(PageData, [Pte; PT_ENTRIES]);
const_assert!(core::mem::align_of::<PageData>() >= core::mem::align_of::<Pte>());

fn entries(page: &PageData) -> &[Pte; PT_ENTRIES] {
    // SAFETY: asserted above that PageData has the size of [Pte; 512] and
    // at least its alignment; every bit pattern is a valid Pte.
    unsafe { &*(page as *const PageData as *const [Pte; PT_ENTRIES]) }
}

fn entries_mut(page: &mut PageData) -> &mut [Pte; PT_ENTRIES] {
    // SAFETY: as in `entries`.
    unsafe { &mut *(page as *mut PageData as *mut [Pte; PT_ENTRIES]) }
}

/// Location of one table entry: a table frame plus an index into it.
/// The walkers hand out level-0 slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    table: Frame,
    index: usize,
}

impl Slot {
    /// Reads the entry.
    pub fn load<M: PhysMemory>(self, mem: &M) -> Pte {
        entries(mem.page(self.table))[self.index]
    }

    pub(crate) fn store<M: PhysMemory>(self, mem: &mut M, pte: Pte) {
        entries_mut(mem.page_mut(self.table))[self.index] = pte;
    }
}

/// Extracts the 9-bit table index for `level` from a virtual address.
fn vpn_index(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * level)) & (PT_ENTRIES - 1)
}

/// Root of one Sv39 translation tree.
///
/// A value type: every operation threads the physical-memory collaborator
/// explicitly, and the tree is reclaimed only through [`PageTable::destroy`].
/// Callers serialize mutation of a given table; the engine takes no locks.
pub struct PageTable {
    root: Frame,
}

impl PageTable {
    /// Allocates an empty table with a zeroed root page.
    pub fn allocate<M: PhysMemory>(mem: &mut M) -> VmResult<Self> {
        let root = mem.allocate().ok_or(VmError::OutOfFrames)?;
        mem.page_mut(root).zero();
        Ok(Self { root })
    }

    /// Returns the root table frame.
    pub fn root(&self) -> Frame {
        self.root
    }

    /// Returns the SATP value describing this table (ASID 0).
    pub fn satp_value(&self) -> usize {
        SATP_MODE_SV39 << 60 | self.root.number()
    }

    /// Descends to the level-0 slot for `va` without allocating.
    ///
    /// `Ok(None)` means an intermediate table is absent, which is an
    /// ordinary lookup miss. Addresses at or above [`MAX_VA`] are a
    /// kernel bug and surface as an inconsistency before any indexing.
    pub fn walk<M: PhysMemory>(&self, mem: &M, va: usize) -> VmResult<Option<Slot>> {
        if va >= MAX_VA {
            return Err(Inconsistency::AddressOutOfRange.into());
        }
        let mut table = self.root;
        for level in (1..PT_LEVELS).rev() {
            let slot = Slot { table, index: vpn_index(va, level) };
            match slot.load(mem).kind()? {
                PteKind::Absent => return Ok(None),
                PteKind::Table(next) => table = next,
                PteKind::Leaf(..) => return Err(Inconsistency::NotATable.into()),
            }
        }
        Ok(Some(Slot { table, index: vpn_index(va, 0) }))
    }

    /// Descends to the level-0 slot for `va`, allocating intermediate
    /// tables on demand.
    pub fn walk_create<M: PhysMemory>(&mut self, mem: &mut M, va: usize) -> VmResult<Slot> {
        if va >= MAX_VA {
            return Err(Inconsistency::AddressOutOfRange.into());
        }
        let mut table = self.root;
        for level in (1..PT_LEVELS).rev() {
            let slot = Slot { table, index: vpn_index(va, level) };
            match slot.load(mem).kind()? {
                PteKind::Table(next) => table = next,
                PteKind::Leaf(..) => return Err(Inconsistency::NotATable.into()),
                PteKind::Absent => {
                    let next = mem.allocate().ok_or(VmError::OutOfFrames)?;
                    // The child must be fully zeroed before the parent
                    // entry makes it reachable.
                    mem.page_mut(next).zero();
                    slot.store(mem, Pte::table(next));
                    table = next;
                }
            }
        }
        Ok(Slot { table, index: vpn_index(va, 0) })
    }

    /// Privileged page lookup: physical base and permissions of the leaf
    /// covering `va`, or `Ok(None)` when nothing is mapped there.
    pub fn translate<M: PhysMemory>(
        &self,
        mem: &M,
        va: usize,
    ) -> VmResult<Option<(usize, PteFlags)>> {
        if va >= MAX_VA {
            return Ok(None);
        }
        let Some(slot) = self.walk(mem, page_round_down(va))? else {
            return Ok(None);
        };
        match slot.load(mem).kind()? {
            PteKind::Leaf(frame, perms) => Ok(Some((frame.base(), perms))),
            _ => Ok(None),
        }
    }

    /// Like [`Self::translate`], but only returns pages a user-mode
    /// access would reach.
    pub fn translate_user<M: PhysMemory>(
        &self,
        mem: &M,
        va: usize,
    ) -> VmResult<Option<(usize, PteFlags)>> {
        match self.translate(mem, va)? {
            Some((pa, perms)) if perms.contains(PteFlags::USER) => Ok(Some((pa, perms))),
            _ => Ok(None),
        }
    }

    /// Maps `[va, va + size)`, rounded outward to whole pages, onto the
    /// physical range starting at page-aligned `pa`.
    ///
    /// `perms` must carry at least one of R/W/X. No rollback happens on a
    /// mid-range allocation failure; the caller owns cleanup.
    pub fn map_region<M: PhysMemory>(
        &mut self,
        mem: &mut M,
        va: usize,
        size: usize,
        pa: usize,
        perms: PteFlags,
        on_existing: OnExisting,
    ) -> VmResult<()> {
        if size == 0 {
            return Ok(());
        }
        if pa % PAGE_SIZE != 0 {
            return Err(Inconsistency::Unaligned.into());
        }
        if !perms.intersects(LEAF_PERMS) {
            return Err(Inconsistency::InvalidPermissions.into());
        }
        let first = page_round_down(va);
        let last = page_round_down(
            va.checked_add(size - 1)
                .ok_or(VmError::Inconsistent(Inconsistency::AddressOutOfRange))?,
        );
        let mut cur = first;
        let mut pa = pa;
        loop {
            let slot = self.walk_create(mem, cur)?;
            match slot.load(mem).kind()? {
                PteKind::Absent => {}
                PteKind::Table(_) => return Err(Inconsistency::Malformed.into()),
                PteKind::Leaf(..) => {
                    if on_existing == OnExisting::Reject {
                        log_error!(target: "mm", "remap of va {:#x}", cur);
                        return Err(Inconsistency::Remap.into());
                    }
                }
            }
            slot.store(mem, Pte::leaf(Frame::from_base(pa), perms));
            if cur == last {
                break;
            }
            cur += PAGE_SIZE;
            pa += PAGE_SIZE;
        }
        Ok(())
    }

    /// Removes `pages` mappings starting at page-aligned `va`; every slot
    /// must hold a valid leaf. With `release` set, each backing frame is
    /// returned to the allocator before its slot is cleared.
    pub fn unmap_region<M: PhysMemory>(
        &mut self,
        mem: &mut M,
        va: usize,
        pages: usize,
        release: bool,
    ) -> VmResult<()> {
        if va % PAGE_SIZE != 0 {
            return Err(Inconsistency::Unaligned.into());
        }
        for index in 0..pages {
            let cur = va + index * PAGE_SIZE;
            let slot = self
                .walk(mem, cur)?
                .ok_or(VmError::Inconsistent(Inconsistency::NotMapped))?;
            match slot.load(mem).kind()? {
                PteKind::Absent => {
                    log_error!(target: "mm", "unmap of absent va {:#x}", cur);
                    return Err(Inconsistency::NotMapped.into());
                }
                PteKind::Table(_) => return Err(Inconsistency::NotALeaf.into()),
                PteKind::Leaf(frame, _) => {
                    if release {
                        mem.release(frame);
                    }
                    slot.store(mem, Pte::ABSENT);
                }
            }
        }
        Ok(())
    }

    /// Strips the USER flag from an existing leaf; the entry must be a
    /// valid leaf already. Used to turn a page into a guard page.
    pub fn clear_user<M: PhysMemory>(&mut self, mem: &mut M, va: usize) -> VmResult<()> {
        let slot = self
            .walk(mem, va)?
            .ok_or(VmError::Inconsistent(Inconsistency::NotMapped))?;
        match slot.load(mem).kind()? {
            PteKind::Absent => Err(Inconsistency::NotMapped.into()),
            PteKind::Table(_) => Err(Inconsistency::NotALeaf.into()),
            PteKind::Leaf(frame, perms) => {
                slot.store(mem, Pte::leaf(frame, perms.difference(PteFlags::USER)));
                Ok(())
            }
        }
    }

    /// Reclaims the whole translation tree. Every leaf must have been
    /// unmapped first; a live leaf aborts reclamation.
    pub fn destroy<M: PhysMemory>(self, mem: &mut M) -> VmResult<()> {
        Self::release_tree(mem, self.root, PT_LEVELS - 1)
    }

    fn release_tree<M: PhysMemory>(mem: &mut M, table: Frame, level: usize) -> VmResult<()> {
        for index in 0..PT_ENTRIES {
            let slot = Slot { table, index };
            match slot.load(mem).kind()? {
                PteKind::Absent => {}
                PteKind::Table(child) if level > 0 => {
                    Self::release_tree(mem, child, level - 1)?;
                    slot.store(mem, Pte::ABSENT);
                }
                // A table-shaped entry below the last level cannot own
                // anything; the tree is corrupt.
                PteKind::Table(_) => return Err(Inconsistency::Malformed.into()),
                PteKind::Leaf(..) => return Err(Inconsistency::LiveLeaf.into()),
            }
        }
        mem.release(table);
        Ok(())
    }

    /// Writes every valid entry at every level, indented by depth.
    /// Read-only; safe whenever the table exists.
    pub fn dump<M: PhysMemory>(&self, mem: &M, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "page table {:#x}", self.root.base())?;
        Self::dump_table(mem, self.root, 1, out)
    }

    fn dump_table<M: PhysMemory>(
        mem: &M,
        table: Frame,
        depth: usize,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        for index in 0..PT_ENTRIES {
            let pte = entries(mem.page(table))[index];
            if pte.bits() == 0 {
                continue;
            }
            for step in 0..depth {
                if step > 0 {
                    out.write_str(" ")?;
                }
                out.write_str("..")?;
            }
            match pte.kind() {
                Ok(PteKind::Table(child)) => {
                    writeln!(out, "{}: pte {:#x} pa {:#x}", index, pte.bits(), child.base())?;
                    Self::dump_table(mem, child, depth + 1, out)?;
                }
                Ok(PteKind::Leaf(frame, _)) => {
                    writeln!(out, "{}: pte {:#x} pa {:#x}", index, pte.bits(), frame.base())?;
                }
                Ok(PteKind::Absent) | Err(_) => {
                    writeln!(out, "{}: pte {:#x} (malformed)", index, pte.bits())?;
                }
            }
        }
        Ok(())
    }
}
