// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel, shadow, and per-process address spaces.

use super::copy;
use super::frame::PhysMemory;
use super::page_table::{PageTable, PteFlags, PteKind};
use super::{
    page_round_down, page_round_up, Inconsistency, OnExisting, VmError, VmResult, PAGE_SIZE,
    TRAMPOLINE,
};

/// Permissions of user data pages installed by the lifecycle operations.
const USER_DATA: PteFlags = PteFlags::READ
    .union(PteFlags::WRITE)
    .union(PteFlags::EXECUTE)
    .union(PteFlags::USER);

/// Permissions of the shared trampoline page. Never user-accessible.
const TRAMP_PERMS: PteFlags = PteFlags::READ.union(PteFlags::EXECUTE);

/// One memory-mapped device range, mapped R+W into kernel-style spaces.
#[derive(Clone, Copy, Debug)]
pub struct DeviceRegion {
    pub base: usize,
    pub size: usize,
}

/// Fixed platform description consumed by the builders. All addresses
/// except device sizes are page-aligned.
#[derive(Clone, Copy, Debug)]
pub struct MemoryLayout {
    pub devices: &'static [DeviceRegion],
    /// First byte of kernel text; also where the direct map begins.
    pub kernel_base: usize,
    /// End of kernel text, start of kernel data.
    pub kernel_text_end: usize,
    /// Top of usable physical memory.
    pub phys_top: usize,
    /// Physical address of the shared trampoline page.
    pub trampoline: usize,
}

/// Number of whole pages covered by `[base, base + size)` after the
/// region mapper's rounding.
fn region_pages(base: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    (page_round_down(base + size - 1) - page_round_down(base)) / PAGE_SIZE + 1
}

/// A direct-mapped kernel-style address space.
///
/// Built once at boot for the kernel itself, and once per process as that
/// process's private shadow table. Boot code treats a build failure as
/// fatal; the constructor only reports it.
pub struct KernelSpace {
    pub(crate) table: PageTable,
}

impl KernelSpace {
    /// Builds the fixed mapping sequence: device registers, kernel text,
    /// kernel data plus all remaining physical memory, and the trampoline
    /// page at the top of the address range.
    pub fn build<M: PhysMemory>(mem: &mut M, layout: &MemoryLayout) -> VmResult<Self> {
        for addr in [
            layout.kernel_base,
            layout.kernel_text_end,
            layout.phys_top,
            layout.trampoline,
        ] {
            if addr % PAGE_SIZE != 0 {
                return Err(Inconsistency::Unaligned.into());
            }
        }

        let mut table = PageTable::allocate(mem)?;
        let rw = PteFlags::READ | PteFlags::WRITE;
        let rx = PteFlags::READ | PteFlags::EXECUTE;
        for dev in layout.devices {
            table.map_region(mem, dev.base, dev.size, dev.base, rw, OnExisting::Reject)?;
        }
        table.map_region(
            mem,
            layout.kernel_base,
            layout.kernel_text_end - layout.kernel_base,
            layout.kernel_base,
            rx,
            OnExisting::Reject,
        )?;
        table.map_region(
            mem,
            layout.kernel_text_end,
            layout.phys_top - layout.kernel_text_end,
            layout.kernel_text_end,
            rw,
            OnExisting::Reject,
        )?;
        table.map_region(mem, TRAMPOLINE, PAGE_SIZE, layout.trampoline, rx, OnExisting::Reject)?;
        log_info!(
            target: "mm",
            "kernel space mapped: {} device regions, ram {:#x}..{:#x}",
            layout.devices.len(),
            layout.kernel_base,
            layout.phys_top
        );
        Ok(Self { table })
    }

    /// Borrows the page table for lookups and diagnostics.
    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Returns the SATP value describing this space.
    pub fn satp_value(&self) -> usize {
        self.table.satp_value()
    }

    /// Installs this space as the active translation root on the calling
    /// hart and invalidates cached translations.
    pub fn activate(&self) {
        crate::arch::riscv::activate_translation(self.satp_value());
    }

    /// Translates a byte-granular kernel virtual address. The address
    /// must be mapped; this path is only used for addresses the builder
    /// installed.
    pub fn phys_addr<M: PhysMemory>(&self, mem: &M, va: usize) -> VmResult<usize> {
        let (pa, _) = self
            .table
            .translate(mem, page_round_down(va))?
            .ok_or(VmError::Inconsistent(Inconsistency::NotMapped))?;
        Ok(pa + va % PAGE_SIZE)
    }

    /// Removes a previously mirrored user range. The mirrored frames stay
    /// alive; they belong to the user space that installed them.
    pub fn clear_mirror<M: PhysMemory>(
        &mut self,
        mem: &mut M,
        begin: usize,
        end: usize,
    ) -> VmResult<()> {
        let begin = page_round_down(begin);
        if begin >= end {
            return Ok(());
        }
        let pages = (page_round_up(end) - begin) / PAGE_SIZE;
        self.table.unmap_region(mem, begin, pages, false)
    }

    /// Tears down a per-process shadow space: unmaps exactly what `build`
    /// installed (never releasing the shared frames), then reclaims the
    /// table structure. Any mirrored range must have been cleared first.
    pub fn destroy<M: PhysMemory>(self, mem: &mut M, layout: &MemoryLayout) -> VmResult<()> {
        let mut table = self.table;
        for dev in layout.devices {
            table.unmap_region(
                mem,
                page_round_down(dev.base),
                region_pages(dev.base, dev.size),
                false,
            )?;
        }
        table.unmap_region(
            mem,
            layout.kernel_base,
            region_pages(layout.kernel_base, layout.kernel_text_end - layout.kernel_base),
            false,
        )?;
        table.unmap_region(
            mem,
            layout.kernel_text_end,
            region_pages(layout.kernel_text_end, layout.phys_top - layout.kernel_text_end),
            false,
        )?;
        table.unmap_region(mem, TRAMPOLINE, 1, false)?;
        table.destroy(mem)
    }
}

/// One process's address space: user pages covering `[0, size)` plus the
/// shared trampoline page at the top slot.
pub struct UserSpace {
    pub(crate) table: PageTable,
    size: usize,
    trampoline: usize,
}

impl UserSpace {
    /// Creates an empty space: no user pages, trampoline installed.
    pub fn new<M: PhysMemory>(mem: &mut M, trampoline: usize) -> VmResult<Self> {
        let mut table = PageTable::allocate(mem)?;
        if let Err(err) = table.map_region(
            mem,
            TRAMPOLINE,
            PAGE_SIZE,
            trampoline,
            TRAMP_PERMS,
            OnExisting::Reject,
        ) {
            table.destroy(mem)?;
            return Err(err);
        }
        Ok(Self { table, size: 0, trampoline })
    }

    /// Current extent of the user range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Borrows the page table for lookups and diagnostics.
    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Returns the SATP value describing this space.
    pub fn satp_value(&self) -> usize {
        self.table.satp_value()
    }

    /// Installs this space as the active translation root on the calling
    /// hart and invalidates cached translations.
    pub fn activate(&self) {
        crate::arch::riscv::activate_translation(self.satp_value());
    }

    /// Installs the very first program image at virtual address 0. The
    /// image must be smaller than one page.
    pub fn load_initial<M: PhysMemory>(&mut self, mem: &mut M, image: &[u8]) -> VmResult<()> {
        if image.len() >= PAGE_SIZE {
            return Err(Inconsistency::OversizedImage.into());
        }
        let frame = mem.allocate().ok_or(VmError::OutOfFrames)?;
        let page = mem.page_mut(frame);
        page.zero();
        page.0[..image.len()].copy_from_slice(image);
        if let Err(err) =
            self.table
                .map_region(mem, 0, PAGE_SIZE, frame.base(), USER_DATA, OnExisting::Reject)
        {
            mem.release(frame);
            return Err(err);
        }
        self.size = PAGE_SIZE;
        Ok(())
    }

    /// Grows the user range to `new_size` bytes, mapping zeroed pages
    /// with full user permissions. All-or-nothing: on failure every page
    /// this call mapped is released again and the size is unchanged.
    pub fn grow<M: PhysMemory>(&mut self, mem: &mut M, new_size: usize) -> VmResult<usize> {
        if new_size <= self.size {
            return Ok(self.size);
        }
        let start = page_round_up(self.size);
        let mut va = start;
        while va < new_size {
            let frame = match mem.allocate() {
                Some(frame) => frame,
                None => return self.abort_grow(mem, start, va, VmError::OutOfFrames),
            };
            mem.page_mut(frame).zero();
            if let Err(err) = self.table.map_region(
                mem,
                va,
                PAGE_SIZE,
                frame.base(),
                USER_DATA,
                OnExisting::Reject,
            ) {
                mem.release(frame);
                return self.abort_grow(mem, start, va, err);
            }
            va += PAGE_SIZE;
        }
        self.size = new_size;
        Ok(new_size)
    }

    fn abort_grow<M: PhysMemory>(
        &mut self,
        mem: &mut M,
        start: usize,
        mapped_end: usize,
        err: VmError,
    ) -> VmResult<usize> {
        log_debug!(
            target: "mm",
            "grow rolled back, {} pages returned",
            (mapped_end - start) / PAGE_SIZE
        );
        self.table
            .unmap_region(mem, start, (mapped_end - start) / PAGE_SIZE, true)?;
        Err(err)
    }

    /// Shrinks the user range to `new_size` bytes, unmapping and
    /// releasing whole pages above it. Cannot fail for lack of memory.
    pub fn shrink<M: PhysMemory>(&mut self, mem: &mut M, new_size: usize) -> VmResult<usize> {
        if new_size >= self.size {
            return Ok(self.size);
        }
        let new_top = page_round_up(new_size);
        let old_top = page_round_up(self.size);
        if new_top < old_top {
            self.table
                .unmap_region(mem, new_top, (old_top - new_top) / PAGE_SIZE, true)?;
        }
        self.size = new_size;
        Ok(new_size)
    }

    /// Clones the whole space for fork: fresh frames, byte-for-byte
    /// contents, identical permissions. Every page below `size` must be
    /// mapped in the source. On failure the partial clone is fully
    /// released and the source is untouched.
    pub fn duplicate<M: PhysMemory>(&self, mem: &mut M) -> VmResult<UserSpace> {
        let mut clone = UserSpace::new(mem, self.trampoline)?;
        let mut va = 0;
        while va < self.size {
            let (src, perms) = match self.leaf_at(mem, va) {
                Ok(found) => found,
                Err(err) => return Self::abort_duplicate(clone, mem, va, err),
            };
            let dst = match mem.allocate() {
                Some(frame) => frame,
                None => return Self::abort_duplicate(clone, mem, va, VmError::OutOfFrames),
            };
            mem.copy_page(dst, src);
            if let Err(err) = clone.table.map_region(
                mem,
                va,
                PAGE_SIZE,
                dst.base(),
                perms,
                OnExisting::Reject,
            ) {
                mem.release(dst);
                return Self::abort_duplicate(clone, mem, va, err);
            }
            va += PAGE_SIZE;
        }
        clone.size = self.size;
        Ok(clone)
    }

    fn leaf_at<M: PhysMemory>(
        &self,
        mem: &M,
        va: usize,
    ) -> VmResult<(super::frame::Frame, PteFlags)> {
        let slot = self
            .table
            .walk(mem, va)?
            .ok_or(VmError::Inconsistent(Inconsistency::NotMapped))?;
        match slot.load(mem).kind()? {
            PteKind::Leaf(frame, perms) => Ok((frame, perms)),
            PteKind::Absent => Err(Inconsistency::NotMapped.into()),
            PteKind::Table(_) => Err(Inconsistency::NotALeaf.into()),
        }
    }

    fn abort_duplicate<M: PhysMemory>(
        mut clone: UserSpace,
        mem: &mut M,
        copied_end: usize,
        err: VmError,
    ) -> VmResult<UserSpace> {
        log_debug!(
            target: "mm",
            "duplicate rolled back after {} pages",
            copied_end / PAGE_SIZE
        );
        if copied_end > 0 {
            clone
                .table
                .unmap_region(mem, 0, copied_end / PAGE_SIZE, true)?;
        }
        clone.size = 0;
        clone.destroy(mem)?;
        Err(err)
    }

    /// Releases every user page and reclaims the table structure. The
    /// shared trampoline page is unmapped but never released.
    pub fn destroy<M: PhysMemory>(self, mem: &mut M) -> VmResult<()> {
        let mut table = self.table;
        table.unmap_region(mem, TRAMPOLINE, 1, false)?;
        if self.size > 0 {
            table.unmap_region(mem, 0, page_round_up(self.size) / PAGE_SIZE, true)?;
        }
        table.destroy(mem)
    }

    /// Revokes user-mode access to the page at `va`, which must be
    /// mapped. Used for the guard page below the user stack.
    pub fn clear_user_access<M: PhysMemory>(&mut self, mem: &mut M, va: usize) -> VmResult<()> {
        self.table.clear_user(mem, va)
    }

    /// Copies `src` into this space at `dst_va`.
    pub fn copy_out<M: PhysMemory>(
        &self,
        mem: &mut M,
        dst_va: usize,
        src: &[u8],
    ) -> VmResult<()> {
        copy::copy_out(mem, &self.table, dst_va, src)
    }

    /// Fills `dst` from this space starting at `src_va`.
    pub fn copy_in<M: PhysMemory>(&self, mem: &M, dst: &mut [u8], src_va: usize) -> VmResult<()> {
        copy::copy_in(mem, &self.table, dst, src_va)
    }

    /// Copies a NUL-terminated string from this space; see
    /// [`copy::copy_in_str`] for the truncation policy.
    pub fn copy_in_str<M: PhysMemory>(
        &self,
        mem: &M,
        dst: &mut [u8],
        src_va: usize,
    ) -> VmResult<usize> {
        copy::copy_in_str(mem, &self.table, dst, src_va)
    }

    /// Mirrors `[begin, end)` of this space into a shadow kernel table so
    /// that kernel code can reach those bytes without walking this table.
    /// Must be re-run after every mutation of the mirrored range.
    pub fn mirror_into<M: PhysMemory>(
        &self,
        mem: &mut M,
        shadow: &mut KernelSpace,
        begin: usize,
        end: usize,
    ) -> VmResult<()> {
        copy::mirror_range(mem, &self.table, &mut shadow.table, begin, end)
    }
}
