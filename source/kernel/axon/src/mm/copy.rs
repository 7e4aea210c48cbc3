// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Byte movement across the kernel/user boundary.
//!
//! Every transfer translates the user side page by page through the
//! walker (lookup only, no allocation) and splits at page boundaries. A
//! missing user mapping is an ordinary failure reported to the caller,
//! not a kernel bug: these entry points run on addresses picked by user
//! code.

use super::frame::{Frame, PhysMemory};
use super::page_table::{PageTable, PteFlags, PteKind};
use super::{page_round_down, Inconsistency, OnExisting, VmError, VmResult, PAGE_SIZE};

/// Copies `src` into `table`'s user memory at `dst_va`.
pub fn copy_out<M: PhysMemory>(
    mem: &mut M,
    table: &PageTable,
    mut dst_va: usize,
    mut src: &[u8],
) -> VmResult<()> {
    while !src.is_empty() {
        let page_va = page_round_down(dst_va);
        let Some((pa, _)) = table.translate_user(mem, page_va)? else {
            return Err(VmError::BadAddress);
        };
        let offset = dst_va - page_va;
        let count = usize::min(PAGE_SIZE - offset, src.len());
        mem.page_mut(Frame::from_base(pa)).0[offset..offset + count]
            .copy_from_slice(&src[..count]);
        src = &src[count..];
        dst_va = page_va + PAGE_SIZE;
    }
    Ok(())
}

/// Fills `dst` from `table`'s user memory starting at `src_va`.
pub fn copy_in<M: PhysMemory>(
    mem: &M,
    table: &PageTable,
    dst: &mut [u8],
    mut src_va: usize,
) -> VmResult<()> {
    let mut filled = 0;
    while filled < dst.len() {
        let page_va = page_round_down(src_va);
        let Some((pa, _)) = table.translate_user(mem, page_va)? else {
            return Err(VmError::BadAddress);
        };
        let offset = src_va - page_va;
        let count = usize::min(PAGE_SIZE - offset, dst.len() - filled);
        dst[filled..filled + count]
            .copy_from_slice(&mem.page(Frame::from_base(pa)).0[offset..offset + count]);
        filled += count;
        src_va = page_va + PAGE_SIZE;
    }
    Ok(())
}

/// Copies a NUL-terminated string from `table`'s user memory.
///
/// Stops at the first NUL or once `dst` is full, whichever comes first.
/// When a NUL is found, `dst` receives the bytes plus the terminator and
/// the string length is returned. When `dst` fills up first, exactly
/// `dst.len()` bytes are copied and the result is unterminated.
pub fn copy_in_str<M: PhysMemory>(
    mem: &M,
    table: &PageTable,
    dst: &mut [u8],
    mut src_va: usize,
) -> VmResult<usize> {
    let mut filled = 0;
    while filled < dst.len() {
        let page_va = page_round_down(src_va);
        let Some((pa, _)) = table.translate_user(mem, page_va)? else {
            return Err(VmError::BadAddress);
        };
        let offset = src_va - page_va;
        let count = usize::min(PAGE_SIZE - offset, dst.len() - filled);
        let chunk = &mem.page(Frame::from_base(pa)).0[offset..offset + count];
        if let Some(nul) = chunk.iter().position(|&byte| byte == 0) {
            dst[filled..filled + nul].copy_from_slice(&chunk[..nul]);
            dst[filled + nul] = 0;
            return Ok(filled + nul);
        }
        dst[filled..filled + count].copy_from_slice(chunk);
        filled += count;
        src_va = page_va + PAGE_SIZE;
    }
    Ok(filled)
}

/// Mirrors the user pages covering `[begin, end)` from `user` into
/// `shadow`, stripping the USER flag from each installed entry.
///
/// Every covered page must be a valid leaf in `user`; the range is
/// committed memory by contract, so a hole is a kernel bug. Installation
/// overwrites any earlier mirror of the same pages. On allocation failure
/// the pages installed by this call are unmapped again (never released —
/// the frames belong to `user`) and the failure is reported.
pub fn mirror_range<M: PhysMemory>(
    mem: &mut M,
    user: &PageTable,
    shadow: &mut PageTable,
    begin: usize,
    end: usize,
) -> VmResult<()> {
    let begin = page_round_down(begin);
    let mut va = begin;
    while va < end {
        let slot = user
            .walk(mem, va)?
            .ok_or(VmError::Inconsistent(Inconsistency::NotMapped))?;
        let (frame, perms) = match slot.load(mem).kind()? {
            PteKind::Leaf(frame, perms) => (frame, perms),
            PteKind::Absent => return Err(Inconsistency::NotMapped.into()),
            PteKind::Table(_) => return Err(Inconsistency::NotALeaf.into()),
        };
        let perms = perms.difference(PteFlags::USER);
        if let Err(err) = shadow.map_region(
            mem,
            va,
            PAGE_SIZE,
            frame.base(),
            perms,
            OnExisting::Overwrite,
        ) {
            if va > begin {
                shadow.unmap_region(mem, begin, (va - begin) / PAGE_SIZE, false)?;
            }
            return Err(err);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}
