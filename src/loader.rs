//! 可执行映像装载器。
//!
//! 外部的 ELF 解析器（`xmas-elf`）负责读出程序头，本模块只消费
//! 过滤后的可装载段描述符，把段内容放进地址空间。一个段按地址
//! 依次拆成三部分处理：起始的非对齐残段、完全落在文件范围内的
//! 整单元、以及跨入零填充（bss）区域的尾部。
//!
//! 基本页粒度下，整单元部分直接把映像的后备物理页映射进来，
//! 一个字节都不拷贝；大页粒度下映像在物理内存中不保证按大页
//! 对齐，只能拷贝进新分配的大帧。

use crate::mm::{AddressSpace, FrameKind, MapError, PTEFlags, VirtAddr};
use bitflags::*;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

bitflags! {
    /// 段的访问权限位，取值与 ELF 程序头的 p_flags 一致
    pub struct SegFlags: u8 {
        const X = 1 << 0; // 可执行
        const W = 1 << 1; // 可写
        const R = 1 << 2; // 可读
    }
}

/// 一个待装载的段：来源字节、目标虚拟区间和权限
pub struct LoadSegment<'a> {
    /// 目标虚拟起始地址，不要求对齐
    pub vaddr: usize,
    /// 文件内容（长度即 file size）
    pub data: &'a [u8],
    /// 段在内存中的总长度，超出 `data` 的部分零填充
    pub mem_size: usize,
    /// 访问权限
    pub flags: SegFlags,
}

/// 装载失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// 映像不是合法的 ELF，或程序头越界
    BadImage,
    /// 段的源地址与目标地址在粒度内的偏移不一致
    Misaligned,
    /// 帧耗尽
    Exhausted,
    /// 目标地址上已有别的映射
    Conflict,
}

/// 段权限到页表项标志的转换。运行时不做写时复制，
/// 可写段直接把脏位一并置上；应用映像附加 U 位。
fn pte_flags_of(seg: SegFlags, user: bool) -> PTEFlags {
    let mut flags = PTEFlags::empty();
    if seg.contains(SegFlags::X) {
        flags |= PTEFlags::X;
    }
    if seg.contains(SegFlags::W) {
        flags |= PTEFlags::W | PTEFlags::R | PTEFlags::D;
    }
    if seg.contains(SegFlags::R) {
        flags |= PTEFlags::R;
    }
    if user {
        flags |= PTEFlags::U;
    }
    flags
}

/// 把一组段按 `kind` 粒度装入地址空间。
/// 任何一次分配失败都让整个调用失败，已装载的段不回收。
pub fn load(
    space: &mut AddressSpace,
    segments: &[LoadSegment],
    kind: FrameKind,
    user: bool,
) -> Result<(), LoadError> {
    for seg in segments {
        load_one(space, seg, kind, user)?;
    }
    Ok(())
}

fn load_one(
    space: &mut AddressSpace,
    seg: &LoadSegment,
    kind: FrameKind,
    user: bool,
) -> Result<(), LoadError> {
    let flags = pte_flags_of(seg.flags, user);
    let unit = kind.size();
    let file_end = seg.vaddr + seg.data.len();
    let memory_end = seg.vaddr + seg.mem_size;
    let mut va = seg.vaddr;
    let mut src = seg.data.as_ptr() as usize;

    trace!(
        "load segment {:#x}-{:#x} (file {:#x}) flags {:?}",
        seg.vaddr,
        memory_end,
        file_end,
        seg.flags
    );

    // 起始地址不对齐时，它不独占所在的粒度单元，单元可能已被
    // 相邻段建好映射。源地址必须有相同的单元内偏移，否则拒绝。
    if !kind.is_aligned(va) {
        if va & (unit - 1) != src & (unit - 1) {
            warn!("segment va {:#x} and source are misaligned", va);
            return Err(LoadError::Misaligned);
        }
        let page = space
            .table
            .alloc_page(&mut space.frames, VirtAddr(kind.align_down(va)).floor(), flags, kind)
            .ok_or(LoadError::Exhausted)?;
        let boundary = kind.align_down(va) + unit;
        let copy_end = if file_end < boundary { file_end } else { boundary };
        if copy_end > va {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src as *const u8,
                    (page + (va & (unit - 1))) as *mut u8,
                    copy_end - va,
                );
            }
        }
        src += boundary - va;
        va = boundary;
    }

    // 完全在文件范围内的整单元
    while va + unit <= file_end {
        if kind == FrameKind::Page {
            // 直接映射映像的后备页，不拷贝
            let pa = space.table.phys().virt_to_phys(src);
            if !pa.aligned() {
                return Err(LoadError::Misaligned);
            }
            match space
                .table
                .map(&mut space.frames, VirtAddr(va).floor(), pa.floor(), flags)
            {
                Ok(()) => {}
                Err(MapError::AlreadyMapped) => return Err(LoadError::Conflict),
                Err(MapError::Exhausted) => return Err(LoadError::Exhausted),
            }
        } else {
            let page = space
                .table
                .alloc_page(&mut space.frames, VirtAddr(va).floor(), flags, kind)
                .ok_or(LoadError::Exhausted)?;
            unsafe {
                core::ptr::copy_nonoverlapping(src as *const u8, page as *mut u8, unit);
            }
        }
        va += unit;
        src += unit;
    }

    // 尾部：分配清零帧，文件残余部分拷到帧首，其余保持零
    while va < memory_end {
        let page = space
            .table
            .alloc_page(&mut space.frames, VirtAddr(va).floor(), flags, kind)
            .ok_or(LoadError::Exhausted)?;
        if va < file_end {
            unsafe {
                core::ptr::copy_nonoverlapping(src as *const u8, page as *mut u8, file_end - va);
            }
        }
        va += unit;
        src += unit;
    }

    Ok(())
}

/// 校验并装载一个 ELF 映像，返回入口地址。
/// 程序头中只有 LOAD 类型的段会被装载。
pub fn load_elf(space: &mut AddressSpace, image: &[u8], user: bool) -> Result<usize, LoadError> {
    if image.is_empty() {
        return Err(LoadError::BadImage);
    }
    let elf = ElfFile::new(image).map_err(|_| LoadError::BadImage)?;
    if elf.header.pt1.magic != [0x7f, 0x45, 0x4c, 0x46] {
        return Err(LoadError::BadImage);
    }

    let kind = FrameKind::ACTIVE;
    let ph_count = elf.header.pt2.ph_count();
    for i in 0..ph_count {
        let ph = elf.program_header(i).map_err(|_| LoadError::BadImage)?;
        if ph.get_type().map_err(|_| LoadError::BadImage)? != Type::Load {
            continue;
        }
        let offset = ph.offset() as usize;
        let file_size = ph.file_size() as usize;
        let mem_size = ph.mem_size() as usize;
        if offset + file_size > image.len() || mem_size < file_size {
            return Err(LoadError::BadImage);
        }
        let mut seg_flags = SegFlags::empty();
        if ph.flags().is_read() {
            seg_flags |= SegFlags::R;
        }
        if ph.flags().is_write() {
            seg_flags |= SegFlags::W;
        }
        if ph.flags().is_execute() {
            seg_flags |= SegFlags::X;
        }
        let seg = LoadSegment {
            vaddr: ph.virtual_addr() as usize,
            data: &image[offset..offset + file_size],
            mem_size,
            flags: seg_flags,
        };
        load_one(space, &seg, kind, user)?;
    }
    Ok(elf.header.pt2.entry_point() as usize)
}

/// 测试用：手工构造一个只有单个 LOAD 段的 ELF64 映像
#[cfg(test)]
pub(crate) fn synthetic_elf(entry: u64, vaddr: u64, payload: &[u8], mem_extra: u64) -> Vec<u8> {
    let mut image = vec![0u8; 120 + payload.len()];
    // e_ident
    image[0..4].copy_from_slice(&[0x7f, 0x45, 0x4c, 0x46]);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // 小端
    image[6] = 1; // EV_CURRENT
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[24..32].copy_from_slice(&entry.to_le_bytes());
    image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    image[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
    // 程序头
    image[64..68].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image[68..72].copy_from_slice(&6u32.to_le_bytes()); // PF_R | PF_W
    image[72..80].copy_from_slice(&120u64.to_le_bytes()); // p_offset
    image[80..88].copy_from_slice(&vaddr.to_le_bytes());
    image[88..96].copy_from_slice(&vaddr.to_le_bytes());
    image[96..104].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    image[104..112].copy_from_slice(&(payload.len() as u64 + mem_extra).to_le_bytes());
    image[112..120].copy_from_slice(&4096u64.to_le_bytes()); // p_align
    image[120..].copy_from_slice(payload);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_util::Arena;
    use crate::mm::{FrameAllocator, MemLayout, PageTable, PhysMap};

    fn fresh_space(pool_pages: usize) -> (Arena, AddressSpace) {
        let arena = Arena::pages(pool_pages);
        let mut frames = FrameAllocator::new();
        frames.init_pool(FrameKind::Page, arena.base(), arena.size());
        let table = PageTable::new(&mut frames, PhysMap::identity()).unwrap();
        (arena, AddressSpace::new(frames, table, MemLayout::default()))
    }

    /// 通过页表逐字节读回一个虚拟地址
    fn read_byte(space: &AddressSpace, va: usize) -> u8 {
        let pa = space.table.translate(crate::mm::VirtAddr(va)).unwrap();
        unsafe { (pa.0 as *const u8).read() }
    }

    #[test]
    fn segment_fidelity_with_unaligned_start() {
        let (_pool, mut space) = fresh_space(32);
        // 映像单独占一块页对齐的内存，前两页写入确定的内容
        let image = Arena::pages(4);
        let file_len = (4096 - 0x123) + 4096 + 300;
        for i in 0..file_len {
            unsafe { ((image.base() + 0x123 + i) as *mut u8).write((i % 251) as u8) };
        }
        let data =
            unsafe { core::slice::from_raw_parts((image.base() + 0x123) as *const u8, file_len) };

        let zero_fill = 5000;
        let seg = LoadSegment {
            vaddr: 0x1_0123,
            data,
            mem_size: file_len + zero_fill,
            flags: SegFlags::R | SegFlags::W,
        };
        load(&mut space, &[seg], FrameKind::Page, true).unwrap();

        // 文件部分逐字节一致
        for i in 0..file_len {
            assert_eq!(read_byte(&space, 0x1_0123 + i), (i % 251) as u8, "字节 {} 不一致", i);
        }
        // 零填充部分读回全零
        for i in 0..zero_fill {
            assert_eq!(read_byte(&space, 0x1_0123 + file_len + i), 0);
        }
        // 整单元部分是直接映射：物理地址落在映像里而不是池里
        let pa = space.table.translate(crate::mm::VirtAddr(0x1_1000)).unwrap();
        assert_eq!(pa.0, image.base() + 0x1000);
    }

    #[test]
    fn misaligned_source_is_rejected() {
        let (_pool, mut space) = fresh_space(8);
        let image = Arena::pages(1);
        let data = unsafe { core::slice::from_raw_parts((image.base() + 0x124) as *const u8, 64) };
        let seg = LoadSegment {
            vaddr: 0x1_0123, // 单元内偏移 0x123 ≠ 源的 0x124
            data,
            mem_size: 64,
            flags: SegFlags::R,
        };
        assert_eq!(
            load(&mut space, &[seg], FrameKind::Page, true),
            Err(LoadError::Misaligned)
        );
    }

    #[test]
    fn exhausted_pool_aborts_load() {
        let (_pool, mut space) = fresh_space(2); // 根结点用掉一帧，仅剩一帧
        let image = Arena::pages(1);
        let data = unsafe { core::slice::from_raw_parts(image.base() as *const u8, 64) };
        let seg = LoadSegment {
            vaddr: 0x1_0000,
            data,
            mem_size: 3 * 4096, // 需要结点帧加多个数据帧
            flags: SegFlags::R | SegFlags::W,
        };
        assert_eq!(
            load(&mut space, &[seg], FrameKind::Page, true),
            Err(LoadError::Exhausted)
        );
    }

    #[test]
    fn elf_adapter_loads_and_returns_entry() {
        let (_pool, mut space) = fresh_space(16);
        let payload: Vec<u8> = (0u8..200).collect();
        let image = synthetic_elf(0x1_0000, 0x1_0000, &payload, 0x100);

        let entry = load_elf(&mut space, &image, true).unwrap();
        assert_eq!(entry, 0x1_0000);
        for (i, &b) in payload.iter().enumerate() {
            assert_eq!(read_byte(&space, 0x1_0000 + i), b);
        }
        // bss 部分为零
        assert_eq!(read_byte(&space, 0x1_0000 + payload.len()), 0);
        // 映像可见范围推到段结束的下一页
        assert_eq!(space.table.highest_user_va(), 0x1_1000);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_pool, mut space) = fresh_space(4);
        let mut image = synthetic_elf(0, 0x1_0000, &[0u8; 8], 0);
        image[0] = 0x00;
        assert_eq!(load_elf(&mut space, &image, true), Err(LoadError::BadImage));
        assert_eq!(load_elf(&mut space, &[], true), Err(LoadError::BadImage));
    }
}
