//! 启动交接与运行时初始化。
//!
//! 宿主侧驱动在飞地启动前已经完成物理内存的预留与映像装入，
//! 这里拿到的只是一份地址与大小的清单（[`BootInfo`]）。初始化
//! 流程：划分空闲内存池 → 接管预建的根页表 → 装载应用映像 →
//! 摆放程序断点 → 一次性分配用户栈 → 把地址空间交给系统调用层。

use crate::loader::{self, LoadError};
use crate::mm::{
    AddressSpace, EvictFn, FrameAllocator, FrameKind, MemLayout, PTEFlags, PageTable, PhysAddr,
    PhysMap, VirtAddr,
};
use crate::sync::UPSafeCell;
use lazy_static::*;

/// 宿主交付的初始内存布局。所有地址按基本页对齐，
/// 所有大小为基本页的整数倍。
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// 飞地私有内存（EPM）的物理基址
    pub dram_base: usize,
    /// EPM 总长度
    pub dram_size: usize,
    /// 运行时映像的物理基址
    pub runtime_paddr: usize,
    /// 应用映像的物理基址
    pub user_paddr: usize,
    /// 两个映像之后第一个空闲物理地址
    pub free_paddr: usize,
    /// 非信任共享缓冲区（UTM）的基址
    pub utm_base: usize,
    /// UTM 长度
    pub utm_size: usize,
    /// 监视器预建的根页表物理地址（已含运行时自身的映射；
    /// CSR 的读写属于陷入层，本核不碰）
    pub root_table_paddr: usize,
    /// 运行时映像的虚拟基址，与 `runtime_paddr` 共同决定线性偏移
    pub runtime_vaddr: usize,
}

lazy_static! {
    /// 应用地址空间的全局槽位。核心类型本身都按实例传递，
    /// 只有启动/系统调用边界使用这个进程级单例。
    static ref SPACE: UPSafeCell<Option<AddressSpace>> = unsafe { UPSafeCell::new(None) };
    /// UTM 的位置与大小，供边缘调用层查询
    static ref SHARED_BUFFER: UPSafeCell<(usize, usize)> = unsafe { UPSafeCell::new((0, 0)) };
}

/// 在全局地址空间上执行一个操作。启动完成前调用属于运行时
/// 自身的逻辑错误。
pub fn with_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    let mut slot = SPACE.exclusive_access();
    let space = slot.as_mut().expect("地址空间尚未初始化");
    f(space)
}

/// 共享缓冲区的 (基址, 长度)
pub fn shared_buffer() -> (usize, usize) {
    *SHARED_BUFFER.exclusive_access()
}

/// 为全局分配器注册换出回调（外部分页器使用）
pub fn set_evictor(evictor: EvictFn) {
    with_space(|space| space.frames.set_evictor(evictor));
}

/// 依据启动交接完成初始化，返回应用入口地址。
pub fn init(info: &BootInfo) -> Result<usize, LoadError> {
    let phys = PhysMap::new(info.runtime_vaddr, info.runtime_paddr);
    let free_size = info.dram_base + info.dram_size - info.free_paddr;

    info!(
        "UTM : {:#x}-{:#x} ({} KB)",
        info.utm_base,
        info.utm_base + info.utm_size,
        info.utm_size / 1024
    );
    info!(
        "DRAM: {:#x}-{:#x} ({} KB)",
        info.dram_base,
        info.dram_base + info.dram_size,
        info.dram_size / 1024
    );
    info!(
        "RT  : {:#x}-{:#x} ({} KB)",
        info.runtime_paddr,
        info.user_paddr,
        (info.user_paddr - info.runtime_paddr) / 1024
    );
    info!(
        "Eapp: {:#x}-{:#x} ({} KB)",
        info.user_paddr,
        info.free_paddr,
        (info.free_paddr - info.user_paddr) / 1024
    );
    info!(
        "Free: {:#x}-{:#x} ({} KB)",
        info.free_paddr,
        info.dram_base + info.dram_size,
        free_size / 1024
    );

    // 空闲内存全部交给分配器，必要时划出大页池
    let mut frames = FrameAllocator::new();
    frames.init_regions(phys.phys_to_virt(PhysAddr(info.free_paddr)), free_size);

    let table = PageTable::from_root(phys.phys_to_virt(PhysAddr(info.root_table_paddr)), phys);
    let layout = MemLayout::default();
    let mut space = AddressSpace::new(frames, table, layout);

    // 装载应用映像
    let image = unsafe {
        core::slice::from_raw_parts(
            phys.phys_to_virt(PhysAddr(info.user_paddr)) as *const u8,
            info.free_paddr - info.user_paddr,
        )
    };
    let entry = loader::load_elf(&mut space, image, true)?;

    // 程序断点从映像的最高用户地址开始
    let brk = space.table.highest_user_va();
    space.set_program_break(brk);
    info!("program break = {:#x}", brk);

    // 用户栈按当前粒度一次性分配在运行时之下
    let kind = FrameKind::ACTIVE;
    let stack_units = layout.stack_size >> kind.bits();
    let stack_base = layout.stack_top - layout.stack_size;
    let done = space.table.alloc_range(
        &mut space.frames,
        VirtAddr(stack_base).floor(),
        stack_units,
        PTEFlags::R | PTEFlags::W | PTEFlags::U,
        kind,
    );
    assert_eq!(done, stack_units, "用户栈分配不完整");
    info!(
        "stack: {:#x}-{:#x} ({} {:?} units)",
        stack_base, layout.stack_top, stack_units, kind
    );

    *SHARED_BUFFER.exclusive_access() = (info.utm_base, info.utm_size);
    *SPACE.exclusive_access() = Some(space);

    debug!(
        "boot finished, free 4K pages: {}",
        with_space(|s| s.frames_available(FrameKind::Page))
    );
    Ok(entry)
}
