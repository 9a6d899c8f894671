// 内存管理实现
// 针对 RV64 的 SV39 三级页表虚拟内存架构，实现飞地运行时的
// 全部内存管理功能：多粒度物理页帧分配器、页表引擎，以及
// 承载 brk/mmap/mprotect 语义的地址空间管理器。
// 飞地中只有唯一一个应用地址空间，由启动模块持有。

mod address; // 地址与粒度模块
mod frame_allocator; // 物理页帧分配器模块
mod memory_set; // 地址空间模块
pub(crate) mod page_table; // 页表模块

pub use address::{FrameKind, PhysAddr, PhysMap, PhysPageNum, VirtAddr, VirtPageNum};
pub use frame_allocator::{EvictFn, FrameAllocator};
pub use memory_set::{AddressSpace, MemLayout};
pub use page_table::{MapError, PTEFlags, PageTable, PageTableEntry};

/// 使本核的地址翻译缓存失效。
/// 每个修改映射的操作都在返回前调用一次；宿主构建下为空操作。
pub fn tlb_flush() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("sfence.vma");
    }
}

/// 宿主测试用的页对齐内存区，充当飞地的物理内存
#[cfg(test)]
pub(crate) mod test_util {
    use crate::config::PAGE_SIZE;

    pub struct Arena {
        _buf: Vec<u8>,
        base: usize,
        size: usize,
    }

    impl Arena {
        /// 分配 `size` 字节、按 `align` 对齐的内存区
        pub fn aligned(size: usize, align: usize) -> Self {
            let buf = vec![0u8; size + align];
            let base = (buf.as_ptr() as usize + align - 1) & !(align - 1);
            Self {
                _buf: buf,
                base,
                size,
            }
        }
        /// `n` 个基本页
        pub fn pages(n: usize) -> Self {
            Self::aligned(n * PAGE_SIZE, PAGE_SIZE)
        }
        pub fn base(&self) -> usize {
            self.base
        }
        pub fn size(&self) -> usize {
            self.size
        }
    }
}
