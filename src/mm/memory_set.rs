//! [`AddressSpace`] 的实现：在页表引擎与帧分配器之上
//! 提供应用可见的动态内存原语。
//!
//! 应用的虚拟地址空间划分为互不重叠的固定区域：低地址的映像区、
//! 定长且启动时一次性分配的栈区、以程序断点为上界的可增长堆区，
//! 以及由探测循环安放匿名映射的高地址区。

use super::{tlb_flush, FrameAllocator, FrameKind, PTEFlags, PageTable, VirtAddr, VirtPageNum};
use crate::config::{
    ANON_REGION_END, ANON_REGION_START, HEAP_CEILING, PAGE_SIZE_BITS, USER_STACK_SIZE,
    USER_STACK_TOP,
};

/// 虚拟地址空间各区域的边界。
/// 默认取 `config` 中的常量；按实例携带使得测试可以用
/// 缩小的区域直接覆盖区域耗尽等边界场景。
#[derive(Debug, Clone, Copy)]
pub struct MemLayout {
    /// 堆区静态上限（程序断点不得越过）
    pub heap_ceiling: usize,
    /// 匿名映射区下界
    pub anon_start: usize,
    /// 匿名映射区上界
    pub anon_end: usize,
    /// 栈区上界
    pub stack_top: usize,
    /// 栈区长度
    pub stack_size: usize,
}

impl Default for MemLayout {
    fn default() -> Self {
        Self {
            heap_ceiling: HEAP_CEILING,
            anon_start: ANON_REGION_START,
            anon_end: ANON_REGION_END,
            stack_top: USER_STACK_TOP,
            stack_size: USER_STACK_SIZE,
        }
    }
}

/// 飞地应用的地址空间
pub struct AddressSpace {
    /// 物理页帧分配器（进程级单例，随地址空间同生命周期）
    pub(crate) frames: FrameAllocator,
    /// 页表引擎
    pub(crate) table: PageTable,
    layout: MemLayout,
    brk: usize, // 当前程序断点，始终按基本页对齐
}

impl AddressSpace {
    /// 组合分配器与页表为一个地址空间
    pub fn new(frames: FrameAllocator, table: PageTable, layout: MemLayout) -> Self {
        Self {
            frames,
            table,
            layout,
            brk: 0,
        }
    }

    /// 当前程序断点
    pub fn program_break(&self) -> usize {
        self.brk
    }

    /// 启动阶段摆放初始断点（映像装载后的最高用户地址）
    pub fn set_program_break(&mut self, brk: usize) {
        assert!(FrameKind::Page.is_aligned(brk), "程序断点必须按页对齐");
        self.brk = brk;
    }

    /// 指定粒度当前可用的帧数
    pub fn frames_available(&self, kind: FrameKind) -> usize {
        self.frames.available(kind)
    }

    /// 推进程序断点。
    ///
    /// - `requested == 0`：查询，返回当前断点；
    /// - `requested <= 当前断点`：收缩被接受但不回收页面，原样返回；
    /// - 否则以当前粒度补齐 `[断点, requested)`，全部成功后断点
    ///   推进到 `requested` 的页对齐上界。中途分配短缺时整个调用
    ///   失败，已分配的页不回收。
    pub fn grow_break(&mut self, requested: usize) -> Option<usize> {
        if requested == 0 {
            return Some(self.brk);
        }
        if requested <= self.brk {
            return Some(requested);
        }
        let page_top = FrameKind::Page.align_up(requested);
        if page_top > self.layout.heap_ceiling {
            warn!("brk {:#x} 超出堆区上限 {:#x}", requested, self.layout.heap_ceiling);
            return None;
        }

        let kind = FrameKind::ACTIVE;
        let (start, units) = if kind == FrameKind::Page {
            (self.brk, (page_top - self.brk) >> PAGE_SIZE_BITS)
        } else {
            // 小的增长先填满既有大页，需要新单元时才从对齐处分配
            let aligned = kind.align_up(self.brk);
            (aligned, (kind.align_up(requested).saturating_sub(aligned)) / kind.size())
        };
        if self.frames.available(kind) < units {
            return None;
        }
        let flags = PTEFlags::R | PTEFlags::W | PTEFlags::U;
        let done = self
            .table
            .alloc_range(&mut self.frames, VirtAddr(start).floor(), units, flags, kind);
        if done != units {
            // 不回滚（见 DESIGN.md 的已知限制）
            tlb_flush();
            return None;
        }
        self.brk = page_top;
        tlb_flush();
        debug!("brk -> {:#x} ({} {:?} units)", self.brk, units, kind);
        Some(requested)
    }

    /// 从 `vpn` 起探测连续空闲基本页的数量，上限 `count`
    pub fn probe_free_range(&self, vpn: VirtPageNum, count: usize) -> usize {
        self.table.probe_free(vpn, count)
    }

    /// 在匿名映射区安放一段长度为 `len` 字节的私有匿名映射，
    /// 返回基址。调用方保证 `flags` 已含 U 位。
    ///
    /// 从区域低端向高端扫描：遇到长度不足的空闲段就跳过它
    /// 继续找，直到出现恰好容得下请求的空闲段或区域耗尽。
    pub fn map_anonymous(&mut self, len: usize, flags: PTEFlags) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let kind = FrameKind::ACTIVE;
        let req_bytes = kind.align_up(len);
        let req_pages = req_bytes >> PAGE_SIZE_BITS;
        let units = req_bytes / kind.size();
        // 先确认物理帧总量足够，免得扫描半天再失败
        if self.frames.available(kind) < units {
            return None;
        }

        let end_vpn = VirtAddr(self.layout.anon_end).floor();
        let mut start = VirtAddr(self.layout.anon_start).floor();
        while start.0 + req_pages <= end_vpn.0 {
            let run = self.table.probe_free(start, req_pages);
            if run == req_pages {
                let done = self
                    .table
                    .alloc_range(&mut self.frames, start, units, flags, kind);
                tlb_flush();
                if done != units {
                    // 不回滚已分配的部分
                    return None;
                }
                let base = start.0 << PAGE_SIZE_BITS;
                debug!("mmap anon {:#x} ({} {:?} units)", base, units, kind);
                return Some(base);
            }
            // 跳过被占用的一页，大粒度下还要重新对齐
            let next = (start.0 + run + 1) << PAGE_SIZE_BITS;
            start = VirtAddr(kind.align_up(next)).floor();
        }
        None
    }

    /// 改写 `[addr, addr + len)` 内既有映射的权限位。
    /// 第一个未映射的页让整个调用失败，已改过的页不恢复。
    pub fn change_protection(&mut self, addr: usize, len: usize, flags: PTEFlags) -> Option<()> {
        let pages = len >> PAGE_SIZE_BITS;
        let base = VirtAddr(addr).floor();
        for i in 0..pages {
            if self.table.reprotect(VirtPageNum(base.0 + i), flags).is_none() {
                tlb_flush();
                return None;
            }
        }
        tlb_flush();
        Some(())
    }

    /// 按当前粒度撤销 `[addr, addr + len)` 的映射并归还帧，
    /// 随后回收空掉的中间页表结点。
    pub fn unmap_range(&mut self, addr: usize, len: usize) {
        let kind = FrameKind::ACTIVE;
        let units = kind.align_up(len) / kind.size();
        let base = VirtAddr(addr).floor();
        for i in 0..units {
            self.table
                .unmap(&mut self.frames, VirtPageNum(base.0 + i * kind.pages()), kind);
        }
        let reclaimed = self.table.reclaim_tables(&mut self.frames);
        if reclaimed > 0 {
            trace!("reclaimed {} empty table nodes", reclaimed);
        }
        tlb_flush();
    }

    /// 诊断输出：页表与各粒度空闲量
    pub fn dump(&self) {
        self.table.dump();
        self.frames.dump();
    }
}
