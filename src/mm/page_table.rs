//! 实现 [`PageTableEntry`] 和 [`PageTable`]。
//!
//! 固定三级的基数树页表：一个根结点加按需分配的中间结点，
//! 结点帧一律取自基本页池并清零。同一个游走器通过限制下降的
//! 级数即可在任意粒度上落叶子（基本页 3 级、兆页 2 级、吉页 1 级）。

use super::{FrameAllocator, FrameKind, PhysAddr, PhysMap, PhysPageNum, VirtAddr, VirtPageNum};
use crate::config::{PT_ENTRIES, PT_LEVELS};
use bitflags::*;

bitflags! {
    /// 页表项标志
    pub struct PTEFlags: u8 {
        const V = 1 << 0; // 有效位
        const R = 1 << 1; // 可读位
        const W = 1 << 2; // 可写位
        const X = 1 << 3; // 可执行位
        const U = 1 << 4; // 用户态访问位
        const G = 1 << 5; // 全局位
        const A = 1 << 6; // 已访问位
        const D = 1 << 7; // 已修改位
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
/// 页表项结构
pub struct PageTableEntry {
    /// 页表项的比特位
    pub bits: usize,
}

impl PageTableEntry {
    /// 创建新的页表项
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits as usize,
        }
    }
    /// 创建空的页表项
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    /// 从页表项获取物理页号
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    /// 从页表项获取标志位
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits(self.bits as u8).unwrap()
    }
    /// 有效位是否置位
    pub fn is_valid(&self) -> bool {
        (self.flags() & PTEFlags::V) != PTEFlags::empty()
    }
    /// 是否为叶子表项（R/W/X 任一置位），否则为指向下级结点的指针表项
    pub fn is_leaf(&self) -> bool {
        (self.flags() & (PTEFlags::R | PTEFlags::W | PTEFlags::X)) != PTEFlags::empty()
    }
    /// 页面是否可读
    pub fn readable(&self) -> bool {
        (self.flags() & PTEFlags::R) != PTEFlags::empty()
    }
    /// 页面是否可写
    pub fn writable(&self) -> bool {
        (self.flags() & PTEFlags::W) != PTEFlags::empty()
    }
    /// 页面是否可执行
    pub fn executable(&self) -> bool {
        (self.flags() & PTEFlags::X) != PTEFlags::empty()
    }
    /// 用户态是否可访问
    pub fn is_user(&self) -> bool {
        (self.flags() & PTEFlags::U) != PTEFlags::empty()
    }
}

/// 映射失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// 目标槽位已有有效映射，拒绝覆盖
    AlreadyMapped,
    /// 基本页池无法再提供页表结点帧
    Exhausted,
}

/// 层数（1 起）对应的映射粒度
const fn kind_at(level: usize) -> FrameKind {
    match level {
        1 => FrameKind::Gigapage,
        2 => FrameKind::Megapage,
        _ => FrameKind::Page,
    }
}

/// 页表结构
pub struct PageTable {
    root: usize,   // 根结点的运行时地址
    phys: PhysMap, // 物理地址与运行时地址间的线性偏移
}

impl PageTable {
    /// 从基本页池取一个清零帧作为根结点，创建空页表
    pub fn new(frames: &mut FrameAllocator, phys: PhysMap) -> Option<Self> {
        let root = frames.alloc(FrameKind::Page, true)?;
        Some(PageTable { root, phys })
    }
    /// 接管一个已建好的根结点（启动交接中由宿主/监视器预先填好
    /// 运行时自身的映射）
    pub fn from_root(root: usize, phys: PhysMap) -> Self {
        PageTable { root, phys }
    }
    /// 根结点的物理地址
    pub fn root_pa(&self) -> PhysAddr {
        self.phys.virt_to_phys(self.root)
    }
    /// 本页表使用的物理地址偏移映射
    pub(crate) fn phys(&self) -> PhysMap {
        self.phys
    }
    /// 把一个结点帧视作表项数组。
    /// 结点帧只经由本方法访问，且调用方不会同时持有两个
    /// 指向同一结点的数组引用。
    fn node(&self, va: usize) -> &'static mut [PageTableEntry] {
        unsafe { core::slice::from_raw_parts_mut(va as *mut PageTableEntry, PT_ENTRIES) }
    }
    /// 指针表项所指孩子结点的运行时地址
    fn child_of(&self, pte: &PageTableEntry) -> usize {
        self.phys.phys_to_virt(pte.ppn().into())
    }

    /// 结点中第 `idx` 个表项的独占引用。
    /// 约定同 [`node`](Self::node)：调用方不会让两个指向同一槽位的
    /// 引用同时存活。
    fn slot(&self, node_va: usize, idx: usize) -> &'static mut PageTableEntry {
        unsafe { &mut *(node_va as *mut PageTableEntry).add(idx) }
    }

    /// 沿虚拟页号下降，最多走 `levels` 级，返回到达的表项及其层数。
    /// 在更高层遇到有效叶子（粗粒度映射已覆盖该地址）时提前返回；
    /// 中间结点缺失时返回 `None`。
    fn walk(&self, vpn: VirtPageNum, levels: usize) -> Option<(&'static mut PageTableEntry, usize)> {
        let idxs = vpn.indexes();
        let mut node_va = self.root;
        for i in 0..levels {
            let pte = self.slot(node_va, idxs[i]);
            if i + 1 == levels || (pte.is_valid() && pte.is_leaf()) {
                return Some((pte, i + 1));
            }
            if !pte.is_valid() {
                return None;
            }
            node_va = self.child_of(pte);
        }
        None
    }

    /// 与 [`walk`](Self::walk) 相同，但沿途缺失的中间结点会被创建：
    /// 每个新结点占用一个清零的基本页帧，并以指针表项挂入父结点。
    /// 帧耗尽时返回 `None`（资源耗尽是普通失败，不是致命错误）。
    fn walk_create(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
        levels: usize,
    ) -> Option<(&'static mut PageTableEntry, usize)> {
        let idxs = vpn.indexes();
        let mut node_va = self.root;
        for i in 0..levels {
            let pte = self.slot(node_va, idxs[i]);
            if i + 1 == levels || (pte.is_valid() && pte.is_leaf()) {
                return Some((pte, i + 1));
            }
            if !pte.is_valid() {
                let frame = frames.alloc(FrameKind::Page, true)?;
                *pte = PageTableEntry::new(self.phys.virt_to_phys(frame).floor(), PTEFlags::V);
                trace!("new table node at {:#x} (level {})", frame, i + 1);
            }
            node_va = self.child_of(pte);
        }
        None
    }

    /// 在虚拟页与物理页之间建立基本页映射。
    /// 槽位已有有效映射时返回 [`MapError::AlreadyMapped`]，
    /// 不做覆盖——覆盖会悄悄泄漏原来的帧。
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        flags: PTEFlags,
    ) -> Result<(), MapError> {
        let (pte, _) = self
            .walk_create(frames, vpn, PT_LEVELS)
            .ok_or(MapError::Exhausted)?;
        if pte.is_valid() {
            return Err(MapError::AlreadyMapped);
        }
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V | PTEFlags::A | PTEFlags::D);
        Ok(())
    }

    /// 为虚拟页分配一个指定粒度的清零帧并建立映射，
    /// 返回帧的运行时地址。该地址上已有映射时幂等地返回
    /// 现有帧（加载器会重复经过部分填充的叶子页）。
    pub fn alloc_page(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
        flags: PTEFlags,
        kind: FrameKind,
    ) -> Option<usize> {
        let (pte, level) = self.walk_create(frames, vpn, kind.levels())?;
        if pte.is_valid() {
            if !pte.is_leaf() || level != kind.levels() {
                // 该地址下已有别的粒度的映射结构
                warn!("alloc_page {:?}: {:?} 被其他粒度占用", kind, vpn);
                return None;
            }
            return Some(self.child_of(pte));
        }
        let frame = frames.alloc(kind, true)?;
        *pte = PageTableEntry::new(
            self.phys.virt_to_phys(frame).floor(),
            flags | PTEFlags::V | PTEFlags::A | PTEFlags::D,
        );
        Some(frame)
    }

    /// 从 `vpn` 起连续分配 `count` 个 `kind` 粒度的单元，
    /// 返回成功分配的数量；中途失败即停下，不回收已分配部分。
    pub fn alloc_range(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
        count: usize,
        flags: PTEFlags,
        kind: FrameKind,
    ) -> usize {
        for i in 0..count {
            let unit = VirtPageNum(vpn.0 + i * kind.pages());
            if self.alloc_page(frames, unit, flags, kind).is_none() {
                return i;
            }
        }
        count
    }

    /// 只改写现有叶子的权限位，保持帧绑定不变，返回帧的运行时地址。
    /// 该原语仅服务于应用可见的映射，新权限必须带 U 位。
    pub fn reprotect(&mut self, vpn: VirtPageNum, flags: PTEFlags) -> Option<usize> {
        assert!(
            flags.contains(PTEFlags::U),
            "reprotect 只能用于用户态映射"
        );
        let (pte, _) = self.walk(vpn, PT_LEVELS)?;
        if !pte.is_valid() {
            return None;
        }
        *pte = PageTableEntry::new(pte.ppn(), flags | PTEFlags::V);
        Some(self.child_of(pte))
    }

    /// 撤销一个 `kind` 粒度的映射并把帧归还分配器。
    /// 没有映射时为空操作；撤销非用户态叶子是运行时逻辑错误。
    pub fn unmap(&mut self, frames: &mut FrameAllocator, vpn: VirtPageNum, kind: FrameKind) {
        let Some((pte, level)) = self.walk(vpn, kind.levels()) else {
            return;
        };
        if !pte.is_valid() {
            return;
        }
        if level != kind.levels() || !pte.is_leaf() {
            warn!("unmap {:?}: {:?} 处不是该粒度的叶子，忽略", kind, vpn);
            return;
        }
        assert!(pte.is_user(), "试图撤销内核映射 {:?}", vpn);
        let frame = self.child_of(pte);
        *pte = PageTableEntry::empty();
        frames.dealloc(frame, kind);
    }

    /// 查询虚拟页号对应的表项（返回拷贝）
    pub fn translate_vpn(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.walk(vpn, PT_LEVELS)
            .and_then(|(pte, _)| if pte.is_valid() { Some(*pte) } else { None })
    }

    /// 虚拟地址到物理地址的翻译，粒度内偏移一并保留
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let (pte, level) = self.walk(va.floor(), PT_LEVELS)?;
        if !pte.is_valid() || !pte.is_leaf() {
            return None;
        }
        let kind = kind_at(level);
        let base: PhysAddr = pte.ppn().into();
        Some(PhysAddr(base.0 | (va.0 & (kind.size() - 1))))
    }

    /// 从 `vpn` 起向前探测，统计连续未被占用的基本页数，
    /// 到第一个已占用的槽位或 `limit` 为止。
    /// 与占用的判据是槽位原始值非零，而不只是有效位。
    pub fn probe_free(&self, vpn: VirtPageNum, limit: usize) -> usize {
        for i in 0..limit {
            if let Some((pte, _)) = self.walk(VirtPageNum(vpn.0 + i), PT_LEVELS) {
                if pte.bits != 0 {
                    return i;
                }
            }
        }
        limit
    }

    /// 遍历所有用户态叶子，依序调用
    /// `visit(级数, 叶子覆盖的虚拟基址, 表项)`。内核叶子被跳过。
    pub fn walk_user<F: FnMut(usize, VirtAddr, PageTableEntry)>(&self, visit: &mut F) {
        self.walk_node(self.root, 1, 0, visit);
    }

    fn walk_node<F: FnMut(usize, VirtAddr, PageTableEntry)>(
        &self,
        node_va: usize,
        level: usize,
        vbase: usize,
        visit: &mut F,
    ) {
        let node = self.node(node_va);
        for (i, pte) in node.iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }
            let va = vbase | i << kind_at(level).bits();
            if pte.is_leaf() {
                if pte.is_user() {
                    visit(level, VirtAddr(va), *pte);
                }
            } else if level < PT_LEVELS {
                self.walk_node(self.child_of(pte), level + 1, va, visit);
            }
        }
    }

    /// 应用可见映射的最高结束地址（无映射时为 0）。
    /// 启动阶段据此摆放初始程序断点。
    pub fn highest_user_va(&self) -> usize {
        let mut max = 0;
        self.walk_user(&mut |level, va, _| {
            let end = va.0 + kind_at(level).size();
            if end > max {
                max = end;
            }
        });
        max
    }

    /// 整棵树（含内核映射）是否没有任何有效表项
    pub fn is_empty(&self) -> bool {
        self.subtree_empty(self.root, 1)
    }

    fn subtree_empty(&self, node_va: usize, level: usize) -> bool {
        let node = self.node(node_va);
        node.iter().all(|pte| {
            if !pte.is_valid() {
                true
            } else if pte.is_leaf() || level >= PT_LEVELS {
                false
            } else {
                self.subtree_empty(self.child_of(pte), level + 1)
            }
        })
    }

    /// 回收不再含有任何有效叶子的中间结点，返回释放的结点数。
    /// 根结点永不回收。后序遍历：先清空孩子才能判定父结点。
    pub fn reclaim_tables(&mut self, frames: &mut FrameAllocator) -> usize {
        self.reclaim_node(frames, self.root, 1)
    }

    fn reclaim_node(
        &mut self,
        frames: &mut FrameAllocator,
        node_va: usize,
        level: usize,
    ) -> usize {
        let mut freed = 0;
        let node = self.node(node_va);
        for pte in node.iter_mut() {
            if !pte.is_valid() || pte.is_leaf() || level >= PT_LEVELS {
                continue;
            }
            let child = self.child_of(pte);
            freed += self.reclaim_node(frames, child, level + 1);
            if self.node(child).iter().all(|e| !e.is_valid()) {
                *pte = PageTableEntry::empty();
                frames.dealloc(child, FrameKind::Page);
                freed += 1;
            }
        }
        freed
    }

    /// 以人类可读形式输出整棵页表（级数、虚拟页号、原始表项、
    /// 物理地址或下级结点指针），供开发诊断，不保证格式稳定。
    pub fn dump(&self) {
        self.dump_node(self.root, 1, 0);
    }

    fn dump_node(&self, node_va: usize, level: usize, vbase: usize) {
        let node = self.node(node_va);
        for (i, pte) in node.iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }
            let va = vbase | i << kind_at(level).bits();
            if pte.is_leaf() {
                if !pte.is_user() {
                    continue;
                }
                debug!(
                    "L{}: VPN = {:#05x} -> PTE {:#x} -> PA {:#x}",
                    level,
                    va >> kind_at(level).bits(),
                    pte.bits,
                    PhysAddr::from(pte.ppn()).0
                );
            } else {
                debug!(
                    "L{}: VPN = {:#05x} -> PTE {:#x} -> next table @ PA {:#x}",
                    level,
                    va >> kind_at(level).bits(),
                    pte.bits,
                    PhysAddr::from(pte.ppn()).0
                );
                if level < PT_LEVELS {
                    self.dump_node(self.child_of(pte), level + 1, va);
                }
            }
        }
    }
}
