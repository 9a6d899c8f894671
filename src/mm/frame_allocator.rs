//! 实现 [`FrameAllocator`]，管理飞地私有内存（EPM）中所有可回收的物理页帧。
//!
//! 空闲链表不占用任何额外的元数据内存：每个空闲帧的第一个机器字
//! 保存下一个空闲帧的地址（0 表示链表结束），链表本身只记录
//! 头、尾和数量，分配与释放均为 O(1)。
//!
//! # 裸指针使用约定
//!
//! 本模块是整个 crate 中唯一直接把帧地址当作裸指针读写的地方
//! （链表字的读写与整帧清零）。成立条件：
//! - 链表中的帧由分配器独占持有，此期间没有任何映射指向它们；
//! - 对链表字只做原地 `read`/`write`，不产生跨调用存活的引用；
//! - `dealloc` 的对齐与窗口断言保证地址落在本池的物理窗口内。

use super::FrameKind;
use crate::config::{MIN_BOOTSTRAP_PAGES, PAGE_SIZE_BITS};

/// 某一粒度的空闲帧链表及其物理窗口
#[derive(Clone, Copy)]
struct FramePool {
    head: usize,  // 链表头地址，0 表示空
    tail: usize,  // 链表尾地址
    count: usize, // 空闲帧数
    base: usize,  // 该粒度池的窗口下界
    size: usize,  // 窗口长度
}

impl FramePool {
    const fn empty() -> Self {
        Self {
            head: 0,
            tail: 0,
            count: 0,
            base: 0,
            size: 0,
        }
    }
    fn is_empty(&self) -> bool {
        self.count == 0 || self.head == 0
    }
    fn in_window(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// 帧耗尽时的换出回调：外部分页器可以交回一个基本页帧。
pub type EvictFn = fn() -> Option<usize>;

/// 多粒度物理页帧分配器
pub struct FrameAllocator {
    pools: [FramePool; 3],
    evictor: Option<EvictFn>,
}

const fn pool_index(kind: FrameKind) -> usize {
    match kind {
        FrameKind::Page => 0,
        FrameKind::Megapage => 1,
        FrameKind::Gigapage => 2,
    }
}

/// 读取空闲帧头部的后继指针
unsafe fn next_of(frame: usize) -> usize {
    (frame as *const usize).read()
}

/// 写入空闲帧头部的后继指针
unsafe fn set_next(frame: usize, next: usize) {
    (frame as *mut usize).write(next);
}

impl FrameAllocator {
    /// 创建一个所有池都为空的分配器
    pub const fn new() -> Self {
        Self {
            pools: [FramePool::empty(); 3],
            evictor: None,
        }
    }

    /// 注册换出回调
    pub fn set_evictor(&mut self, evictor: EvictFn) {
        self.evictor = Some(evictor);
    }

    /// 将 `[base, base + size)` 整段交给指定粒度的池。
    /// 首尾都必须按该粒度对齐。
    pub fn init_pool(&mut self, kind: FrameKind, base: usize, size: usize) {
        assert!(kind.is_aligned(base), "池基址未按 {:?} 对齐", kind);
        assert!(kind.is_aligned(size), "池长度未按 {:?} 对齐", kind);
        let pool = &mut self.pools[pool_index(kind)];
        *pool = FramePool::empty();
        pool.base = base;
        pool.size = size;
        let mut cur = base;
        while cur < base + size {
            self.push(kind, cur);
            cur += kind.size();
        }
    }

    /// 启动时把宿主交付的整个空闲区域一次性划分为各粒度的池。
    ///
    /// 基本页模式下整个区域进基本页池；大页模式下把按大页对齐的
    /// 尾部留给大页池，且对齐间隙至少保留 [`MIN_BOOTSTRAP_PAGES`]
    /// 个基本页——页表结点永远取自基本页池，不预留就会出现
    /// "建大页映射需要结点页、结点页却一个不剩"的死锁。
    pub fn init_regions(&mut self, base: usize, size: usize) {
        let kind = FrameKind::ACTIVE;
        if kind == FrameKind::Page {
            self.init_pool(FrameKind::Page, base, size);
            return;
        }
        let (small, large) = carve_regions(base, size, kind);
        self.init_pool(FrameKind::Page, small.0, small.1);
        match large {
            Some((lbase, lsize)) => {
                info!(
                    "free region split: 4K pool {:#x}-{:#x}, {:?} pool {:#x}-{:#x}",
                    small.0,
                    small.0 + small.1,
                    kind,
                    lbase,
                    lbase + lsize
                );
                self.init_pool(kind, lbase, lsize);
            }
            None => warn!("空闲区域容不下一个 {:?} 单元，全部并入基本页池", kind),
        }
    }

    /// 取出一个指定粒度的空闲帧，可选地清零整个粒度范围。
    /// 新页表结点和新应用页都必须请求清零。
    pub fn alloc(&mut self, kind: FrameKind, zero: bool) -> Option<usize> {
        if self.pools[pool_index(kind)].is_empty() && kind == FrameKind::Page {
            // 尝试让外部分页器换出一个基本页
            if let Some(page) = self.evictor.and_then(|evict| evict()) {
                self.dealloc(page, FrameKind::Page);
            }
        }
        let pool = &mut self.pools[pool_index(kind)];
        if pool.is_empty() {
            warn!("{:?} 帧已耗尽，且无法换出", kind);
            return None;
        }
        let frame = pool.head;
        pool.head = unsafe { next_of(frame) };
        pool.count -= 1;
        assert!(pool.in_window(frame), "空闲链表中出现窗口外地址 {:#x}", frame);
        if zero {
            unsafe { core::ptr::write_bytes(frame as *mut u8, 0, kind.size()) };
        }
        Some(frame)
    }

    /// 归还一个帧。地址未对齐、落在池窗口之外或重复释放都是
    /// 运行时自身的逻辑错误，直接终止。
    pub fn dealloc(&mut self, frame: usize, kind: FrameKind) {
        let pool = &self.pools[pool_index(kind)];
        assert!(
            kind.is_aligned(frame),
            "释放的帧 {:#x} 未按 {:?} 对齐",
            frame,
            kind
        );
        assert!(
            pool.in_window(frame),
            "释放的帧 {:#x} 不在 {:?} 池窗口内",
            frame,
            kind
        );
        // 重复释放检测只在调试构建中做线性扫描，发布构建保持 O(1)
        #[cfg(debug_assertions)]
        assert!(
            !self.in_free_list(kind, frame),
            "帧 {:#x} 已在空闲链表中，重复释放",
            frame
        );
        self.push(kind, frame);
    }

    /// 指定粒度当前的空闲帧数
    pub fn available(&self, kind: FrameKind) -> usize {
        self.pools[pool_index(kind)].count
    }

    /// 各粒度空闲内存的字节数，用于诊断输出
    pub fn dump(&self) {
        for kind in [FrameKind::Page, FrameKind::Megapage, FrameKind::Gigapage] {
            let count = self.available(kind);
            if count > 0 {
                debug!("{:?} free: {} frames ({} KB)", kind, count, count * kind.size() / 1024);
            }
        }
    }

    /// 追加到链表尾部
    fn push(&mut self, kind: FrameKind, frame: usize) {
        let pool = &mut self.pools[pool_index(kind)];
        if !pool.is_empty() {
            unsafe { set_next(pool.tail, frame) };
        } else {
            pool.head = frame;
        }
        unsafe { set_next(frame, 0) };
        pool.tail = frame;
        pool.count += 1;
    }

    /// 线性扫描链表判断地址是否已在其中（仅调试构建使用）
    #[cfg(debug_assertions)]
    fn in_free_list(&self, kind: FrameKind, frame: usize) -> bool {
        let pool = &self.pools[pool_index(kind)];
        let mut cur = pool.head;
        let mut seen = 0;
        while cur != 0 && seen < pool.count {
            if cur == frame {
                return true;
            }
            cur = unsafe { next_of(cur) };
            seen += 1;
        }
        false
    }
}

/// 计算双池划分：返回基本页池的 (基址, 长度) 与可选的大页池区间。
/// 独立成纯函数以便直接对划分规则做单元测试。
fn carve_regions(
    base: usize,
    size: usize,
    kind: FrameKind,
) -> ((usize, usize), Option<(usize, usize)>) {
    let end = base + size;
    let mut split = kind.align_up(base);
    if (split - base) >> PAGE_SIZE_BITS < MIN_BOOTSTRAP_PAGES {
        split += kind.size();
    }
    if split >= end {
        return ((base, size), None);
    }
    ((base, split - base), Some((split, end - split)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_util::Arena;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn alloc_dealloc_round_trip() {
        let arena = Arena::pages(8);
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Page, arena.base(), arena.size());
        let before = allocator.available(FrameKind::Page);

        let a = allocator.alloc(FrameKind::Page, false).unwrap();
        let b = allocator.alloc(FrameKind::Page, true).unwrap();
        let c = allocator.alloc(FrameKind::Page, false).unwrap();
        allocator.dealloc(b, FrameKind::Page);
        allocator.dealloc(a, FrameKind::Page);
        allocator.dealloc(c, FrameKind::Page);

        assert_eq!(allocator.available(FrameKind::Page), before);
    }

    #[test]
    fn frames_are_exclusive() {
        let arena = Arena::pages(4);
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Page, arena.base(), arena.size());
        let mut taken = Vec::new();
        while let Some(frame) = allocator.alloc(FrameKind::Page, false) {
            assert!(!taken.contains(&frame), "帧被重复分配");
            taken.push(frame);
        }
        assert_eq!(taken.len(), 4);
        assert_eq!(allocator.available(FrameKind::Page), 0);
    }

    #[test]
    fn zeroed_alloc_clears_whole_frame() {
        let arena = Arena::pages(1);
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Page, arena.base(), arena.size());
        let frame = allocator.alloc(FrameKind::Page, false).unwrap();
        unsafe { core::ptr::write_bytes(frame as *mut u8, 0xaa, 4096) };
        allocator.dealloc(frame, FrameKind::Page);
        let frame = allocator.alloc(FrameKind::Page, true).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(frame as *const u8, 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "重复释放")]
    fn double_free_is_fatal() {
        let arena = Arena::pages(2);
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Page, arena.base(), arena.size());
        let frame = allocator.alloc(FrameKind::Page, false).unwrap();
        allocator.dealloc(frame, FrameKind::Page);
        allocator.dealloc(frame, FrameKind::Page);
    }

    #[test]
    #[should_panic(expected = "未按")]
    fn misaligned_free_is_fatal() {
        let arena = Arena::pages(2);
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Page, arena.base(), arena.size());
        let frame = allocator.alloc(FrameKind::Page, false).unwrap();
        allocator.dealloc(frame + 8, FrameKind::Page);
    }

    static EVICTED: AtomicUsize = AtomicUsize::new(0);

    fn evict_one() -> Option<usize> {
        match EVICTED.swap(0, Ordering::SeqCst) {
            0 => None,
            addr => Some(addr),
        }
    }

    #[test]
    fn evictor_feeds_exhausted_pool() {
        let arena = Arena::pages(2);
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Page, arena.base(), arena.size());
        allocator.set_evictor(evict_one);

        let a = allocator.alloc(FrameKind::Page, false).unwrap();
        let _b = allocator.alloc(FrameKind::Page, false).unwrap();
        assert_eq!(allocator.available(FrameKind::Page), 0);

        // 没有可换出的页时分配失败
        assert!(allocator.alloc(FrameKind::Page, false).is_none());

        // 分页器交回 a 后分配恢复
        EVICTED.store(a, Ordering::SeqCst);
        assert_eq!(allocator.alloc(FrameKind::Page, false), Some(a));
    }

    #[test]
    fn carve_reserves_bootstrap_pages() {
        let mega = FrameKind::Megapage.size();
        // 基址已按兆页对齐：间隙为 0，不足 16 页，需整体后移一个单元
        let (small, large) = carve_regions(0, 4 * mega, FrameKind::Megapage);
        assert_eq!(small, (0, mega));
        assert_eq!(large, Some((mega, 3 * mega)));

        // 间隙足够时直接在对齐点切分
        let base = mega - MIN_BOOTSTRAP_PAGES * 4096;
        let (small, large) = carve_regions(base, mega + MIN_BOOTSTRAP_PAGES * 4096, FrameKind::Megapage);
        assert_eq!(small, (base, MIN_BOOTSTRAP_PAGES * 4096));
        assert_eq!(large, Some((mega, mega)));

        // 区域太小：退化为纯基本页池
        let (small, large) = carve_regions(0, 64 * 4096, FrameKind::Megapage);
        assert_eq!(small, (0, 64 * 4096));
        assert!(large.is_none());
    }

    #[test]
    fn megapage_pool_round_trip() {
        let arena = Arena::aligned(2 * FrameKind::Megapage.size(), FrameKind::Megapage.size());
        let mut allocator = FrameAllocator::new();
        allocator.init_pool(FrameKind::Megapage, arena.base(), arena.size());
        assert_eq!(allocator.available(FrameKind::Megapage), 2);
        let frame = allocator.alloc(FrameKind::Megapage, false).unwrap();
        assert!(FrameKind::Megapage.is_aligned(frame));
        allocator.dealloc(frame, FrameKind::Megapage);
        assert_eq!(allocator.available(FrameKind::Megapage), 2);
    }
}
