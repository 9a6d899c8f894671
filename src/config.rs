//! 运行时的内存布局常量与页面几何参数。
//!
//! 针对 SV39 三级页表：4KiB 基本页、每级 512 项、9 位索引。
//! 通过 `megapage` / `gigapage` 特性选择实际使用的映射粒度。

/// 基本页大小的位宽
pub const PAGE_SIZE_BITS: usize = 12;
/// 基本页大小（4KiB）
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
/// 每级页表的索引位宽
pub const PT_INDEX_BITS: usize = 9;
/// 每个页表结点的表项数
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;
/// 页表级数
pub const PT_LEVELS: usize = 3;

/// 兆页大小的位宽（2MiB）
pub const MEGAPAGE_BITS: usize = PAGE_SIZE_BITS + PT_INDEX_BITS;
/// 兆页大小
pub const MEGAPAGE_SIZE: usize = 1 << MEGAPAGE_BITS;
/// 吉页大小的位宽（1GiB）
pub const GIGAPAGE_BITS: usize = PAGE_SIZE_BITS + 2 * PT_INDEX_BITS;
/// 吉页大小
pub const GIGAPAGE_SIZE: usize = 1 << GIGAPAGE_BITS;

/// 划分双池时为页表结点保留的最少 4KiB 页数。
/// 页表结点始终取自基本页池，若全部内存都交给大页池，
/// 建立第一个大页映射时就再也拿不到结点页了。
pub const MIN_BOOTSTRAP_PAGES: usize = 16;

/// 用户栈顶（栈区上界，向下生长，启动时一次性分配）
pub const USER_STACK_TOP: usize = 0x4000_0000;
/// 用户栈大小：大页模式下为一个映射单元，否则 128KiB
pub const USER_STACK_SIZE: usize = if cfg!(feature = "gigapage") {
    GIGAPAGE_SIZE
} else if cfg!(feature = "megapage") {
    MEGAPAGE_SIZE
} else {
    0x2_0000
};
/// 用户栈底（栈区下界）
pub const USER_STACK_BOTTOM: usize = USER_STACK_TOP - USER_STACK_SIZE;

/// 堆区静态上限：程序断点最多推进到栈区下界
pub const HEAP_CEILING: usize = USER_STACK_BOTTOM;

/// 匿名映射区起始地址（1GiB 对齐，三种粒度都可直接使用）
pub const ANON_REGION_START: usize = 0x20_0000_0000;
/// 匿名映射区结束地址
pub const ANON_REGION_END: usize = 0x30_0000_0000;
