//! 内存管理系统调用
//!
//! 接受面经过收窄：`mmap` 只接受私有匿名请求，`mprotect` 要求
//! 地址与长度都按页对齐。资源不足与非法参数一律以 -1 报告，
//! 不会让运行时崩溃。

use crate::boot::with_space;
use crate::config::PAGE_SIZE;
use crate::mm::PTEFlags;

/// 可读
pub const PROT_READ: usize = 0x1;
/// 可写
pub const PROT_WRITE: usize = 0x2;
/// 可执行
pub const PROT_EXEC: usize = 0x4;
/// 私有映射
pub const MAP_PRIVATE: usize = 0x02;
/// 匿名映射
pub const MAP_ANONYMOUS: usize = 0x20;

/// POSIX 保护位到页表项标志的转换；应用映射恒带 U、A，
/// 可写映射顺带置脏位（本核不做写时复制）
fn prot_to_flags(prot: usize) -> PTEFlags {
    let mut flags = PTEFlags::U | PTEFlags::A;
    if prot & PROT_READ != 0 {
        flags |= PTEFlags::R;
    }
    if prot & PROT_WRITE != 0 {
        flags |= PTEFlags::W | PTEFlags::D;
    }
    if prot & PROT_EXEC != 0 {
        flags |= PTEFlags::X;
    }
    flags
}

// 程序断点调整系统调用
pub fn sys_brk(addr: usize) -> isize {
    let ret = with_space(|space| space.grow_break(addr));
    trace!("brk({:#x}) = {:?}", addr, ret);
    match ret {
        Some(brk) => brk as isize,
        None => -1,
    }
}

// 匿名内存映射系统调用
pub fn sys_mmap(
    _addr: usize,
    length: usize,
    prot: usize,
    flags: usize,
    fd: isize,
    _offset: usize,
) -> isize {
    // 文件映射与共享映射一概不支持
    if flags != MAP_ANONYMOUS | MAP_PRIVATE || fd != -1 {
        trace!("mmap flags {:#x} fd {} rejected", flags, fd);
        return -1;
    }
    let ret = with_space(|space| space.map_anonymous(length, prot_to_flags(prot)));
    trace!("mmap(len {:#x}, prot {:#x}) = {:?}", length, prot, ret);
    if log_enabled!(log::Level::Debug) {
        with_space(|space| space.dump());
    }
    match ret {
        Some(va) => va as isize,
        None => -1,
    }
}

// 内存解除映射系统调用
pub fn sys_munmap(addr: usize, length: usize) -> isize {
    with_space(|space| space.unmap_range(addr, length));
    trace!("munmap({:#x}, {:#x})", addr, length);
    0
}

// 映射权限变更系统调用
pub fn sys_mprotect(addr: usize, length: usize, prot: usize) -> isize {
    if addr % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
        return -1; // 地址或长度未对齐
    }
    match with_space(|space| space.change_protection(addr, length, prot_to_flags(prot))) {
        Some(()) => 0,
        None => -1,
    }
}
