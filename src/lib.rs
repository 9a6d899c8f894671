//! 飞地运行时的内存管理核心。
//!
//! 在硬件隔离的可信执行环境中，为飞地内的非信任应用提供一个
//! 由飞地私有内存（EPM）支撑的虚拟地址空间：
//!
//! - [`mm`]：多粒度物理页帧分配器、SV39 页表引擎与地址空间管理器；
//! - [`loader`]：把应用映像的可装载段放进地址空间；
//! - [`boot`]：接收宿主侧驱动交付的内存布局并完成初始化；
//! - [`syscall`]：向应用模拟 `brk`/`mmap`/`munmap`/`mprotect`。
//!
//! 陷入与中断、监视器调用、控制台等由外部协作者提供。
//! 整个核心是严格同步的单执行流，没有锁（见 [`sync::UPSafeCell`]）。

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub mod boot;
pub mod config;
pub mod loader;
pub mod mm;
pub mod sync;
pub mod syscall;
