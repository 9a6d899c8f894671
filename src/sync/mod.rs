//! 同步原语模块
mod up;

pub use up::UPSafeCell;
