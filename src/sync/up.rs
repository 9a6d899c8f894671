//! 单执行流环境下的内部可变性容器
use core::cell::{RefCell, RefMut};

/// 将静态数据包装为可安全独占访问的容器。
///
/// 飞地运行时只有唯一一条执行流（§并发模型），因此不需要锁；
/// 只要求使用者保证内层结构体只在单线程中访问。
/// 若重入地调用 `exclusive_access`，`RefCell` 会直接 panic，
/// 这比静默的数据竞争更早暴露错误。
pub struct UPSafeCell<T> {
    /// 内部数据
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// 使用者必须保证内层结构体只被一条执行流访问。
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }
    /// 获得独占访问权；已被借用时 panic。
    pub fn exclusive_access(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}
