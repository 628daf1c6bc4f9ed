//! 内存锁定（mlock）
//!
//! 实时路径上的 page fault 会造成时序抖动。锁定失败只记录日志，不影响功能。

/// 锁定切片所在内存，返回是否成功
pub fn lock_region<T>(data: &[T]) -> bool {
    let len = std::mem::size_of_val(data);
    if len == 0 {
        return false;
    }

    let ptr = data.as_ptr() as *const libc::c_void;
    let result = unsafe { libc::mlock(ptr, len) };

    if result == 0 {
        log::debug!("Memory locked: {} bytes", len);
        true
    } else {
        log::warn!(
            "Failed to lock {} bytes of memory: {}",
            len,
            std::io::Error::last_os_error()
        );
        false
    }
}

/// 解锁由 `lock_region` 锁定的内存
pub fn unlock_region<T>(data: &[T]) {
    let len = std::mem::size_of_val(data);
    if len == 0 {
        return;
    }

    let ptr = data.as_ptr() as *const libc::c_void;
    unsafe {
        libc::munlock(ptr, len);
    }
    log::debug!("Memory unlocked: {} bytes", len);
}
