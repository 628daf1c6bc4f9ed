//! 流控制标志
//!
//! 控制端（`AudioController`）和传输循环共享同一个 `StreamControl`。
//! `keep_running`、`started`、`finished` 是原子标志；暂停标志放在
//! `Mutex<bool>` 里配合 `Condvar`，恢复和停止可以立即唤醒暂停中的循环。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Inner {
    keep_running: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
    paused: Mutex<bool>,
    wake: Condvar,
}

#[derive(Clone)]
pub struct StreamControl {
    inner: Arc<Inner>,
}

impl StreamControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                keep_running: AtomicBool::new(true),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                paused: Mutex::new(false),
                wake: Condvar::new(),
            }),
        }
    }

    /// 请求停止；循环在下一个 period 边界退出
    pub fn request_stop(&self) {
        self.inner.keep_running.store(false, Ordering::Release);
        // 持锁通知，避免与 wait_while_paused 的检查交错而丢失唤醒
        let _guard = self.inner.paused.lock();
        self.inner.wake.notify_all();
    }

    #[inline]
    pub fn should_continue(&self) -> bool {
        self.inner.keep_running.load(Ordering::Acquire)
    }

    pub fn request_pause(&self) {
        *self.inner.paused.lock() = true;
    }

    pub fn request_resume(&self) {
        let mut paused = self.inner.paused.lock();
        *paused = false;
        self.inner.wake.notify_all();
    }

    /// 切换暂停状态，返回切换后是否处于暂停
    pub fn toggle_pause(&self) -> bool {
        let mut paused = self.inner.paused.lock();
        *paused = !*paused;
        if !*paused {
            self.inner.wake.notify_all();
        }
        *paused
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        *self.inner.paused.lock()
    }

    /// 暂停中最多等待 `timeout`，返回是否仍处于暂停（且未被停止）
    pub fn wait_while_paused(&self, timeout: Duration) -> bool {
        let mut paused = self.inner.paused.lock();
        if *paused && self.should_continue() {
            self.inner.wake.wait_for(&mut paused, timeout);
        }
        *paused && self.should_continue()
    }

    pub fn mark_started(&self) {
        self.inner.started.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// 以固定间隔轮询，直到循环进入 Active 或已经结束
    pub fn wait_started(&self, poll: Duration) {
        while !self.is_started() && !self.is_finished() {
            std::thread::sleep(poll);
        }
    }

    pub fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamControl")
            .field("keep_running", &self.should_continue())
            .field("paused", &self.is_paused())
            .field("started", &self.is_started())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_initial_state() {
        let control = StreamControl::new();
        assert!(control.should_continue());
        assert!(!control.is_paused());
        assert!(!control.is_started());
        assert!(!control.is_finished());
    }

    #[test]
    fn test_toggle_pause() {
        let control = StreamControl::new();
        assert!(control.toggle_pause());
        assert!(control.is_paused());
        assert!(!control.toggle_pause());
        assert!(!control.is_paused());
    }

    #[test]
    fn test_resume_wakes_waiter() {
        let control = StreamControl::new();
        control.request_pause();

        let waiter = {
            let control = control.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                while control.wait_while_paused(Duration::from_secs(5)) {}
                start.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        control.request_resume();
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(2), "waited {:?}", waited);
    }

    #[test]
    fn test_stop_ends_pause() {
        let control = StreamControl::new();
        control.request_pause();
        control.request_stop();
        assert!(!control.wait_while_paused(Duration::from_millis(500)));
        assert!(!control.should_continue());
    }

    #[test]
    fn test_wait_started_returns_when_finished() {
        let control = StreamControl::new();
        let other = control.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            other.mark_finished();
        });
        control.wait_started(Duration::from_millis(1));
        assert!(control.is_finished());
        handle.join().unwrap();
    }
}
