//! Lock-free Single-Producer Single-Consumer Ring Buffer
//!
//! 连接阻塞式的传输循环和 cpal 的回调模型：
//! - 播放：传输线程写入（生产者），设备回调读取（消费者）
//! - 录音：设备回调写入（生产者），传输线程读取（消费者）
//!
//! 零锁、零分配（初始化时预分配），读写指针各自独占 cache line，可选 mlock。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::memlock;

/// SPSC 无锁环形缓冲区
pub struct RingBuffer<T: Copy + Default> {
    buffer: Box<[UnsafeCell<T>]>,
    capacity: usize,
    mask: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl<T: Copy + Default + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// 创建指定容量的 Ring Buffer
    ///
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let buffer: Vec<UnsafeCell<T>> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 创建指定最小容量的 Ring Buffer（自动向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    /// 锁定缓冲区内存，防止被换页
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }
        let locked = memlock::lock_region(&self.buffer[..]);
        self.memory_locked.store(locked, Ordering::Release);
        locked
    }

    fn unlock_memory(&self) {
        if self.memory_locked.swap(false, Ordering::AcqRel) {
            memlock::unlock_region(&self.buffer[..]);
        }
    }

    /// 写入（生产者调用）
    ///
    /// 返回实际写入的元素数；wait-free，绝不阻塞
    #[inline]
    pub fn write(&self, data: &[T]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let to_write = data.len().min(self.capacity - used);

        for (i, &value) in data[..to_write].iter().enumerate() {
            let idx = (write + i) & self.mask;
            unsafe {
                *self.buffer[idx].get() = value;
            }
        }

        self.write_pos
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// 读取（消费者调用）
    ///
    /// 返回实际读取的元素数；wait-free，绝不阻塞
    #[inline]
    pub fn read(&self, output: &mut [T]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let available = write.wrapping_sub(read);
        let to_read = output.len().min(available);

        for (i, slot) in output[..to_read].iter_mut().enumerate() {
            let idx = (read + i) & self.mask;
            *slot = unsafe { *self.buffer[idx].get() };
        }

        self.read_pos
            .store(read.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// 当前可读元素数
    #[inline]
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 当前可写空间
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 丢弃所有未读数据
    ///
    /// 只能由消费者调用
    pub fn clear(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write, Ordering::Release);
    }
}

impl<T: Copy + Default> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
