/// 分级缓冲池
///
/// 按 2 的幂划分 17 个容量等级（1 字节 .. 64 KiB），每个等级维护独立加锁的空闲列表，
/// 中继拷贝循环从这里取出缓冲区，结束时归还，避免每次拷贝都重新分配
use crate::error::PoolError;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// 容量等级数量（bit 0..=16）
pub const SIZE_CLASSES: usize = 17;

/// 支持的最大容量
pub const MAX_BUFFER_SIZE: usize = 1 << (SIZE_CLASSES - 1);

/// 每个等级默认保留的空闲缓冲区数量
pub const DEFAULT_RETAINED_PER_CLASS: usize = 128;

/// 分级缓冲池
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES],
    retained_per_class: usize,
}

impl BufferPool {
    /// 创建缓冲池
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_CLASS)
    }

    /// 创建缓冲池，并指定每个等级最多保留多少个空闲缓冲区
    pub fn with_retention(retained_per_class: usize) -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
            retained_per_class,
        }
    }

    /// 取出一个长度为 `size` 的缓冲区
    ///
    /// 底层容量是不小于 `size` 的最小 2 的幂。`size` 为 0 或超过 [`MAX_BUFFER_SIZE`] 时返回 `None`。
    /// 缓冲区内容不保证清零。
    pub fn get(&self, size: usize) -> Option<Vec<u8>> {
        let class = class_for_size(size)?;
        let reused = self.classes[class].lock().pop();
        let mut buf = reused.unwrap_or_else(|| Vec::with_capacity(1 << class));
        buf.resize(size, 0);
        Some(buf)
    }

    /// 归还缓冲区到与其容量匹配的等级
    ///
    /// 容量为 0 或超过最大等级时返回错误，池状态不变。
    pub fn put(&self, buf: Vec<u8>) -> Result<(), PoolError> {
        let class = class_for_capacity(buf.capacity())?;
        let mut free = self.classes[class].lock();
        if free.len() < self.retained_per_class {
            free.push(buf);
        }
        Ok(())
    }

    /// 取出一个在 drop 时自动归还的缓冲区
    pub fn lease(self: &Arc<Self>, size: usize) -> Option<PooledBuffer> {
        let buf = self.get(size)?;
        Some(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    /// 服务 `size` 的等级当前空闲缓冲区数量
    pub fn idle(&self, size: usize) -> usize {
        class_for_size(size)
            .map(|class| self.classes[class].lock().len())
            .unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// 请求长度对应的等级：ceil(log2(size))
fn class_for_size(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_BUFFER_SIZE {
        return None;
    }
    Some(size.next_power_of_two().trailing_zeros() as usize)
}

/// 容量对应的等级：floor(log2(capacity))
///
/// 非 2 的幂的容量向下归类，保证该等级取出的缓冲区容量总是足够。
fn class_for_capacity(capacity: usize) -> Result<usize, PoolError> {
    if capacity == 0 {
        return Err(PoolError::ZeroCapacity);
    }
    if capacity > MAX_BUFFER_SIZE {
        return Err(PoolError::CapacityTooLarge {
            capacity,
            max: MAX_BUFFER_SIZE,
        });
    }
    Ok((usize::BITS - 1 - capacity.leading_zeros()) as usize)
}

/// 租借的缓冲区，drop 时归还到池中
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            // 容量来自 get()，不会越界
            let _ = self.pool.put(buf);
        }
    }
}
