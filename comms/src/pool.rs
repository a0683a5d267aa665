use std::{ops::Deref, sync::Arc};

use parking_lot::{Condvar, Mutex};

/// A fixed-capacity allocator of message buffers.
///
/// Every buffer the system sends or receives on a channel comes from one of
/// these pools, so an empty pool is what slows a producer down: `checkout`
/// parks the calling thread until some other owner drops its `PoolBuf`.
///
/// Storage is `f32`-backed so byte views handed to the wire are always
/// 4-aligned and can be cast back to `f32` slices without copying.
///
/// Clones share the same storage, so a pool can be handed to the threads
/// that produce into it.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Box<[f32]>>>,
    returned: Condvar,
    slots: usize,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool of `capacity` buffers of `slots` f32 slots each.
    ///
    /// All buffers are allocated up front; a pool never grows afterwards.
    pub fn new(capacity: usize, slots: usize) -> Self {
        let free = (0..capacity)
            .map(|_| vec![0.0; slots].into_boxed_slice())
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                returned: Condvar::new(),
                slots,
                capacity,
            }),
        }
    }

    /// Takes a buffer out of the pool, parking the calling thread while the
    /// pool is empty. The buffer returns on drop, waking one parked thread.
    pub fn checkout(&self) -> PoolBuf {
        let mut free = self.inner.free.lock();

        loop {
            if let Some(data) = free.pop() {
                return PoolBuf {
                    data: Some(data),
                    len: 0,
                    home: Arc::clone(&self.inner),
                };
            }

            self.inner.returned.wait(&mut free);
        }
    }

    /// Takes a buffer out of the pool if one is free.
    pub fn try_checkout(&self) -> Option<PoolBuf> {
        let data = self.inner.free.lock().pop()?;

        Some(PoolBuf {
            data: Some(data),
            len: 0,
            home: Arc::clone(&self.inner),
        })
    }

    /// The number of f32 slots per buffer.
    pub fn slots(&self) -> usize {
        self.inner.slots
    }

    /// The total number of buffers this pool owns.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The number of buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A leased buffer that returns to its pool on drop.
///
/// The valid payload is a byte-length prefix of the backing storage; the
/// remainder holds whatever a previous lease left there.
pub struct PoolBuf {
    data: Option<Box<[f32]>>,
    len: usize,
    home: Arc<PoolInner>,
}

impl PoolBuf {
    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing storage size in bytes.
    pub fn byte_capacity(&self) -> usize {
        self.data().len() * size_of::<f32>()
    }

    /// Marks the first `len` bytes as the valid payload.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.byte_capacity(), "payload beyond buffer capacity");
        self.len = len;
    }

    /// The valid payload as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(self.data())[..self.len]
    }

    /// The whole backing storage as writable bytes.
    ///
    /// Filling it does not extend the payload, pair with `set_len`.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.data_mut())
    }

    /// The valid payload as f32 values.
    pub fn as_floats(&self) -> &[f32] {
        let nums = self.len / size_of::<f32>();
        assert_eq!(nums * size_of::<f32>(), self.len, "payload is not f32 data");
        &self.data()[..nums]
    }

    /// Copies `src` into the buffer and sets the payload accordingly.
    pub fn write_floats(&mut self, src: &[f32]) {
        let len = src.len() * size_of::<f32>();
        assert!(len <= self.byte_capacity(), "payload beyond buffer capacity");

        self.data_mut()[..src.len()].copy_from_slice(src);
        self.len = len;
    }

    /// Copies `src` into the buffer and sets the payload accordingly.
    pub fn write_bytes(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.byte_capacity(),
            "payload beyond buffer capacity"
        );

        self.bytes_mut()[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }

    fn data(&self) -> &[f32] {
        // SAFETY: `data` is only `None` after `drop` took the storage back.
        self.data.as_ref().unwrap()
    }

    fn data_mut(&mut self) -> &mut [f32] {
        self.data.as_mut().unwrap()
    }
}

impl Deref for PoolBuf {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        self.as_floats()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.home.free.lock().push(data);
            self.home.returned.notify_one();
        }
    }
}

impl std::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.len)
            .field("byte_capacity", &self.byte_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn checkout_and_return() {
        let pool = BufferPool::new(2, 4);
        assert_eq!(pool.available(), 2);

        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_checkout().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn payload_views() {
        let pool = BufferPool::new(1, 4);
        let mut buf = pool.checkout();

        buf.write_floats(&[1.0, 2.0, 3.0]);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.as_floats(), &[1.0, 2.0, 3.0]);
        assert_eq!(buf.as_bytes().len(), 12);

        buf.write_bytes(&[0, 0, 128, 63]);
        assert_eq!(buf.as_floats(), &[1.0]);
    }

    #[test]
    fn empty_pool_parks_until_a_return() {
        let pool = Arc::new(BufferPool::new(1, 1));
        let held = pool.checkout();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let buf = pool.checkout();
                buf.byte_capacity()
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert_eq!(waiter.join().unwrap(), 4);
    }

    #[test]
    fn return_wakes_one_waiter_at_a_time() {
        let pool = Arc::new(BufferPool::new(1, 1));
        let held = pool.checkout();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let pool = Arc::clone(&pool);
            waiters.push(thread::spawn(move || {
                // Each waiter holds its lease briefly so the next wakeup
                // only happens once this one returns the buffer.
                let buf = pool.checkout();
                thread::sleep(Duration::from_millis(5));
                drop(buf);
            }));
        }

        thread::sleep(Duration::from_millis(20));
        drop(held);

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(pool.available(), 1);
    }
}
