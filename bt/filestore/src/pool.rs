use std::sync::Mutex;

use bytes::BytesMut;

use crate::sync::MutexExt;

const POOL_SIZE: usize = 32;

/// Freelist of read buffers.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub(crate) fn get(&self, size: usize) -> BytesMut {
        let mut buffer = self.buffers.must_lock().pop().unwrap_or_default();
        buffer.reserve(size);
        buffer
    }

    pub(crate) fn recycle(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.must_lock();
        if buffers.len() < POOL_SIZE {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffers.must_lock().len()
    }
}
