use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// A queue of byte slices forming one logical byte stream, with O(1) append
///  at the tail and O(1) advance at the head.
///
/// This is the buffering primitive on both sides of a connection: the receive
///  path appends whatever a read returned and peels complete packages off the
///  head, the send path appends framed messages and advances by whatever a
///  write managed to push out. Peeking a prefix only copies when the head
///  slice is shorter than the requested window.
pub struct SliceBuffer {
    slices: VecDeque<Bytes>,
    len: usize,
}

impl SliceBuffer {
    pub fn new() -> SliceBuffer {
        SliceBuffer {
            slices: VecDeque::new(),
            len: 0,
        }
    }

    /// total number of buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// append a slice at the tail; empty slices are discarded
    pub fn add_slice(&mut self, slice: Bytes) {
        if slice.is_empty() {
            return;
        }
        self.len += slice.len();
        self.slices.push_back(slice);
    }

    /// A contiguous view of up to `n` bytes from the head, without consuming
    ///  them. Returns fewer than `n` bytes iff the buffer holds fewer. Cheap
    ///  (refcount bump) when the head slice covers the window, otherwise the
    ///  window is coalesced into a fresh allocation.
    pub fn peek(&self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }

        let first = &self.slices[0];
        if first.len() >= n {
            return first.slice(..n);
        }

        let mut assembled = BytesMut::with_capacity(n);
        let mut remaining = n;
        for slice in &self.slices {
            let take = remaining.min(slice.len());
            assembled.extend_from_slice(&slice[..take]);
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        assembled.freeze()
    }

    /// Extract exactly `n` bytes from the head as one contiguous slice.
    ///
    /// Panics if fewer than `n` bytes are buffered - callers check `len()`
    ///  first (the framing loop only extracts once a full package arrived).
    pub fn take(&mut self, n: usize) -> Bytes {
        assert!(n <= self.len, "take({}) from a buffer of {} bytes", n, self.len);
        if n == 0 {
            return Bytes::new();
        }

        self.len -= n;

        let first = &mut self.slices[0];
        if first.len() >= n {
            let result = first.split_to(n);
            if first.is_empty() {
                self.slices.pop_front();
            }
            return result;
        }

        let mut assembled = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let mut slice = self.slices.pop_front()
                .expect("slice count out of sync with len");
            if slice.len() > remaining {
                assembled.extend_from_slice(&slice.split_to(remaining));
                self.slices.push_front(slice);
                remaining = 0;
            }
            else {
                remaining -= slice.len();
                assembled.extend_from_slice(&slice);
            }
        }
        assembled.freeze()
    }

    /// Drop `n` bytes from the head. After this, the dropped bytes are
    ///  unobservable through any operation.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance({}) over a buffer of {} bytes", n, self.len);
        self.len -= n;

        let mut remaining = n;
        while remaining > 0 {
            let first = &mut self.slices[0];
            if first.len() > remaining {
                Buf::advance(first, remaining);
                return;
            }
            remaining -= first.len();
            self.slices.pop_front();
        }
    }

    /// The head slice, if any - this is what a send loop pushes into the
    ///  socket, advancing by whatever was accepted.
    pub fn top_slice(&self) -> Option<Bytes> {
        self.slices.front().cloned()
    }

    pub fn clear(&mut self) {
        self.slices.clear();
        self.len = 0;
    }
}

impl Default for SliceBuffer {
    fn default() -> Self {
        SliceBuffer::new()
    }
}
