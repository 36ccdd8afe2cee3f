//! Provides the immutable byte payload stored in and served by cache groups.
//!
//! A [ByteView](ByteView) wraps an opaque byte sequence. Using raw bytes permits to cache
//! values of any shape (strings, serialized structs, images) without the cache having to know.
//! The payload is backed by [bytes::Bytes], therefore cloning a view is cheap (a reference
//! count bump) which is exactly what the read path needs: the same value is handed to the
//! cache, to the current caller and to all coalesced waiters without copying it around.
//!
//! A view is strictly read-only. [as_slice](ByteView::as_slice) lends the payload out for
//! writing it onto the wire, [to_vec](ByteView::to_vec) produces an owned copy for callers
//! which need to take the data apart.
use crate::lru::ByteSize;
use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// An immutable view of a cached byte sequence.
///
/// # Example
/// ```
/// # use hivecache::byteview::ByteView;
/// let view = ByteView::from("hello");
/// assert_eq!(view.len(), 5);
/// assert_eq!(view.as_slice(), b"hello");
/// assert_eq!(view.to_string(), "hello");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Returns the length of the payload in bytes.
    ///
    /// This is also the size used by the LRU store when accounting the memory occupied by a
    /// cached value.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Provides read-only access to the payload without copying it.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Returns an owned copy of the payload.
    ///
    /// Each call yields a fresh allocation, therefore mutating the returned vector has no
    /// effect on the view or on any cached state.
    ///
    /// # Example
    /// ```
    /// # use hivecache::byteview::ByteView;
    /// let view = ByteView::from("hello");
    ///
    /// let mut copy = view.to_vec();
    /// copy[0] = b'H';
    ///
    /// assert_eq!(view.to_vec(), b"hello");
    /// ```
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView {
            data: Bytes::from(data),
        }
    }
}

impl From<&[u8]> for ByteView {
    fn from(data: &[u8]) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data.as_bytes()),
        }
    }
}

impl From<Bytes> for ByteView {
    fn from(data: Bytes) -> Self {
        ByteView { data }
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

impl Display for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}
