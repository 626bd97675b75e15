//! Provides an immutable view on a cached byte payload.
//!
//! Values travel through the system as [ByteView]s. The underlying buffer is never handed out
//! mutably: ingress copies the bytes into an owned buffer and egress either borrows them
//! read-only or produces a fresh, independent copy. Cloning a view is cheap - it only copies
//! the header, not the payload - which is what allows a cache hit to return the stored value
//! without touching the heap.
use bytes::Bytes;

/// An immutable byte payload with a known length.
///
/// # Examples
/// ```
/// # use callisto::view::ByteView;
/// let view = ByteView::from("630");
/// assert_eq!(view.len(), 3);
/// assert_eq!(view.to_vec(), b"630");
/// assert_eq!(view.to_string_lossy(), "630");
///
/// // A copy handed out by the view is independent of the view itself...
/// let mut copy = view.to_vec();
/// copy[0] = b'9';
/// assert_eq!(view.to_vec(), b"630");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Creates a view by copying the given bytes into an owned buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Returns the number of bytes in the view.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a fresh, independent copy of the payload.
    ///
    /// Mutating the returned vector has no effect on the view or on any value stored in a
    /// cache.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Returns the payload as a string, replacing invalid UTF-8 sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Provides read-only access to the payload without copying.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView { data: data.into() }
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        ByteView::from_slice(data.as_bytes())
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteView({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::ByteView;

    #[test]
    fn copies_are_independent() {
        let view = ByteView::from_slice(b"immutable");
        let mut copy = view.to_vec();
        copy[0] = b'X';

        assert_eq!(view.to_vec(), b"immutable");
        assert_eq!(view.as_slice(), b"immutable");
    }

    #[test]
    fn ingress_copies_the_source() {
        let mut source = b"original".to_vec();
        let view = ByteView::from_slice(&source);
        source[0] = b'X';

        assert_eq!(view.to_vec(), b"original");
    }

    #[test]
    fn clones_share_the_payload_but_stay_immutable() {
        let view = ByteView::from("value");
        let clone = view.clone();

        assert_eq!(view, clone);
        assert_eq!(clone.to_string_lossy(), "value");
    }
}
