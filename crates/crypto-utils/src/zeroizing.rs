use std::ops::Deref;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A `Vec<u8>` wrapper that is zeroed when dropped.
///
/// Returned by [`crate::open`] and used for seeds held by an unlocked
/// session, so plaintext key material never lingers after use.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingBytes(Vec<u8>);

impl ZeroizingBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Deref for ZeroizingBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for ZeroizingBytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl std::fmt::Debug for ZeroizingBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ZeroizingBytes([REDACTED; {}])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deref_and_len() {
        let zb = ZeroizingBytes::new(vec![1u8, 2, 3]);
        assert_eq!(&*zb, &[1, 2, 3]);
        assert_eq!(zb.len(), 3);
        assert!(!zb.is_empty());
    }

    #[test]
    fn debug_redacts_contents() {
        let zb: ZeroizingBytes = [0xAAu8; 4].as_slice().into();
        let debug = format!("{zb:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("170"));
    }

    #[test]
    fn manual_zeroize_clears() {
        let mut zb = ZeroizingBytes::new(vec![0xAA; 32]);
        zb.zeroize();
        assert!(zb.is_empty());
    }
}
