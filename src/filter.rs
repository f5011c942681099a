use std::sync::atomic::{AtomicU64, Ordering};

use aead::{AeadInPlace, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use tracing::error;

/// Transforms raw datagrams on their way to and from the socket, e.g. for
///  encryption. The filter sees the complete wire frame including footers;
///  its overhead comes on top of the frame size.
pub trait PacketFilter: Send + Sync {
    /// The number of bytes a filtered datagram can grow by.
    fn max_overhead(&self) -> usize;

    fn filter_outgoing(&self, datagram: &mut Vec<u8>) -> aead::Result<()>;

    fn filter_incoming(&self, datagram: &mut Vec<u8>) -> aead::Result<()>;
}

pub struct NoFilter;
impl PacketFilter for NoFilter {
    fn max_overhead(&self) -> usize {
        0
    }

    fn filter_outgoing(&self, _datagram: &mut Vec<u8>) -> aead::Result<()> {
        // nothing to be done
        Ok(())
    }

    fn filter_incoming(&self, _datagram: &mut Vec<u8>) -> aead::Result<()> {
        // nothing to be done
        Ok(())
    }
}

/// AES-256-GCM over the whole frame. The 12-byte nonce (a fixed part plus a
///  per-datagram counter) is prepended in clear; the GCM tag rides at the
///  end of the ciphertext.
pub struct AesGcmFilter {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl AesGcmFilter {
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    pub fn new(key: &[u8; 32], nonce_fixed: u32) -> AesGcmFilter {
        AesGcmFilter {
            cipher: Aes256Gcm::new(key.into()),
            nonce_fixed,
            nonce_incremented: AtomicU64::new(0),
        }
    }

    fn nonce_bytes(&self, counter: u64) -> [u8; Self::NONCE_LEN] {
        let mut bytes = [0u8; Self::NONCE_LEN];
        bytes[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        bytes
    }
}

impl PacketFilter for AesGcmFilter {
    fn max_overhead(&self) -> usize {
        Self::NONCE_LEN + Self::TAG_LEN
    }

    fn filter_outgoing(&self, datagram: &mut Vec<u8>) -> aead::Result<()> {
        let counter = self.nonce_incremented.fetch_add(1, Ordering::AcqRel);
        let nonce_bytes = self.nonce_bytes(counter);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        match self.cipher.encrypt_in_place(nonce, b"", datagram) {
            Ok(()) => {}
            Err(e) => {
                error!("encryption error: {}", e);
                return Err(e);
            }
        }

        let mut framed = Vec::with_capacity(nonce_bytes.len() + datagram.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.append(datagram);
        *datagram = framed;
        Ok(())
    }

    fn filter_incoming(&self, datagram: &mut Vec<u8>) -> aead::Result<()> {
        if datagram.len() < Self::NONCE_LEN + Self::TAG_LEN {
            return Err(aead::Error);
        }
        let nonce_bytes: [u8; Self::NONCE_LEN] =
            datagram[..Self::NONCE_LEN].try_into().map_err(|_| aead::Error)?;
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let mut payload = datagram.split_off(Self::NONCE_LEN);
        match self.cipher.decrypt_in_place(nonce, b"", &mut payload) {
            Ok(()) => {
                *datagram = payload;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_filter_is_identity() {
        let filter = NoFilter;
        let mut datagram = vec![1, 2, 3];
        filter.filter_outgoing(&mut datagram).unwrap();
        assert_eq!(datagram, vec![1, 2, 3]);
        filter.filter_incoming(&mut datagram).unwrap();
        assert_eq!(datagram, vec![1, 2, 3]);
    }

    #[test]
    fn test_aes_roundtrip() {
        let filter = AesGcmFilter::new(&[7u8; 32], 99);
        let original = b"the quick brown fox".to_vec();

        let mut datagram = original.clone();
        filter.filter_outgoing(&mut datagram).unwrap();
        assert_ne!(datagram, original);
        assert_eq!(datagram.len(), original.len() + filter.max_overhead());

        filter.filter_incoming(&mut datagram).unwrap();
        assert_eq!(datagram, original);
    }

    #[test]
    fn test_aes_unique_nonces() {
        let filter = AesGcmFilter::new(&[7u8; 32], 99);
        let mut a = b"same plaintext".to_vec();
        let mut b = b"same plaintext".to_vec();
        filter.filter_outgoing(&mut a).unwrap();
        filter.filter_outgoing(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes_rejects_tampering() {
        let filter = AesGcmFilter::new(&[7u8; 32], 99);
        let mut datagram = b"sensitive".to_vec();
        filter.filter_outgoing(&mut datagram).unwrap();

        let last = datagram.len() - 1;
        datagram[last] ^= 1;
        assert!(filter.filter_incoming(&mut datagram).is_err());
    }

    #[test]
    fn test_aes_rejects_wrong_key() {
        let sender = AesGcmFilter::new(&[7u8; 32], 99);
        let receiver = AesGcmFilter::new(&[8u8; 32], 99);
        let mut datagram = b"sensitive".to_vec();
        sender.filter_outgoing(&mut datagram).unwrap();
        assert!(receiver.filter_incoming(&mut datagram).is_err());
    }

    #[test]
    fn test_aes_rejects_short_datagram() {
        let filter = AesGcmFilter::new(&[7u8; 32], 99);
        let mut datagram = vec![0u8; 10];
        assert!(filter.filter_incoming(&mut datagram).is_err());
    }
}
