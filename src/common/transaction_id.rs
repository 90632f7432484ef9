//! Transaction ids correlating requests with their responses.

use std::fmt::{self, Debug, Formatter};

use rand::Rng;

use crate::{Error, Result};

/// The size of transaction ids issued by this crate, in bytes.
pub const TRANSACTION_ID_SIZE: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A 4 byte correlation token between one request and its response or error.
pub struct TransactionId(pub [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// Placeholder used in error replies to messages too malformed
    /// to recover their real transaction id from.
    pub const FILLER: TransactionId = TransactionId([0; TRANSACTION_ID_SIZE]);

    /// Random transaction id, never equal to [Self::FILLER].
    pub fn random() -> TransactionId {
        let mut rng = rand::thread_rng();

        loop {
            let tid = TransactionId(rng.gen());
            if !tid.is_filler() {
                return tid;
            }
        }
    }

    /// Returns an Err if `bytes` is not exactly [TRANSACTION_ID_SIZE] long,
    /// which is the case for transactions not initiated by this crate.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<TransactionId> {
        let bytes = bytes.as_ref();

        bytes
            .try_into()
            .map(TransactionId)
            .map_err(|_| Error::InvalidTransactionId(bytes.to_vec()))
    }

    pub fn is_filler(&self) -> bool {
        self == &Self::FILLER
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({:02x?})", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_is_never_filler() {
        for _ in 0..10_000 {
            assert!(!TransactionId::random().is_filler());
        }
    }

    #[test]
    fn from_bytes_only_accepts_four_bytes() {
        assert_eq!(
            TransactionId::from_bytes([1u8, 2, 3, 4]).unwrap(),
            TransactionId([1, 2, 3, 4])
        );
        assert!(TransactionId::from_bytes([1u8, 2]).is_err());
        assert!(TransactionId::from_bytes(Vec::<u8>::new()).is_err());
    }
}
