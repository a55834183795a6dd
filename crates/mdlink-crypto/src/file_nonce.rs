use crate::error::{CryptoError, Result};

/// Length of a random file id.
pub const FILE_ID_LENGTH: usize = 24;

/// Length of the AEAD nonce for file chunks.
pub const FILE_CHUNK_NONCE_LENGTH: usize = 12;

/// Counter based nonce for encrypting the chunks of one file.
///
/// ```text
/// | file id suffix (4) | chunk counter BE (4) | reserved (3) | last chunk (1) |
/// ```
///
/// The counter starts at 1. Generation fails once the counter passes
/// `u32::MAX` or after the last chunk was handed out, since reusing a nonce
/// under the same file key breaks the AEAD.
#[derive(Debug)]
pub struct FileChunkNonce {
    nonce: [u8; FILE_CHUNK_NONCE_LENGTH],
    counter: u64,
    last_chunk_reached: bool,
}

impl FileChunkNonce {
    pub const MAX_COUNTER: u64 = u32::MAX as u64;

    pub fn new(file_id: &[u8; FILE_ID_LENGTH]) -> Self {
        let mut nonce = [0u8; FILE_CHUNK_NONCE_LENGTH];
        nonce[..4].copy_from_slice(&file_id[FILE_ID_LENGTH - 4..]);
        Self {
            nonce,
            counter: 1,
            last_chunk_reached: false,
        }
    }

    /// Nonce for the next chunk. Set `last_chunk` for the final chunk only.
    pub fn next(&mut self, last_chunk: bool) -> Result<[u8; FILE_CHUNK_NONCE_LENGTH]> {
        if self.last_chunk_reached {
            return Err(CryptoError::LastChunkReached);
        }
        let counter = u32::try_from(self.counter)
            .map_err(|_| CryptoError::CounterExhausted("file chunk"))?;
        self.counter += 1;

        self.nonce[4..8].copy_from_slice(&counter.to_be_bytes());
        if last_chunk {
            self.nonce[11] = 1;
            self.last_chunk_reached = true;
        }
        Ok(self.nonce)
    }
}
