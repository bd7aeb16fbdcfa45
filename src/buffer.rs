use std::io::{Read, Write};

use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::config::BufferingOptions;

/// Scratch store for an inbound replication or snapshot payload.
///
/// Decouples network reception from log fsync latency: the payload is fully
/// received into the buffer, the transport stream is released, and the log
/// store consumes the bytes afterwards. Short payloads stay in memory;
/// long ones go to a temp file that is deleted on drop.
#[derive(Debug)]
pub enum ScratchBuffer {
    Memory(Bytes),
    File { file: NamedTempFile, len: usize },
}

impl ScratchBuffer {
    /// Stages `payload` according to the buffering policy.
    pub async fn stage(payload: Bytes, options: &BufferingOptions) -> std::io::Result<Self> {
        if payload.len() < options.memory_threshold {
            return Ok(Self::Memory(payload));
        }
        let len = payload.len();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            let mut file = NamedTempFile::new()?;
            file.write_all(&payload)?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| std::io::Error::other(e))??;
        Ok(Self::File { file, len })
    }

    /// Reads the staged payload back out, consuming the buffer. The backing
    /// temp file is removed when the buffer drops.
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        match self {
            Self::Memory(bytes) => Ok(bytes),
            Self::File { file, len } => {
                tokio::task::spawn_blocking(move || -> std::io::Result<Bytes> {
                    let mut data = Vec::with_capacity(len);
                    file.reopen()?.read_to_end(&mut data)?;
                    Ok(Bytes::from(data))
                })
                .await
                .map_err(|e| std::io::Error::other(e))?
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Memory(bytes) => bytes.len(),
            Self::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_payload_stays_in_memory() {
        let options = BufferingOptions {
            memory_threshold: 1024,
        };
        let buffer = ScratchBuffer::stage(Bytes::from_static(b"short"), &options)
            .await
            .unwrap();
        assert!(matches!(buffer, ScratchBuffer::Memory(_)));
        assert_eq!(buffer.into_bytes().await.unwrap(), Bytes::from_static(b"short"));
    }

    #[tokio::test]
    async fn test_large_payload_spills_to_file() {
        let options = BufferingOptions {
            memory_threshold: 16,
        };
        let payload = Bytes::from(vec![0xABu8; 1024]);
        let buffer = ScratchBuffer::stage(payload.clone(), &options).await.unwrap();
        assert!(matches!(buffer, ScratchBuffer::File { .. }));
        assert_eq!(buffer.len(), 1024);
        assert_eq!(buffer.into_bytes().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let options = BufferingOptions {
            memory_threshold: 8,
        };
        // Exactly at the threshold spills
        let buffer = ScratchBuffer::stage(Bytes::from(vec![1u8; 8]), &options)
            .await
            .unwrap();
        assert!(matches!(buffer, ScratchBuffer::File { .. }));
    }
}
