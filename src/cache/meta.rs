use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::types::{PartitionId, SequenceNumber};

const META_MAGIC: [u8; 4] = *b"PCMD";
const META_FORMAT_VERSION: u16 = 1;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_VERSION: Range<usize> = 4..6;
const META_RESERVED: Range<usize> = 6..8;
const META_PARTITION: Range<usize> = 8..12;
const META_VECTOR_LEN: Range<usize> = 12..16;
const META_LAST_CHECKPOINT: Range<usize> = 16..24;
const META_HDR_LEN: usize = 24;
const META_CRC_LEN: usize = 4;

/// Durable record persisted with every checkpoint and read once at recovery.
///
/// The deduplication vector is opaque to the cache: it is indexed by source
/// partition and interpreted by the orchestration layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetaData {
    /// Partition this record belongs to.
    pub partition_id: PartitionId,
    /// Sequence number of the checkpoint that wrote this record.
    pub last_checkpoint_id: SequenceNumber,
    /// Per-source-partition deduplication positions.
    pub dedup_vector: Vec<u64>,
}

impl PartitionMetaData {
    /// Metadata for a partition that has never checkpointed.
    pub fn initial(partition_id: PartitionId, dedup_vector_len: usize) -> Self {
        Self {
            partition_id,
            last_checkpoint_id: SequenceNumber(0),
            dedup_vector: vec![0; dedup_vector_len],
        }
    }

    /// Size of the encoded record in bytes.
    pub fn encoded_len(&self) -> usize {
        META_HDR_LEN + self.dedup_vector.len() * 8 + META_CRC_LEN
    }

    /// Encodes the record with a trailing CRC32.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let vector_len: u32 = self
            .dedup_vector
            .len()
            .try_into()
            .map_err(|_| CacheError::Invalid("deduplication vector too long".into()))?;
        let mut buf = vec![0u8; self.encoded_len()];
        buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
        buf[META_VERSION].copy_from_slice(&META_FORMAT_VERSION.to_be_bytes());
        buf[META_RESERVED].fill(0);
        buf[META_PARTITION].copy_from_slice(&self.partition_id.0.to_be_bytes());
        buf[META_VECTOR_LEN].copy_from_slice(&vector_len.to_be_bytes());
        buf[META_LAST_CHECKPOINT].copy_from_slice(&self.last_checkpoint_id.0.to_be_bytes());
        for (idx, position) in self.dedup_vector.iter().enumerate() {
            let start = META_HDR_LEN + idx * 8;
            buf[start..start + 8].copy_from_slice(&position.to_be_bytes());
        }
        let body_len = buf.len() - META_CRC_LEN;
        let crc = crc32fast::hash(&buf[..body_len]);
        buf[body_len..].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Decodes and verifies a record produced by [`PartitionMetaData::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_HDR_LEN + META_CRC_LEN {
            return Err(CacheError::Corruption("partition metadata truncated"));
        }
        if buf[META_MAGIC_RANGE] != META_MAGIC {
            return Err(CacheError::Corruption("partition metadata has bad magic"));
        }
        if read_u16(buf, META_VERSION)? != META_FORMAT_VERSION {
            return Err(CacheError::Corruption(
                "partition metadata has unsupported version",
            ));
        }
        if buf[META_RESERVED].iter().any(|b| *b != 0) {
            return Err(CacheError::Corruption(
                "partition metadata reserved field non-zero",
            ));
        }
        let vector_len = read_u32(buf, META_VECTOR_LEN)? as usize;
        if buf.len() != META_HDR_LEN + vector_len * 8 + META_CRC_LEN {
            return Err(CacheError::Corruption("partition metadata length mismatch"));
        }
        let body_len = buf.len() - META_CRC_LEN;
        let stored = read_u32(buf, body_len..buf.len())?;
        if crc32fast::hash(&buf[..body_len]) != stored {
            return Err(CacheError::Corruption("partition metadata crc mismatch"));
        }
        let partition_id = PartitionId(read_u32(buf, META_PARTITION)?);
        let last_checkpoint_id = SequenceNumber(read_u64(buf, META_LAST_CHECKPOINT)?);
        let mut dedup_vector = Vec::with_capacity(vector_len);
        for idx in 0..vector_len {
            let start = META_HDR_LEN + idx * 8;
            dedup_vector.push(read_u64(buf, start..start + 8)?);
        }
        Ok(Self {
            partition_id,
            last_checkpoint_id,
            dedup_vector,
        })
    }
}

fn read_u16(buf: &[u8], range: Range<usize>) -> Result<u16> {
    let bytes = buf[range]
        .try_into()
        .map_err(|_| CacheError::Corruption("partition metadata field truncated"))?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32(buf: &[u8], range: Range<usize>) -> Result<u32> {
    let bytes = buf[range]
        .try_into()
        .map_err(|_| CacheError::Corruption("partition metadata field truncated"))?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &[u8], range: Range<usize>) -> Result<u64> {
    let bytes = buf[range]
        .try_into()
        .map_err(|_| CacheError::Corruption("partition metadata field truncated"))?;
    Ok(u64::from_be_bytes(bytes))
}

impl fmt::Display for PartitionMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PartitionMetaData(partition={}, last_checkpoint_id={}, dedup_len={})",
            self.partition_id,
            self.last_checkpoint_id,
            self.dedup_vector.len()
        )
    }
}
