// Wire format for log records
// Each record is framed as [ length: u32 | frame payload | crc64: u64 ].
// The payload is the bincode encoding of RecordFrame; the checksum covers
// the length prefix and the payload so a torn length cannot validate.

use super::{LogRecord, Lsn, Psn, RecordBody, RecordKind};
use crate::error::{ReplicatorError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Length prefix plus trailing checksum.
pub const FRAME_OVERHEAD: u64 = 4 + 8;

/// A frame can carry at most u32::MAX payload bytes; a record whose
/// serialized size reaches this is flushed in its own block.
pub const MAX_FRAME_PAYLOAD: u64 = u32::MAX as u64;

/// The serializable view of a record: everything a reader needs to
/// reconstruct it. Position and linked pointers are rebuilt on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFrame {
    pub kind: RecordKind,
    pub lsn: Lsn,
    pub psn: Psn,
    pub previous_physical_psn: u64,
    pub body: RecordBody,
}

impl RecordFrame {
    pub fn from_record(record: &LogRecord) -> Self {
        Self {
            kind: record.kind(),
            lsn: record.lsn(),
            psn: record.psn(),
            previous_physical_psn: record
                .previous_physical_psn()
                .unwrap_or(super::UNASSIGNED),
            body: record.body().clone(),
        }
    }
}

/// Serialize a record into a framed block.
pub fn encode_record(record: &LogRecord) -> Result<Vec<u8>> {
    let frame = RecordFrame::from_record(record);
    let payload = bincode::serde::encode_to_vec(&frame, bincode::config::standard())?;

    if payload.len() as u64 > MAX_FRAME_PAYLOAD {
        return Err(ReplicatorError::OperationTooLarge(payload.len() as u64));
    }

    let mut block = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    block.extend_from_slice(&payload);
    let checksum = crc64(&block);
    block.extend_from_slice(&checksum.to_le_bytes());
    Ok(block)
}

/// Decode one framed record from the front of `buf`.
/// Returns the frame and the number of bytes consumed.
pub fn decode_record(buf: &[u8]) -> Result<(RecordFrame, usize)> {
    if buf.len() < FRAME_OVERHEAD as usize {
        return Err(ReplicatorError::Corruption(format!(
            "truncated frame: {} bytes",
            buf.len()
        )));
    }

    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + payload_len + 8;
    if buf.len() < total {
        return Err(ReplicatorError::Corruption(format!(
            "frame length {} exceeds available {} bytes",
            total,
            buf.len()
        )));
    }

    let stored = u64::from_le_bytes(
        buf[4 + payload_len..total]
            .try_into()
            .map_err(|_| ReplicatorError::Corruption("bad checksum slice".to_string()))?,
    );
    let computed = crc64(&buf[..4 + payload_len]);
    if stored != computed {
        return Err(ReplicatorError::Corruption(format!(
            "frame checksum mismatch: stored {:#x}, computed {:#x}",
            stored, computed
        )));
    }

    let (frame, _) = bincode::serde::decode_from_slice::<RecordFrame, _>(
        &buf[4..4 + payload_len],
        bincode::config::standard(),
    )?;
    Ok((frame, total))
}

/// Read one framed record from a reader. Returns None at clean EOF.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<RecordFrame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    let mut rest = vec![0u8; payload_len + 8];
    reader.read_exact(&mut rest)?;

    let mut block = Vec::with_capacity(4 + payload_len + 8);
    block.extend_from_slice(&len_bytes);
    block.extend_from_slice(&rest);
    let (frame, _) = decode_record(&block)?;
    Ok(Some(frame))
}

/// Serialize just the record body for replication. The transport owns
/// transit integrity; LSN travels as the operation sequence number and
/// PSNs are per-replica, so neither is part of the payload.
pub fn encode_operation_payload(body: &RecordBody) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        body,
        bincode::config::standard(),
    )?)
}

pub fn decode_operation_payload(bytes: &[u8]) -> Result<RecordBody> {
    let (body, _) =
        bincode::serde::decode_from_slice::<RecordBody, _>(bytes, bincode::config::standard())?;
    Ok(body)
}

// CRC-64 (ECMA-182 polynomial, reflected) with a const-generated table.

const fn generate_crc64_table() -> [u64; 256] {
    // Reflected form of the ECMA-182 polynomial 0x42F0E1EBA9EA3693
    let poly: u64 = 0xC96C_5795_D787_0F42;
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = generate_crc64_table();

/// CRC-64 over a byte slice.
pub fn crc64(data: &[u8]) -> u64 {
    crc64_update(u64::MAX, data) ^ u64::MAX
}

/// Incremental CRC-64: feed successive buffers with the running state
/// (seed with u64::MAX, finish by xor with u64::MAX).
pub fn crc64_update(state: u64, data: &[u8]) -> u64 {
    let mut crc = state;
    for &byte in data {
        let index = ((crc ^ byte as u64) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC64_TABLE[index];
    }
    crc
}

/// Streaming CRC-64 helper for multi-buffer blocks.
#[derive(Debug, Clone, Copy)]
pub struct Crc64 {
    state: u64,
}

impl Crc64 {
    pub fn new() -> Self {
        Self { state: u64::MAX }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = crc64_update(self.state, data);
    }

    pub fn finish(&self) -> u64 {
        self.state ^ u64::MAX
    }
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}
