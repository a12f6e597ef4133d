//! Fixed-size profile record
//!
//! Layout:
//! - bytes `[0, 128)`: header, with a little-endian u16 checksum at offset 32
//! - bytes `[128, RECORD_LEN)`: payload covered by the checksum
//!
//! The checksum is CRC-16 (poly 0x1021, init 0, no reflection, no final XOR)
//! computed a nibble at a time from a 16-entry table.

use crate::error::{Error, Result};

/// Total size of a record on the card
pub const RECORD_LEN: usize = 23_004;

/// Bytes before the checksummed payload
pub const HEADER_LEN: usize = 128;

/// Offset of the checksum inside the header
pub const CHECKSUM_OFFSET: usize = 32;

/// Width of the checksum field
pub const CHECKSUM_LEN: usize = 2;

/// File extension of records on the card
pub const RECORD_EXTENSION: &str = ".rt4";

const NIBBLE_TABLE: [u16; 16] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7, 0x8108, 0x9129, 0xa14a,
    0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
];

/// Checksum over `data`, two table lookups per byte
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let crc = NIBBLE_TABLE[usize::from((crc >> 12) ^ u16::from(byte >> 4)) & 0x0F] ^ (crc << 4);
        NIBBLE_TABLE[usize::from((crc >> 12) ^ u16::from(byte)) & 0x0F] ^ (crc << 4)
    })
}

/// A profile record held in memory for patching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    data: Vec<u8>,
}

impl Record {
    /// Wrap raw bytes read off the card
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() != RECORD_LEN {
            return Err(Error::InvalidArgument(format!(
                "Record must be exactly {} bytes, got {}",
                RECORD_LEN,
                data.len()
            )));
        }
        Ok(Record { data })
    }

    pub fn header(&self) -> &[u8] {
        &self.data[..HEADER_LEN]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    /// Checksum currently stored in the header
    pub fn stored_checksum(&self) -> u16 {
        u16::from_le_bytes([self.data[CHECKSUM_OFFSET], self.data[CHECKSUM_OFFSET + 1]])
    }

    /// Checksum the payload should carry
    pub fn compute_checksum(&self) -> u16 {
        crc16(self.payload())
    }

    pub fn checksum_valid(&self) -> bool {
        self.stored_checksum() == self.compute_checksum()
    }

    /// Overwrite `bytes.len()` bytes starting at `offset`
    ///
    /// The checksum is left stale until [`Record::save`].
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Patch of {} bytes at {} exceeds record length {}",
                    bytes.len(),
                    offset,
                    self.data.len()
                ))
            })?;

        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Stamp the payload checksum into the header and return the full record
    pub fn save(&mut self) -> &[u8] {
        let checksum = self.compute_checksum().to_le_bytes();
        self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].copy_from_slice(&checksum);
        &self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
