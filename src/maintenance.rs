//! Bulk record patching
//!
//! Writes the same bytes at the same offset into every record on the card.
//! Records that already hold the value are skipped without a rewrite, since
//! recomputing the checksum and writing 23 KB back is the slow part.

use crate::error::{Error, Result};
use crate::record::{Record, CHECKSUM_LEN, CHECKSUM_OFFSET, RECORD_EXTENSION, RECORD_LEN};
use crate::storage::Storage;
use std::time::Instant;
use tracing::{error, info};

/// Validated patch: `value` goes at `address` in every record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    pub address: usize,
    pub value: Vec<u8>,
}

impl PatchRequest {
    /// Parse form input
    ///
    /// `address` is decimal or `0x`-prefixed hex; `value` is a non-empty hex
    /// string with an even number of digits.
    pub fn parse(address: &str, value: &str) -> Result<Self> {
        let address = address.trim();
        let value = value.trim();

        if address.is_empty() {
            return Err(Error::InvalidArgument("Invalid address provided.".to_string()));
        }
        let parsed = match address
            .strip_prefix("0x")
            .or_else(|| address.strip_prefix("0X"))
        {
            Some(hex_digits) => usize::from_str_radix(hex_digits, 16),
            None => address.parse::<usize>(),
        }
        .map_err(|_| Error::InvalidArgument(format!("Invalid address provided: {}", address)))?;

        if value.is_empty() {
            return Err(Error::InvalidArgument("Invalid value provided.".to_string()));
        }
        let bytes = hex::decode(value.replace(' ', ""))
            .map_err(|e| Error::InvalidArgument(format!("Invalid value provided: {}", e)))?;

        let request = PatchRequest {
            address: parsed,
            value: bytes,
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<()> {
        let end = self
            .address
            .checked_add(self.value.len())
            .filter(|&end| end <= RECORD_LEN)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Patch of {} bytes at {} runs past the {} byte record",
                    self.value.len(),
                    self.address,
                    RECORD_LEN
                ))
            })?;

        if self.address < CHECKSUM_OFFSET + CHECKSUM_LEN && end > CHECKSUM_OFFSET {
            return Err(Error::InvalidArgument(
                "Patch would overwrite the record checksum".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a bulk patch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkPatchReport {
    pub scanned: usize,
    pub patched: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl BulkPatchReport {
    pub fn summary(&self) -> String {
        format!(
            "Bulk profile edit completed: {} scanned, {} updated, {} already set, {} failed",
            self.scanned, self.patched, self.unchanged, self.failed
        )
    }
}

/// Apply `request` to every record under `root`
pub fn bulk_patch(storage: &Storage, root: &str, request: &PatchRequest) -> Result<BulkPatchReport> {
    let started = Instant::now();
    info!(
        "Writing value {} to address {}",
        hex::encode_upper(&request.value),
        request.address
    );

    let files = storage.list_files_recursive(root, Some(RECORD_EXTENSION))?;
    let mut report = BulkPatchReport {
        scanned: files.len(),
        ..Default::default()
    };

    for file in &files {
        match patch_one(storage, file, request) {
            Ok(true) => report.patched += 1,
            Ok(false) => report.unchanged += 1,
            Err(e) => {
                report.failed += 1;
                error!(path = %file, "Failed to patch record: {}", e);
            }
        }
    }

    info!(
        "{} in {} ms",
        report.summary(),
        started.elapsed().as_millis()
    );
    Ok(report)
}

/// True if the record was rewritten
fn patch_one(storage: &Storage, path: &str, request: &PatchRequest) -> Result<bool> {
    if storage.check_region(path, request.address as u64, &request.value)? {
        return Ok(false);
    }

    let mut record = Record::from_bytes(storage.read_raw(path)?)?;
    record.patch(request.address, &request.value)?;
    storage.write_raw(path, record.save())?;
    Ok(true)
}
