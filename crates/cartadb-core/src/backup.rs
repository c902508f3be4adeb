//! Chunk backup and restore.
//!
//! Dumps a chunk's full history to a file as CRC-framed records and patches
//! them back in order on restore. Restore stops at the first torn or
//! corrupt record so that a partially written tail never poisons the store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crc32fast::Hasher;

use crate::container::ChunkDataContainer;
use crate::error::{CartaError, Result};
use crate::revision::Revision;
use crate::time::LogicalTime;

pub const BACKUP_MAGIC: u32 = 0x43424b31; // CBK1
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Write every revision of the container's history to `path`, ordered per
/// id by modification time.
pub fn store(container: &dyn ChunkDataContainer, path: impl AsRef<Path>) -> Result<usize> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut written = 0usize;
    for (_, history) in container.chunk_history(LogicalTime::sample()) {
        for revision in history {
            let payload = serde_json::to_vec(&*revision)
                .map_err(|e| CartaError::Invariant(format!("revision encode: {e}")))?;
            let mut crc = Hasher::new();
            crc.update(&payload);
            file.write_all(&BACKUP_MAGIC.to_le_bytes())?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&crc.finalize().to_le_bytes())?;
            file.write_all(&payload)?;
            written += 1;
        }
    }
    file.sync_data()?;
    Ok(written)
}

/// Read back every record from `path` and patch it into the container.
/// Returns the number of restored revisions.
pub fn restore(container: &mut dyn ChunkDataContainer, path: impl AsRef<Path>) -> Result<usize> {
    let mut file = File::open(path)?;
    let mut restored = 0usize;
    loop {
        let mut header = [0u8; 12];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CartaError::Io(e)),
        }
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != BACKUP_MAGIC {
            break;
        }
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if len > MAX_RECORD_BYTES {
            break;
        }
        let expected_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());

        let mut payload = vec![0u8; len];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CartaError::Io(e)),
        }
        let mut crc = Hasher::new();
        crc.update(&payload);
        if crc.finalize() != expected_crc {
            break;
        }
        let revision: Revision = serde_json::from_slice(&payload)
            .map_err(|e| CartaError::Invariant(format!("revision decode: {e}")))?;
        container.patch(revision)?;
        restored += 1;
    }
    Ok(restored)
}
