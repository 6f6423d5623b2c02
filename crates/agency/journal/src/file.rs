//! Single-file journal keeper.
//!
//! File format: `[magic:4][version:2][reserved:2][frames...]`
//! Frame format: `[length:4][sequence:8][entry_json:N][crc32:4]`

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entry::JournalEntry;
use crate::error::JournalError;
use crate::keeper::JournalKeeper;
use crate::registry::RecorderRegistry;

/// Journal magic bytes: "AGJL" (AGency JournaL)
const JOURNAL_MAGIC: [u8; 4] = [b'A', b'G', b'J', b'L'];
const JOURNAL_VERSION: u16 = 1;
/// magic(4) + version(2) + reserved(2)
const HEADER_SIZE: usize = 8;
/// length(4) + sequence(8) + crc32(4)
const FRAME_OVERHEAD: usize = 16;

/// When appended frames are forced to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every entry
    #[default]
    Immediate,
    /// flush userspace buffers only
    Flush,
    /// leave it to the OS
    OsManaged,
}

/// Result of checking every frame's checksum and encoding.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub total_entries: u64,
    pub verified_entries: u64,
    pub corrupted_entries: u64,
    pub corrupted_offsets: Vec<u64>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted_entries == 0
    }
}

struct RawFrame {
    offset: u64,
    sequence: u64,
    bytes: Vec<u8>,
    crc: u32,
}

struct Writer {
    file: File,
    sequence: u64,
}

pub struct FileJournal {
    path: PathBuf,
    sync_mode: SyncMode,
    writer: Mutex<Writer>,
    registry: RecorderRegistry,
}

impl FileJournal {
    /// Opens the journal at `path`, creating it if missing. Appending
    /// continues after the last readable frame.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let existing = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let sequence = if existing.is_empty() {
            write_header(&mut file)?;
            0
        } else {
            check_header(&existing)?;
            let frames = parse_frames(&existing);
            let end = frames
                .last()
                .map(|f| f.offset as usize + FRAME_OVERHEAD + f.bytes.len())
                .unwrap_or(HEADER_SIZE);
            if end < existing.len() {
                warn!(
                    path = %path.display(),
                    dropped = existing.len() - end,
                    "Truncating incomplete journal tail"
                );
                file.set_len(end as u64)?;
            }
            frames.iter().map(|f| f.sequence).max().unwrap_or(0)
        };

        info!(path = %path.display(), sequence, "Journal opened");
        Ok(Self {
            path,
            sync_mode,
            writer: Mutex::new(Writer { file, sequence }),
            registry: RecorderRegistry::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn latest_sequence(&self) -> u64 {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sequence
    }

    fn append(&self, bytes: &[u8]) -> Result<u64, JournalError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = writer.sequence + 1;
        let length = u32::try_from(bytes.len()).map_err(|_| JournalError::Corruption {
            offset: 0,
            reason: format!("entry of {} bytes does not fit a frame", bytes.len()),
        })?;

        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + bytes.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(bytes);
        frame.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());

        writer.file.write_all(&frame)?;
        match self.sync_mode {
            SyncMode::Immediate => writer.file.sync_all()?,
            SyncMode::Flush => writer.file.flush()?,
            SyncMode::OsManaged => {}
        }
        writer.sequence = sequence;
        Ok(sequence)
    }

    fn read_frames(&self) -> Result<Vec<RawFrame>, JournalError> {
        {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.file.flush()?;
        }
        let bytes = std::fs::read(&self.path)?;
        check_header(&bytes)?;
        Ok(parse_frames(&bytes))
    }

    /// Feeds every readable entry to `handler` in write order.
    pub fn replay<F>(&self, mut handler: F) -> Result<u64, JournalError>
    where
        F: FnMut(u64, JournalEntry) -> Result<(), JournalError>,
    {
        let mut count = 0u64;
        for (sequence, entry) in self.decode_frames()? {
            handler(sequence, entry)?;
            count += 1;
        }
        info!(replayed = count, "Journal replay complete");
        Ok(count)
    }

    /// Checks every frame's CRC32 and JSON encoding.
    pub fn verify_integrity(&self) -> Result<IntegrityReport, JournalError> {
        let mut report = IntegrityReport::default();
        for frame in self.read_frames()? {
            report.total_entries += 1;
            let intact = crc32fast::hash(&frame.bytes) == frame.crc
                && serde_json::from_slice::<JournalEntry>(&frame.bytes).is_ok();
            if intact {
                report.verified_entries += 1;
            } else {
                report.corrupted_entries += 1;
                report.corrupted_offsets.push(frame.offset);
            }
        }
        Ok(report)
    }

    fn decode_frames(&self) -> Result<Vec<(u64, JournalEntry)>, JournalError> {
        let mut entries = Vec::new();
        for frame in self.read_frames()? {
            if crc32fast::hash(&frame.bytes) != frame.crc {
                warn!(
                    sequence = frame.sequence,
                    offset = frame.offset,
                    "CRC mismatch, skipping corrupted entry"
                );
                continue;
            }
            match serde_json::from_slice::<JournalEntry>(&frame.bytes) {
                Ok(entry) => entries.push((frame.sequence, entry)),
                Err(e) => warn!(
                    sequence = frame.sequence,
                    error = %e,
                    "Failed to decode journal entry, skipping"
                ),
            }
        }
        Ok(entries)
    }
}

impl JournalKeeper for FileJournal {
    fn write_entry(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let bytes = serde_json::to_vec(entry)?;
        let sequence = self.append(&bytes)?;
        debug!(
            sequence,
            instance_id = %entry.instance_id,
            entry_id = %entry.entry_id,
            "Journal entry appended"
        );
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self
            .decode_frames()?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn registry(&self) -> &RecorderRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("path", &self.path)
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}

fn write_header(file: &mut File) -> Result<(), JournalError> {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&JOURNAL_MAGIC);
    header[4..6].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    file.write_all(&header)?;
    file.flush()?;
    Ok(())
}

fn check_header(bytes: &[u8]) -> Result<(), JournalError> {
    if bytes.len() < HEADER_SIZE || bytes[..4] != JOURNAL_MAGIC {
        return Err(JournalError::Corruption {
            offset: 0,
            reason: "invalid journal header".to_string(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Splits the body into frames, stopping at the first truncated one.
fn parse_frames(bytes: &[u8]) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos + FRAME_OVERHEAD <= bytes.len() {
        let length = read_u32(bytes, pos) as usize;
        let sequence = read_u64(bytes, pos + 4);
        let body = pos + 12;
        if length == 0 || body + length + 4 > bytes.len() {
            break;
        }
        frames.push(RawFrame {
            offset: pos as u64,
            sequence,
            bytes: bytes[body..body + length].to_vec(),
            crc: read_u32(bytes, body + length),
        });
        pos = body + length + 4;
    }
    frames
}
