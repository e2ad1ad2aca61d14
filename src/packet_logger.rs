// Packet log files
//
// Layout (little-endian):
//   magic (8) | version (1) | header size (4) | footer size (4)
//   header (bincode LogHeader)
//   records: [u32 length][bincode PacketEntry] ...
//   footer (bincode LogFooter)
//
// A log is created with the TMP magic and a zero footer size; finish() appends
// the footer and patches both fields. A file still carrying the TMP magic was
// cut short (crash, kill) and is read up to its last complete record.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::interception::{PacketListener, PacketOutcome};
use crate::packet::EndpointType;
use crate::template::ProtocolVersion;
use crate::work::WorkQueue;

pub const MAGIC_COMPLETE: [u8; 8] = *b"RELAYLOG";
pub const MAGIC_TRUNCATED: [u8; 8] = *b"RELAYTMP";
pub const FORMAT_VERSION: u8 = 1;
/// Magic, version and the two block sizes.
pub const FIXED_HEADER_LEN: usize = 17;
const FOOTER_SIZE_OFFSET: u64 = 13;
// Records larger than this are taken as corruption
const MAX_RECORD_LEN: usize = 10_000_000;

#[derive(Debug, Error)]
pub enum LogFileError {
    #[error("file of {len} bytes is too small to be a packet log")]
    InsufficientlyLargeFile { len: u64 },
    #[error("unknown file type (magic {})", hex::encode_upper(.magic))]
    UnknownFileType { magic: [u8; 8] },
    #[error("damaged packet log: {0}")]
    DamagedFile(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHeader {
    pub session_id: Uuid,
    pub protocol_version: ProtocolVersion,
    /// Milliseconds since the epoch.
    pub started_at: i64,
    pub client_addr: String,
    pub upstream_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFooter {
    pub packet_count: u64,
    pub ended_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketEntry {
    pub timestamp: i64,
    pub endpoint: EndpointType,
    /// Absent for injected packets
    pub received: Option<Vec<u8>>,
    /// Absent for dropped packets
    pub sent: Option<Vec<u8>>,
}

impl PacketEntry {
    pub fn from_outcome(outcome: &PacketOutcome) -> Self {
        Self {
            timestamp: outcome.arrived_at.timestamp_millis(),
            endpoint: outcome.endpoint,
            received: outcome.received.as_ref().map(|b| b.to_vec()),
            sent: outcome.sent.as_ref().map(|b| b.to_vec()),
        }
    }

    /// The bytes worth decoding: what was received, or what was sent for injections.
    pub fn data(&self) -> &[u8] {
        self.received.as_deref().or(self.sent.as_deref()).unwrap_or(&[])
    }
}

pub struct PacketLogger {
    session_id: Uuid,
    log_path: PathBuf,
    writer: Option<BufWriter<File>>,
    packet_count: u64,
}

impl PacketLogger {
    pub fn new(header: &LogHeader, log_dir: impl AsRef<Path>) -> Result<Self, LogFileError> {
        let log_dir = log_dir.as_ref();

        // Create log directory if it doesn't exist
        std::fs::create_dir_all(log_dir)?;

        // logs/<session_id>.bin
        let log_path = log_dir.join(format!("{}.bin", header.session_id));
        let mut writer = BufWriter::new(File::create(&log_path)?);

        let header_bytes = bincode::serialize(header)?;
        writer.write_all(&MAGIC_TRUNCATED)?;
        writer.write_all(&[FORMAT_VERSION])?;
        writer.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&header_bytes)?;
        writer.flush()?;

        Ok(Self {
            session_id: header.session_id,
            log_path,
            writer: Some(writer),
            packet_count: 0,
        })
    }

    pub fn log_packet(&mut self, entry: &PacketEntry) -> Result<(), LogFileError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "packet log already finished"))?;

        // Length first so entries can be read back one by one
        let serialized = bincode::serialize(entry)?;
        writer.write_all(&(serialized.len() as u32).to_le_bytes())?;
        writer.write_all(&serialized)?;
        writer.flush()?;
        self.packet_count += 1;
        Ok(())
    }

    /// Writes the footer and marks the log complete.
    pub fn finish(mut self) -> Result<PathBuf, LogFileError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(self.log_path.clone());
        };
        let footer = bincode::serialize(&LogFooter {
            packet_count: self.packet_count,
            ended_at: Utc::now().timestamp_millis(),
        })?;
        writer.write_all(&footer)?;
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;

        file.seek(SeekFrom::Start(FOOTER_SIZE_OFFSET))?;
        file.write_all(&(footer.len() as u32).to_le_bytes())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&MAGIC_COMPLETE)?;
        file.sync_all()?;
        Ok(self.log_path.clone())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }
}

impl Drop for PacketLogger {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                error!("Error flushing log file {}: {}", self.log_path.display(), e);
            }
        }
    }
}

/// Fully parsed packet log.
#[derive(Debug, Clone)]
pub struct PacketLog {
    pub header: LogHeader,
    /// Absent when the log was not finished.
    pub footer: Option<LogFooter>,
    pub entries: Vec<PacketEntry>,
}

impl PacketLog {
    pub fn open(path: &Path) -> Result<Self, LogFileError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    pub fn is_complete(&self) -> bool {
        self.footer.is_some()
    }

    pub fn parse(data: &[u8]) -> Result<Self, LogFileError> {
        let len = data.len() as u64;
        if data.len() <= MAGIC_COMPLETE.len() {
            return Err(LogFileError::InsufficientlyLargeFile { len });
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[..8]);
        let complete = match magic {
            MAGIC_COMPLETE => true,
            MAGIC_TRUNCATED => false,
            _ => return Err(LogFileError::UnknownFileType { magic }),
        };
        if data.len() < FIXED_HEADER_LEN {
            return Err(LogFileError::InsufficientlyLargeFile { len });
        }
        if data[8] != FORMAT_VERSION {
            return Err(LogFileError::DamagedFile(format!("unsupported version {}", data[8])));
        }
        let header_size = LittleEndian::read_u32(&data[9..13]) as usize;
        let footer_size = LittleEndian::read_u32(&data[13..17]) as usize;

        let records_start = FIXED_HEADER_LEN + header_size;
        if records_start > data.len() {
            return Err(LogFileError::DamagedFile(format!(
                "header of {} bytes exceeds file size {}",
                header_size, len
            )));
        }
        let header: LogHeader = bincode::deserialize(&data[FIXED_HEADER_LEN..records_start])
            .map_err(|e| LogFileError::DamagedFile(format!("unreadable header: {}", e)))?;

        let records_end = if complete {
            data.len()
                .checked_sub(footer_size)
                .filter(|end| *end >= records_start)
                .ok_or_else(|| {
                    LogFileError::DamagedFile(format!("footer of {} bytes overlaps the header", footer_size))
                })?
        } else {
            data.len()
        };
        let footer = if complete {
            Some(
                bincode::deserialize::<LogFooter>(&data[records_end..])
                    .map_err(|e| LogFileError::DamagedFile(format!("unreadable footer: {}", e)))?,
            )
        } else {
            None
        };

        let entries = read_records(&data[records_start..records_end], complete)?;
        if let Some(footer) = &footer {
            if footer.packet_count != entries.len() as u64 {
                return Err(LogFileError::DamagedFile(format!(
                    "footer counts {} packets, found {}",
                    footer.packet_count,
                    entries.len()
                )));
            }
        }
        Ok(Self { header, footer, entries })
    }
}

fn read_records(mut data: &[u8], complete: bool) -> Result<Vec<PacketEntry>, LogFileError> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let record = if data.len() < 4 {
            None
        } else {
            let record_len = LittleEndian::read_u32(&data[..4]) as usize;
            if record_len == 0 || record_len > MAX_RECORD_LEN {
                return Err(LogFileError::DamagedFile(format!(
                    "record {} has invalid length {}",
                    entries.len(),
                    record_len
                )));
            }
            data.get(4..4 + record_len)
        };
        let Some(record) = record else {
            if complete {
                return Err(LogFileError::DamagedFile(format!("record {} is cut short", entries.len())));
            }
            warn!(records = entries.len(), trailing = data.len(), "Truncated packet log, dropping partial record");
            break;
        };
        let entry = bincode::deserialize(record)
            .map_err(|e| LogFileError::DamagedFile(format!("record {}: {}", entries.len(), e)))?;
        entries.push(entry);
        data = &data[4 + record.len()..];
    }
    Ok(entries)
}

/// Writes every outcome to a packet log from the work queue.
pub struct PacketLogListener {
    logger: Arc<Mutex<Option<PacketLogger>>>,
    queue: Arc<WorkQueue>,
}

impl PacketLogListener {
    pub fn new(logger: PacketLogger, queue: Arc<WorkQueue>) -> Self {
        Self {
            logger: Arc::new(Mutex::new(Some(logger))),
            queue,
        }
    }

    /// Waits for pending writes and completes the log.
    pub fn finish(&self, timeout: Duration) -> Result<Option<PathBuf>, LogFileError> {
        if !self.queue.flush(timeout) {
            warn!("Timed out waiting for pending log writes");
        }
        match self.logger.lock().take() {
            Some(logger) => logger.finish().map(Some),
            None => Ok(None),
        }
    }
}

impl PacketListener for PacketLogListener {
    fn on_outcome(&self, outcome: &PacketOutcome) {
        let entry = PacketEntry::from_outcome(outcome);
        let logger = Arc::clone(&self.logger);
        self.queue.submit(move |_| {
            if let Some(logger) = logger.lock().as_mut() {
                if let Err(e) = logger.log_packet(&entry) {
                    error!("Failed to log packet: {}", e);
                }
            }
        });
    }
}
