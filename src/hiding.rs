// Packet-hiding configuration: opcode prefixes to leave out of displays and
// dumps, per sending endpoint.
//
// File layout (little-endian):
//
// magic (8) | version (1) | block count (1)
// block: size (4) | endpoint (1) | prefix count (4) | entries
// entry: total length (1) | prefix length (1) | prefix | padding
//
// A block size counts the bytes after the size field. An entry's total length
// counts the bytes after itself; entries are padded to an even size.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::packet::EndpointType;

pub const MAGIC: [u8; 8] = *b"RELAYHID";
pub const FORMAT_VERSION: u8 = 1;
const FIXED_HEADER_LEN: usize = 10;
pub const MAX_PREFIX_LEN: usize = 254;

#[derive(Debug, Error)]
pub enum HidingConfigError {
    #[error("file of {len} bytes is too small to be a hiding config")]
    InsufficientlyLargeFile { len: u64 },
    #[error("unknown file type (magic {})", hex::encode_upper(.magic))]
    UnknownFileType { magic: [u8; 8] },
    #[error("unsupported hiding config version {0}")]
    UnsupportedVersion(u8),
    #[error("damaged hiding config: {0}")]
    DamagedFile(String),
    #[error("prefix of {0} bytes is too long to store")]
    PrefixTooLong(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn damaged(what: impl Into<String>) -> impl FnOnce(io::Error) -> HidingConfigError {
    let what = what.into();
    move |e| HidingConfigError::DamagedFile(format!("{}: {}", what, e))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HidingConfig {
    client: BTreeSet<Vec<u8>>,
    server: BTreeSet<Vec<u8>>,
}

impl HidingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, endpoint: EndpointType) -> &BTreeSet<Vec<u8>> {
        match endpoint {
            EndpointType::Client => &self.client,
            EndpointType::Server => &self.server,
        }
    }

    fn set_mut(&mut self, endpoint: EndpointType) -> &mut BTreeSet<Vec<u8>> {
        match endpoint {
            EndpointType::Client => &mut self.client,
            EndpointType::Server => &mut self.server,
        }
    }

    pub fn hide(&mut self, endpoint: EndpointType, prefix: impl Into<Vec<u8>>) -> bool {
        self.set_mut(endpoint).insert(prefix.into())
    }

    pub fn unhide(&mut self, endpoint: EndpointType, prefix: &[u8]) -> bool {
        self.set_mut(endpoint).remove(prefix)
    }

    pub fn prefixes(&self, endpoint: EndpointType) -> &BTreeSet<Vec<u8>> {
        self.set(endpoint)
    }

    /// Whether a packet from `endpoint` starting with `packet` is hidden.
    pub fn is_hidden(&self, endpoint: EndpointType, packet: &[u8]) -> bool {
        self.set(endpoint).iter().any(|prefix| packet.starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.client.len() + self.server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write<W: Write + Seek>(&self, w: &mut W) -> Result<(), HidingConfigError> {
        w.write_all(&MAGIC)?;
        w.write_u8(FORMAT_VERSION)?;
        w.write_u8(2)?;
        for endpoint in [EndpointType::Client, EndpointType::Server] {
            write_block(w, endpoint, self.set(endpoint))?;
        }
        Ok(())
    }

    pub fn read(data: &[u8]) -> Result<Self, HidingConfigError> {
        let len = data.len() as u64;
        if data.len() < FIXED_HEADER_LEN {
            return Err(HidingConfigError::InsufficientlyLargeFile { len });
        }
        let mut r = Cursor::new(data);
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(HidingConfigError::UnknownFileType { magic });
        }
        let version = r.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(HidingConfigError::UnsupportedVersion(version));
        }
        let blocks = r.read_u8()?;

        let mut config = HidingConfig::new();
        for index in 0..blocks {
            let size = r.read_u32::<LittleEndian>().map_err(damaged(format!("block {} size", index)))? as usize;
            let start = r.position() as usize;
            let block = data.get(start..start + size).ok_or_else(|| {
                HidingConfigError::DamagedFile(format!("block {} of {} bytes exceeds file size {}", index, size, len))
            })?;
            r.set_position((start + size) as u64);

            let mut block = Cursor::new(block);
            let code = block.read_u8().map_err(damaged(format!("block {} endpoint", index)))?;
            let Some(endpoint) = EndpointType::from_u8(code) else {
                warn!(block = index, endpoint = code, "Skipping hiding block for unknown endpoint type");
                continue;
            };
            let count = block.read_u32::<LittleEndian>().map_err(damaged(format!("block {} count", index)))?;
            let set = config.set_mut(endpoint);
            for entry in 0..count {
                let context = format!("block {} entry {}", index, entry);
                let total = usize::from(block.read_u8().map_err(damaged(context.clone()))?);
                let mut body = vec![0u8; total];
                block.read_exact(&mut body).map_err(damaged(context.clone()))?;
                let prefix_len = usize::from(*body.first().ok_or_else(|| {
                    HidingConfigError::DamagedFile(format!("{}: empty entry", context))
                })?);
                let prefix = body.get(1..1 + prefix_len).ok_or_else(|| {
                    HidingConfigError::DamagedFile(format!(
                        "{}: prefix of {} bytes in an entry of {}",
                        context, prefix_len, total
                    ))
                })?;
                set.insert(prefix.to_vec());
            }
        }
        debug!(client = config.client.len(), server = config.server.len(), "Loaded hiding config");
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, HidingConfigError> {
        Self::read(&std::fs::read(path)?)
    }

    /// Writes the config to `path`. Nothing is left behind if writing fails.
    pub fn save(&self, path: &Path) -> Result<(), HidingConfigError> {
        let guard = PartialFile::new(path);
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(&mut writer)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        guard.commit();
        Ok(())
    }
}

fn write_block<W: Write + Seek>(
    w: &mut W,
    endpoint: EndpointType,
    prefixes: &BTreeSet<Vec<u8>>,
) -> Result<(), HidingConfigError> {
    let size_at = w.stream_position()?;
    w.write_u32::<LittleEndian>(0)?;
    w.write_u8(endpoint.as_u8())?;
    w.write_u32::<LittleEndian>(prefixes.len() as u32)?;
    for prefix in prefixes {
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(HidingConfigError::PrefixTooLong(prefix.len()));
        }
        let padding = prefix.len() % 2;
        w.write_u8((1 + prefix.len() + padding) as u8)?;
        w.write_u8(prefix.len() as u8)?;
        w.write_all(prefix)?;
        w.write_all(&[0u8; 1][..padding])?;
    }
    let end = w.stream_position()?;
    w.seek(SeekFrom::Start(size_at))?;
    w.write_u32::<LittleEndian>((end - size_at - 4) as u32)?;
    w.seek(SeekFrom::Start(end))?;
    Ok(())
}

/// Removes the file on drop unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Could not remove partial hiding config");
                }
            }
        }
    }
}
