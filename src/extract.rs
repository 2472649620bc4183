// src/extract.rs

//! Single-pass ZIP extraction.
//!
//! Walks the local file headers front to back and streams every entry
//! through a fixed pair of buffers, so memory use does not depend on the
//! size of the archive or of any entry in it. The central directory is
//! never read: the first central-directory or end-of-central-directory
//! signature ends the walk.

use flate2::{Crc, Decompress, FlushDecompress, Status};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
const END_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const ZIP64_MARKER: u32 = 0xFFFF_FFFF;

/// Size of each transfer buffer. Two of them are allocated per extraction.
pub const EXTRACT_BUFFER_SIZE: usize = 256 * 1024;

/// Local header without its 4-byte signature.
const LOCAL_HEADER_REST: usize = 26;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open archive: {0}")]
    Open(#[source] io::Error),
    #[error("read error: {0}")]
    Read(#[source] io::Error),
    #[error("invalid archive: {0}")]
    Format(String),
    #[error("out of memory allocating transfer buffers")]
    Memory,
    #[error("write error on {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("decompression error in {entry}: {reason}")]
    Decompress { entry: String, reason: String },
    #[error("extraction cancelled")]
    Cancelled,
}

/// Parsed local file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHeader {
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalHeader {
    /// Parses the 26 bytes that follow the local header signature.
    pub fn parse(raw: &[u8; LOCAL_HEADER_REST]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at =
            |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        // version(2) flags(2) method(2) time(2) date(2) crc(4) csize(4) usize(4) nlen(2) xlen(2)
        Self {
            flags: u16_at(2),
            method: u16_at(4),
            crc32: u32_at(10),
            compressed_size: u32_at(14),
            uncompressed_size: u32_at(18),
            name_len: u16_at(22),
            extra_len: u16_at(24),
        }
    }
}

/// Totals of a finished extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractSummary {
    pub entries: u32,
    pub bytes: u64,
}

/// `(entry name, bytes extracted so far, total)`. The last call passes `None`.
pub type ExtractProgress<'a> = &'a mut dyn FnMut(Option<&str>, u64, u64);

/// True when the path names a ZIP archive, judged by its extension.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Extracts every entry of `archive` below `dest`.
///
/// Files written before a failure or cancellation are left in place.
pub fn extract_zip(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    progress: ExtractProgress<'_>,
) -> Result<ExtractSummary, ExtractError> {
    let file = File::open(archive).map_err(ExtractError::Open)?;
    let archive_size = file.metadata().map_err(ExtractError::Open)?.len();
    let mut reader = BufReader::new(file);

    let mut in_buf = alloc_buffer()?;
    let mut out_buf = alloc_buffer()?;

    let mut summary = ExtractSummary::default();

    loop {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let signature = match read_signature(&mut reader)? {
            Some(sig) => sig,
            None => break,
        };
        if signature == CENTRAL_DIR_SIG || signature == END_CENTRAL_DIR_SIG {
            break;
        }
        if signature != LOCAL_HEADER_SIG {
            return Err(ExtractError::Format(format!(
                "unexpected signature {:#010x}",
                signature
            )));
        }

        let mut raw = [0u8; LOCAL_HEADER_REST];
        reader.read_exact(&mut raw).map_err(ExtractError::Read)?;
        let header = LocalHeader::parse(&raw);

        let mut name = vec![0u8; header.name_len as usize];
        reader.read_exact(&mut name).map_err(ExtractError::Read)?;
        let name = String::from_utf8_lossy(&name).into_owned();
        skip(&mut reader, header.extra_len as u64)?;

        progress(Some(&name), summary.bytes, archive_size);
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let relative = entry_path(&name)?;
        let target = dest.join(&relative);

        if name.ends_with('/') || name.ends_with('\\') {
            debug!(entry = %name, "creating directory");
            fs::create_dir_all(&target).map_err(|source| ExtractError::Write {
                path: target.clone(),
                source,
            })?;
            skip(&mut reader, header.compressed_size as u64)?;
            continue;
        }

        check_sizes(&name, &header)?;
        if header.method != METHOD_STORED && header.method != METHOD_DEFLATE {
            warn!(entry = %name, method = header.method, "unsupported compression method");
            return Err(ExtractError::Format(format!(
                "unsupported compression method {} for {}",
                header.method, name
            )));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ExtractError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let out = File::create(&target).map_err(|source| ExtractError::Write {
            path: target.clone(),
            source,
        })?;
        let mut out = EntryWriter::new(BufWriter::new(out), &target);

        let base = summary.bytes;
        let mut on_buffer = |written: u64| progress(Some(&name), base + written, archive_size);
        match header.method {
            METHOD_STORED => copy_stored(
                &mut reader,
                &mut out,
                header.compressed_size as u64,
                &mut in_buf,
                cancel,
                &mut on_buffer,
            )?,
            _ => inflate(
                &mut reader,
                &mut out,
                &name,
                header.compressed_size as u64,
                (&mut in_buf[..], &mut out_buf[..]),
                cancel,
                &mut on_buffer,
            )?,
        }
        out.finish()?;

        if out.written != header.uncompressed_size as u64 {
            return Err(ExtractError::Decompress {
                entry: name,
                reason: format!(
                    "expected {} bytes, produced {}",
                    header.uncompressed_size, out.written
                ),
            });
        }
        if out.crc.sum() != header.crc32 {
            return Err(ExtractError::Decompress {
                entry: name,
                reason: "crc32 mismatch".to_string(),
            });
        }

        debug!(entry = %name, bytes = out.written, "extracted");
        summary.entries += 1;
        summary.bytes += out.written;
    }

    progress(None, summary.bytes, summary.bytes);
    Ok(summary)
}

fn alloc_buffer() -> Result<Vec<u8>, ExtractError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(EXTRACT_BUFFER_SIZE)
        .map_err(|_| ExtractError::Memory)?;
    buf.resize(EXTRACT_BUFFER_SIZE, 0);
    Ok(buf)
}

/// Reads the next 4-byte signature. A clean end of file yields `None`.
fn read_signature(reader: &mut impl Read) -> Result<Option<u32>, ExtractError> {
    let mut sig = [0u8; 4];
    let mut filled = 0;
    while filled < sig.len() {
        match reader.read(&mut sig[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ExtractError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated header signature",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ExtractError::Read(e)),
        }
    }
    Ok(Some(u32::from_le_bytes(sig)))
}

fn skip(reader: &mut impl Read, len: u64) -> Result<(), ExtractError> {
    let skipped = io::copy(&mut reader.take(len), &mut io::sink()).map_err(ExtractError::Read)?;
    if skipped != len {
        return Err(ExtractError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "archive ends inside an entry",
        )));
    }
    Ok(())
}

/// Rejects names that would escape the destination folder.
fn entry_path(name: &str) -> Result<PathBuf, ExtractError> {
    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::Format(format!("unsafe entry name {}", name)));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ExtractError::Format("empty entry name".to_string()));
    }
    Ok(relative)
}

fn check_sizes(name: &str, header: &LocalHeader) -> Result<(), ExtractError> {
    if header.compressed_size == ZIP64_MARKER || header.uncompressed_size == ZIP64_MARKER {
        return Err(ExtractError::Format(format!("zip64 entry {} not supported", name)));
    }
    if header.flags & FLAG_DATA_DESCRIPTOR != 0
        && header.compressed_size == 0
        && header.crc32 == 0
        && header.method != METHOD_STORED
    {
        return Err(ExtractError::Format(format!(
            "entry {} has no sizes in its local header",
            name
        )));
    }
    Ok(())
}

/// Output file plus running CRC and byte count.
struct EntryWriter<'p> {
    file: BufWriter<File>,
    path: &'p Path,
    crc: Crc,
    written: u64,
}

impl<'p> EntryWriter<'p> {
    fn new(file: BufWriter<File>, path: &'p Path) -> Self {
        Self {
            file,
            path,
            crc: Crc::new(),
            written: 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ExtractError> {
        self.file.write_all(data).map_err(|source| self.write_error(source))?;
        self.crc.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ExtractError> {
        self.file.flush().map_err(|source| self.write_error(source))
    }

    fn write_error(&self, source: io::Error) -> ExtractError {
        ExtractError::Write {
            path: self.path.to_path_buf(),
            source,
        }
    }
}

/// Copies an uncompressed entry. `on_buffer` hears the entry's byte count
/// after every buffer that is not the last.
fn copy_stored(
    reader: &mut impl Read,
    out: &mut EntryWriter<'_>,
    size: u64,
    buf: &mut [u8],
    cancel: &CancellationToken,
    on_buffer: &mut dyn FnMut(u64),
) -> Result<(), ExtractError> {
    let mut remaining = size;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        let chunk = remaining.min(buf.len() as u64) as usize;
        reader
            .read_exact(&mut buf[..chunk])
            .map_err(ExtractError::Read)?;
        out.write(&buf[..chunk])?;
        remaining -= chunk as u64;
        if remaining > 0 {
            on_buffer(out.written);
        }
    }
    Ok(())
}

/// Inflates a raw deflate entry. `on_buffer` hears the entry's byte count
/// after every completely filled output buffer.
fn inflate(
    reader: &mut impl Read,
    out: &mut EntryWriter<'_>,
    name: &str,
    compressed_size: u64,
    (in_buf, out_buf): (&mut [u8], &mut [u8]),
    cancel: &CancellationToken,
    on_buffer: &mut dyn FnMut(u64),
) -> Result<(), ExtractError> {
    let mut decoder = Decompress::new(false);
    let mut remaining = compressed_size;
    let mut in_pos = 0;
    let mut in_len = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        if in_pos == in_len && remaining > 0 {
            let chunk = remaining.min(in_buf.len() as u64) as usize;
            reader
                .read_exact(&mut in_buf[..chunk])
                .map_err(ExtractError::Read)?;
            in_pos = 0;
            in_len = chunk;
            remaining -= chunk as u64;
        }

        let before_in = decoder.total_in();
        let before_out = decoder.total_out();
        let status = decoder
            .decompress(&in_buf[in_pos..in_len], out_buf, FlushDecompress::None)
            .map_err(|e| ExtractError::Decompress {
                entry: name.to_string(),
                reason: e.to_string(),
            })?;
        let consumed = (decoder.total_in() - before_in) as usize;
        let produced = (decoder.total_out() - before_out) as usize;
        in_pos += consumed;

        if produced > 0 {
            out.write(&out_buf[..produced])?;
        }

        match status {
            Status::StreamEnd => break,
            _ if produced == out_buf.len() => on_buffer(out.written),
            Status::Ok | Status::BufError => {
                let starved = in_pos == in_len && remaining == 0;
                if starved && consumed == 0 && produced == 0 {
                    return Err(ExtractError::Decompress {
                        entry: name.to_string(),
                        reason: "compressed data ended early".to_string(),
                    });
                }
            }
        }
    }

    // The deflate stream may end before the declared compressed size.
    skip(reader, remaining)
}
