//! Proof directory layout and file formats.
//!
//! A proof directory holds `indices.npy` (the recorded sampling order),
//! `hash.txt` (hex SHA-256 of the addressed data) and one JSON checkpoint
//! per saved step named `model_step_<N>`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{PolError, Result};
use crate::params::Checkpoint;

pub const INDICES_FILE: &str = "indices.npy";
pub const HASH_FILE: &str = "hash.txt";

pub fn checkpoint_name(step: usize) -> String {
    format!("model_step_{step}")
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    if !path.exists() {
        return Err(PolError::missing("checkpoint", path));
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| PolError::format(path, e.to_string()))
}

pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, checkpoint)?;
    writer.flush()?;
    Ok(())
}

/// Handle on a directory of recorded training evidence.
#[derive(Clone, Debug)]
pub struct ProofDir {
    root: PathBuf,
}

impl ProofDir {
    /// Open an existing proof directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        if !root.is_dir() {
            return Err(PolError::missing("model directory", root));
        }
        Ok(Self { root })
    }

    /// Create (if needed) and open a proof directory.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.root.join(checkpoint_name(step))
    }

    pub fn load_checkpoint(&self, step: usize) -> Result<Checkpoint> {
        load_checkpoint(&self.checkpoint_path(step))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.checkpoint_path(checkpoint.step as usize);
        save_checkpoint(&path, checkpoint)?;
        Ok(path)
    }

    pub fn load_indices(&self) -> Result<Vec<usize>> {
        let path = self.root.join(INDICES_FILE);
        if !path.exists() {
            return Err(PolError::missing("index sequence", path));
        }
        let reader = BufReader::new(File::open(&path)?);
        read_npy_indices(reader).map_err(|detail| PolError::format(&path, detail))
    }

    pub fn save_indices(&self, indices: &[usize]) -> Result<()> {
        let mut writer = BufWriter::new(File::create(self.root.join(INDICES_FILE))?);
        write_npy_indices(&mut writer, indices)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_hash(&self) -> Result<String> {
        let path = self.root.join(HASH_FILE);
        if !path.exists() {
            return Err(PolError::missing("hash file", path));
        }
        Ok(std::fs::read_to_string(path)?.trim().to_string())
    }

    pub fn save_hash(&self, digest: &str) -> Result<()> {
        std::fs::write(self.root.join(HASH_FILE), digest)?;
        Ok(())
    }
}

// Element types accepted for index files
#[derive(Clone, Copy, Debug, PartialEq)]
enum IndexDtype {
    I8,
    I4,
    U8,
    U4,
}

impl IndexDtype {
    fn width(self) -> usize {
        match self {
            IndexDtype::I8 | IndexDtype::U8 => 8,
            IndexDtype::I4 | IndexDtype::U4 => 4,
        }
    }

    fn from_header(header: &str) -> std::result::Result<Self, String> {
        for (tag, dtype) in [
            ("<i8", IndexDtype::I8),
            ("<i4", IndexDtype::I4),
            ("<u8", IndexDtype::U8),
            ("<u4", IndexDtype::U4),
        ] {
            if header.contains(&format!("'{tag}'")) {
                return Ok(dtype);
            }
        }
        Err(format!("unsupported dtype in npy header (expected <i8, <i4, <u8 or <u4): {header}"))
    }

    fn decode(self, bytes: &[u8]) -> std::result::Result<usize, String> {
        let value: i128 = match self {
            IndexDtype::I8 => i64::from_le_bytes(bytes.try_into().map_err(|_| "short read")?) as i128,
            IndexDtype::I4 => i32::from_le_bytes(bytes.try_into().map_err(|_| "short read")?) as i128,
            IndexDtype::U8 => u64::from_le_bytes(bytes.try_into().map_err(|_| "short read")?) as i128,
            IndexDtype::U4 => u32::from_le_bytes(bytes.try_into().map_err(|_| "short read")?) as i128,
        };
        usize::try_from(value).map_err(|_| format!("negative sample index {value}"))
    }
}

/// Parse a one-dimensional integer `.npy` array (format v1 or v2).
pub fn read_npy_indices<R: Read>(mut reader: R) -> std::result::Result<Vec<usize>, String> {
    // Magic: \x93NUMPY
    let mut magic = [0u8; 6];
    reader
        .read_exact(&mut magic)
        .map_err(|e| format!("failed to read npy magic: {e}"))?;
    if magic[0] != 0x93 || &magic[1..6] != b"NUMPY" {
        return Err("not a valid .npy file (bad magic)".to_string());
    }

    let mut version = [0u8; 2];
    reader
        .read_exact(&mut version)
        .map_err(|e| format!("failed to read npy version: {e}"))?;

    let header_len: usize = if version[0] <= 1 {
        let mut buf = [0u8; 2];
        reader
            .read_exact(&mut buf)
            .map_err(|e| format!("failed to read header length: {e}"))?;
        u16::from_le_bytes(buf) as usize
    } else {
        let mut buf = [0u8; 4];
        reader
            .read_exact(&mut buf)
            .map_err(|e| format!("failed to read header length: {e}"))?;
        u32::from_le_bytes(buf) as usize
    };

    let mut header_bytes = vec![0u8; header_len];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|e| format!("failed to read header dict: {e}"))?;
    let header = std::str::from_utf8(&header_bytes).map_err(|e| format!("header is not utf8: {e}"))?;

    let dtype = IndexDtype::from_header(header)?;
    if header.contains("'fortran_order': True") {
        return Err("fortran-ordered arrays are not supported".to_string());
    }
    let len = parse_len(header)?;

    let width = dtype.width();
    let expected = len
        .checked_mul(width)
        .ok_or_else(|| format!("shape ({len},) overflows the addressable size"))?;
    // sized by what is actually read, not by the header
    let mut raw = Vec::new();
    reader
        .take(expected as u64)
        .read_to_end(&mut raw)
        .map_err(|e| format!("failed to read npy data: {e}"))?;
    if raw.len() != expected {
        return Err(format!("npy data truncated: {} of {expected} bytes", raw.len()));
    }

    raw.chunks_exact(width).map(|chunk| dtype.decode(chunk)).collect()
}

fn parse_len(header: &str) -> std::result::Result<usize, String> {
    let shape_start = header
        .find("'shape':")
        .ok_or_else(|| format!("no 'shape' key in npy header: {header}"))?;
    let after_key = &header[shape_start..];
    let open = after_key.find('(').ok_or("no opening paren in shape")?;
    let close = after_key.find(')').ok_or("no closing paren in shape")?;

    let dims: Vec<&str> = after_key[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match dims.as_slice() {
        [n] => n.parse().map_err(|e| format!("bad shape dim: {e}")),
        _ => Err(format!("index array must be one-dimensional, got shape ({})", dims.join(", "))),
    }
}

/// Write indices as a v1 `.npy` array of `<i8`.
pub fn write_npy_indices<W: Write>(writer: &mut W, indices: &[usize]) -> Result<()> {
    let dict = format!(
        "{{'descr': '<i8', 'fortran_order': False, 'shape': ({},), }}",
        indices.len()
    );
    // magic + version + header length + dict + newline, padded to 64 bytes
    let unpadded = 6 + 2 + 2 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = dict.len() + padding + 1;

    writer.write_all(&[0x93])?;
    writer.write_all(b"NUMPY")?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&(header_len as u16).to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;
    writer.write_all(&vec![b' '; padding])?;
    writer.write_all(b"\n")?;
    for &idx in indices {
        writer.write_all(&(idx as i64).to_le_bytes())?;
    }
    Ok(())
}
