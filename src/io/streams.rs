//! Per-feature stream factories.
//!
//! The project container owns the real storage; the engine only needs
//! "open one named output/input stream per feature key". Two factories
//! are provided: an in-memory one for tests and embedding, and a
//! directory-backed one writing one file per feature key.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{Error, Result};

// ============================================================================
// Trait
// ============================================================================

/// Opens independent byte streams keyed by feature key. Each feature's
/// stream is opened and closed on its own, so one feature's I/O failure
/// never corrupts the others.
pub trait FeatureStreamFactory {
    fn create_output_stream(&mut self, key: &str) -> Result<Box<dyn Write + '_>>;
    fn open_input_stream(&self, key: &str) -> Result<Box<dyn Read + '_>>;
    fn stored_keys(&self) -> Vec<String>;
}

// ============================================================================
// MemoryStreamFactory
// ============================================================================

/// Holds every feature blob in a shared map.
#[derive(Default, Clone)]
pub struct MemoryStreamFactory {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw blob access, for corruption tests and introspection.
    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(key).cloned()
    }

    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.lock().insert(key.to_string(), bytes);
    }
}

/// Buffers writes and publishes the blob when dropped.
struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.blobs.lock().insert(self.key.clone(), std::mem::take(&mut self.buf));
    }
}

impl FeatureStreamFactory for MemoryStreamFactory {
    fn create_output_stream(&mut self, key: &str) -> Result<Box<dyn Write + '_>> {
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: Vec::new(),
            blobs: self.blobs.clone(),
        }))
    }

    fn open_input_stream(&self, key: &str) -> Result<Box<dyn Read + '_>> {
        let blob = self.blobs.lock().get(key).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no stored feature '{key}'"),
            ))
        })?;
        Ok(Box::new(std::io::Cursor::new(blob)))
    }

    fn stored_keys(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }
}

// ============================================================================
// DirStreamFactory
// ============================================================================

/// One file per feature key in a directory. Keys are escaped into safe
/// file names (alphanumerics, `-` and `_` pass through; everything else
/// becomes `%XX`).
pub struct DirStreamFactory {
    dir: PathBuf,
}

const FEATURE_EXT: &str = ".feature";

impl DirStreamFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{FEATURE_EXT}", escape_key(key)))
    }
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let raw = name.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = raw.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}

impl FeatureStreamFactory for DirStreamFactory {
    fn create_output_stream(&mut self, key: &str) -> Result<Box<dyn Write + '_>> {
        let file = std::fs::File::create(self.path_for(key))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }

    fn open_input_stream(&self, key: &str) -> Result<Box<dyn Read + '_>> {
        let file = std::fs::File::open(self.path_for(key))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn stored_keys(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return Vec::new() };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| {
                name.strip_suffix(FEATURE_EXT)
                    .and_then(unescape_key)
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_escaping_roundtrip() {
        for key in [
            "Spot gaussian-filtered intensity",
            "Link velocity",
            "weird/key:with%chars",
            "µm units",
        ] {
            let escaped = escape_key(key);
            assert!(escaped.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'%'));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
    }

    #[test]
    fn test_memory_factory_roundtrip() {
        let mut factory = MemoryStreamFactory::new();
        {
            let mut w = factory.create_output_stream("A").unwrap();
            w.write_all(b"hello").unwrap();
        }
        let mut r = factory.open_input_stream("A").unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(factory.stored_keys(), vec!["A"]);
    }

    #[test]
    fn test_memory_factory_missing_key() {
        let factory = MemoryStreamFactory::new();
        assert!(matches!(factory.open_input_stream("nope"), Err(Error::Io(_))));
    }
}
