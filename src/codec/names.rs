use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{acquire_lock, BundleError, Result};

/// Bidirectional mapping between strings and small positive integers.
///
/// Once an integer is assigned to a string the pair holds forever: lookups
/// are monotone, integers are never reused, and 0 is never issued.
pub trait StringIndex: Send + Sync {
    /// Returns the integer for `s`, assigning a fresh one on first use.
    fn index(&self, s: &str) -> Result<u32>;

    /// Resolves an integer back to its string.
    fn lookup(&self, index: u32) -> Result<String>;
}

/// Integers whose minimal LEB128 encoding would lead with `0xff` are never
/// issued; that byte is reserved as the property-table terminator in the
/// bundle payload.
pub(crate) fn reserved_index(index: u32) -> bool {
    index > 0x7f && index & 0x7f == 0x7f
}

#[derive(Default)]
struct IndexState {
    by_string: HashMap<String, u32>,
    by_index: HashMap<u32, String>,
    next: u32,
}

/// File-backed, append-only string index. Records are
/// `u32 index (BE), u32 length (BE), UTF-8 bytes`; the file is fully loaded
/// at open and every assignment appends one record and flushes.
pub struct FileStringIndex {
    file: Mutex<File>,
    state: RwLock<IndexState>,
}

impl FileStringIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = IndexState {
            next: 1,
            ..IndexState::default()
        };
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                let mut header = [0u8; 8];
                match reader.read_exact(&mut header[..4]) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                reader.read_exact(&mut header[4..])?;
                let index = u32::from_be_bytes(
                    header[..4].try_into().expect("slice has exactly 4 bytes"),
                );
                let len = u32::from_be_bytes(
                    header[4..].try_into().expect("slice has exactly 4 bytes"),
                ) as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                let string = String::from_utf8(bytes).map_err(|_| {
                    BundleError::Decoding(format!(
                        "string index {} is not valid UTF-8: {}",
                        index,
                        path.display()
                    ))
                })?;
                if index == 0 {
                    return Err(BundleError::Decoding(format!(
                        "string index file contains reserved index 0: {}",
                        path.display()
                    )));
                }
                state.next = state.next.max(index + 1);
                state.by_string.insert(string.clone(), index);
                state.by_index.insert(index, string);
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), entries = state.by_index.len(), "string index loaded");
        Ok(Self {
            file: Mutex::new(file),
            state: RwLock::new(state),
        })
    }

    fn append(&self, index: u32, s: &str) -> Result<()> {
        let mut file = acquire_lock(&self.file)?;
        file.write_all(&index.to_be_bytes())?;
        file.write_all(&(s.len() as u32).to_be_bytes())?;
        file.write_all(s.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl StringIndex for FileStringIndex {
    fn index(&self, s: &str) -> Result<u32> {
        if let Some(&index) = self.state.read().by_string.get(s) {
            return Ok(index);
        }
        let mut state = self.state.write();
        if let Some(&index) = state.by_string.get(s) {
            return Ok(index);
        }
        let mut index = state.next;
        while reserved_index(index) {
            index += 1;
        }
        state.next = index + 1;
        state.by_string.insert(s.to_string(), index);
        state.by_index.insert(index, s.to_string());
        drop(state);
        self.append(index, s)?;
        Ok(index)
    }

    fn lookup(&self, index: u32) -> Result<String> {
        self.state
            .read()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| BundleError::NoSuchItem(format!("string index entry {index}")))
    }
}

/// Volatile index with the same contract; holds nothing across restarts.
#[derive(Default)]
pub struct MemoryStringIndex {
    state: RwLock<IndexState>,
}

impl MemoryStringIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState {
                next: 1,
                ..IndexState::default()
            }),
        }
    }
}

impl StringIndex for MemoryStringIndex {
    fn index(&self, s: &str) -> Result<u32> {
        if let Some(&index) = self.state.read().by_string.get(s) {
            return Ok(index);
        }
        let mut state = self.state.write();
        if let Some(&index) = state.by_string.get(s) {
            return Ok(index);
        }
        let mut index = state.next.max(1);
        while reserved_index(index) {
            index += 1;
        }
        state.next = index + 1;
        state.by_string.insert(s.to_string(), index);
        state.by_index.insert(index, s.to_string());
        Ok(index)
    }

    fn lookup(&self, index: u32) -> Result<String> {
        self.state
            .read()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| BundleError::NoSuchItem(format!("string index entry {index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_monotone_from_one() {
        let index = MemoryStringIndex::new();
        assert_eq!(index.index("jcr:primaryType").unwrap(), 1);
        assert_eq!(index.index("jcr:mixinTypes").unwrap(), 2);
        assert_eq!(index.index("jcr:primaryType").unwrap(), 1);
        assert_eq!(index.lookup(2).unwrap(), "jcr:mixinTypes");
    }

    #[test]
    fn zero_is_never_issued() {
        let index = MemoryStringIndex::new();
        assert!(index.index("x").unwrap() > 0);
        assert!(index.lookup(0).is_err());
    }

    #[test]
    fn reserved_indices_are_skipped() {
        assert!(!reserved_index(127));
        assert!(reserved_index(255));
        assert!(reserved_index(383));
        assert!(!reserved_index(256));

        let index = MemoryStringIndex::new();
        let mut last = 0;
        for i in 0..300 {
            last = index.index(&format!("name-{i}")).unwrap();
        }
        assert!(last > 255);
        for i in 0..300 {
            let assigned = index.index(&format!("name-{i}")).unwrap();
            assert!(!reserved_index(assigned));
        }
    }

    #[test]
    fn survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("names.idx");
        {
            let index = FileStringIndex::open(&path)?;
            assert_eq!(index.index("alpha")?, 1);
            assert_eq!(index.index("beta")?, 2);
        }
        {
            let index = FileStringIndex::open(&path)?;
            assert_eq!(index.lookup(1)?, "alpha");
            assert_eq!(index.index("beta")?, 2);
            assert_eq!(index.index("gamma")?, 3);
        }
        Ok(())
    }
}
