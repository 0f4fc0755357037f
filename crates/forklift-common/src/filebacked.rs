//! Append-only spill file for large intermediate collections
//!
//! Entries are framed `[kind: u16 LE][len: u64 LE][payload]` with a
//! serde_json payload. An in-memory index of byte offsets makes every entry
//! directly addressable. The file lives under the working directory and is
//! removed when the `SpillFile` is dropped.

use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::Error;

const HEADER_LEN: u64 = 2 + 8;

fn io_error(op: &str, err: std::io::Error) -> Error {
    Error::internal_with_context("filebacked", format!("{op}: {err}"))
}

/// Append-only framed file with an offset index
pub struct SpillFile {
    file: NamedTempFile,
    index: Vec<u64>,
    end: u64,
}

impl SpillFile {
    /// Create an empty spill file in `dir`
    pub fn create_in(dir: &Path) -> Result<Self, Error> {
        let file = tempfile::Builder::new()
            .prefix("forklift-spill-")
            .tempfile_in(dir)
            .map_err(|e| io_error("create", e))?;
        Ok(Self {
            file,
            index: Vec::new(),
            end: 0,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the file holds no entries
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Append an entry, returning its index
    pub fn append<T: Serialize>(&mut self, kind: u16, value: &T) -> Result<usize, Error> {
        let payload = serde_json::to_vec(value)?;
        let offset = self.end;

        let f = self.file.as_file_mut();
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| io_error("seek", e))?;
        f.write_all(&kind.to_le_bytes())
            .and_then(|_| f.write_all(&(payload.len() as u64).to_le_bytes()))
            .and_then(|_| f.write_all(&payload))
            .map_err(|e| io_error("write", e))?;

        self.end = offset + HEADER_LEN + payload.len() as u64;
        self.index.push(offset);
        Ok(self.index.len() - 1)
    }

    /// Read the entry at `index`
    pub fn get<T: DeserializeOwned>(&mut self, index: usize) -> Result<Option<(u16, T)>, Error> {
        let Some(&offset) = self.index.get(index) else {
            return Ok(None);
        };
        self.read_at(offset).map(Some)
    }

    /// Iterate entries in append order
    pub fn iter<T: DeserializeOwned>(&mut self) -> SpillIter<'_, T> {
        SpillIter {
            spill: self,
            next: 0,
            _marker: PhantomData,
        }
    }

    fn read_at<T: DeserializeOwned>(&mut self, offset: u64) -> Result<(u16, T), Error> {
        let f = self.file.as_file_mut();
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| io_error("seek", e))?;

        let mut kind = [0u8; 2];
        let mut len = [0u8; 8];
        f.read_exact(&mut kind)
            .and_then(|_| f.read_exact(&mut len))
            .map_err(|e| io_error("read header", e))?;
        let len = u64::from_le_bytes(len);
        if offset + HEADER_LEN + len > self.end {
            return Err(Error::internal_with_context(
                "filebacked",
                format!("entry at {offset} overruns file end {}", self.end),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        f.read_exact(&mut payload)
            .map_err(|e| io_error("read payload", e))?;
        Ok((u16::from_le_bytes(kind), serde_json::from_slice(&payload)?))
    }
}

/// Iterator over spill file entries
pub struct SpillIter<'a, T> {
    spill: &'a mut SpillFile,
    next: usize,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> Iterator for SpillIter<'_, T> {
    type Item = Result<(u16, T), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = *self.spill.index.get(self.next)?;
        self.next += 1;
        Some(self.spill.read_at(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Extent {
        start: u64,
        length: u64,
    }

    const KIND_EXTENT: u16 = 7;

    #[test]
    fn entries_are_addressable_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillFile::create_in(dir.path()).unwrap();
        assert!(spill.is_empty());

        for i in 0..100u64 {
            let idx = spill
                .append(
                    KIND_EXTENT,
                    &Extent {
                        start: i * 65536,
                        length: 4096,
                    },
                )
                .unwrap();
            assert_eq!(idx as u64, i);
        }

        assert_eq!(spill.len(), 100);
        let (kind, extent): (u16, Extent) = spill.get(42).unwrap().unwrap();
        assert_eq!(kind, KIND_EXTENT);
        assert_eq!(extent.start, 42 * 65536);
        assert!(spill.get::<Extent>(100).unwrap().is_none());

        // Random access does not disturb later appends
        spill.append(1, &"tail").unwrap();
        let (kind, tail): (u16, String) = spill.get(100).unwrap().unwrap();
        assert_eq!((kind, tail.as_str()), (1, "tail"));
    }

    #[test]
    fn frames_are_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillFile::create_in(dir.path()).unwrap();
        spill.append(0x0102, &[1u8, 2]).unwrap();

        let bytes = std::fs::read(spill.path()).unwrap();
        assert_eq!(&bytes[0..2], &[0x02, 0x01]);
        assert_eq!(u64::from_le_bytes(bytes[2..10].try_into().unwrap()), 5);
        assert_eq!(&bytes[10..], b"[1,2]");
    }

    #[test]
    fn iter_preserves_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillFile::create_in(dir.path()).unwrap();
        for s in ["a", "b", "c"] {
            spill.append(0, &s).unwrap();
        }
        let values: Vec<String> = spill
            .iter::<String>()
            .map(|r| r.map(|(_, v)| v))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut spill = SpillFile::create_in(dir.path()).unwrap();
            spill.append(0, &1u32).unwrap();
            spill.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
