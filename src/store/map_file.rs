//! MapFile - append-only log of serialized keys and key/value pairs.
//!
//! The file has no header: it is a plain sequence of records so that reading can
//! begin at any offset recorded in the sparse index. While writing, an index
//! entry is created for the first key and then whenever at least
//! `bytes_per_index` bytes were written since the previous entry.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::diskio::{BufferedReader, BufferedWriter, WriteMode};
use crate::error::{Error, Result};
use crate::store::codec::{encode_into, read_record};
use crate::store::index::MapFileIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create (truncate) the file for writing; reads see flushed data
    ReadWrite,
    /// Like `ReadWrite` but keep existing content and write after it
    Append,
}

/// I/O knobs of a map file, usually taken from [`Config`]
#[derive(Debug, Clone, Copy)]
pub struct MapFileSettings {
    pub bytes_per_index: u64,
    pub bytes_per_reset: u64,
    pub buffer_size: usize,
}

impl Default for MapFileSettings {
    fn default() -> Self {
        MapFileSettings::from(&Config::default())
    }
}

impl From<&Config> for MapFileSettings {
    fn from(config: &Config) -> Self {
        Self {
            bytes_per_index: config.bytes_per_index,
            bytes_per_reset: config.bytes_per_reset,
            buffer_size: config.buffer_size,
        }
    }
}

pub struct MapFile<K> {
    path: PathBuf,
    mode: OpenMode,
    writer: Option<BufferedWriter>,
    reader: Option<BufferedReader>,
    index: Option<MapFileIndex<K>>,
    settings: MapFileSettings,
    // None until the first key is written, so that key is always indexed
    next_index_at: Option<u64>,
    scratch: Vec<u8>,
}

impl<K> MapFile<K>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
{
    pub fn open(
        path: &Path,
        mode: OpenMode,
        index: Option<MapFileIndex<K>>,
        settings: MapFileSettings,
    ) -> Result<Self> {
        let (writer, reader) = match mode {
            OpenMode::Read => (None, Some(BufferedReader::open(path, settings.buffer_size)?)),
            OpenMode::ReadWrite | OpenMode::Append => {
                let write_mode = if mode == OpenMode::Append {
                    WriteMode::Append
                } else {
                    WriteMode::Create
                };
                let writer = BufferedWriter::open(path, write_mode, settings.buffer_size)?
                    .with_flush_interval(settings.bytes_per_reset);
                (Some(writer), None)
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            writer,
            reader,
            index,
            settings,
            next_index_at: None,
            scratch: Vec::new(),
        })
    }

    /// Read-only handle positioned at `offset`
    pub fn open_read_at(path: &Path, offset: u64, buffer_size: usize) -> Result<Self> {
        let settings = MapFileSettings {
            buffer_size,
            ..MapFileSettings::default()
        };
        let mut file = Self::open(path, OpenMode::Read, None, settings)?;
        if offset > 0 {
            file.seek(offset)?;
        }
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn index(&self) -> Option<&MapFileIndex<K>> {
        self.index.as_ref()
    }

    pub fn take_index(&mut self) -> Option<MapFileIndex<K>> {
        self.index.take()
    }

    /// Offset of the next record to be written
    pub fn position(&self) -> u64 {
        self.writer.as_ref().map(|w| w.position()).unwrap_or(0)
    }

    /// Length of the file including buffered bytes
    pub fn len(&self) -> Result<u64> {
        match &self.writer {
            Some(writer) => Ok(writer.position()),
            None => Ok(std::fs::metadata(&self.path)?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append a lone key
    pub fn write_key(&mut self, key: &K) -> Result<()> {
        self.ensure_writable()?;
        self.check_index(key);
        self.scratch.clear();
        encode_into(&mut self.scratch, key)?;
        self.flush_scratch()
    }

    /// Append a key/value pair
    pub fn write<V: Serialize + ?Sized>(&mut self, key: &K, value: &V) -> Result<()> {
        self.ensure_writable()?;
        self.check_index(key);
        self.scratch.clear();
        encode_into(&mut self.scratch, key)?;
        encode_into(&mut self.scratch, value)?;
        self.flush_scratch()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writer.is_none() {
            return Err(Error::ReadOnly(self.path.display().to_string()));
        }
        Ok(())
    }

    fn check_index(&mut self, key: &K) {
        let offset = self.position();
        let Some(index) = self.index.as_mut() else {
            return;
        };

        let due = match self.next_index_at {
            None => true,
            Some(next) => offset > next,
        };
        if due {
            index.create(key.clone(), offset);
            self.next_index_at = Some(offset + self.settings.bytes_per_index);
        } else {
            index.skip();
        }
    }

    fn flush_scratch(&mut self) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::ReadOnly(self.path.display().to_string()))?;
        writer.write_all(&self.scratch)?;
        Ok(())
    }

    fn reader(&mut self) -> Result<&mut BufferedReader> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        if self.reader.is_none() {
            self.reader = Some(BufferedReader::open(&self.path, self.settings.buffer_size)?);
        }
        self.reader
            .as_mut()
            .ok_or_else(|| Error::Protocol("map file reader unavailable".into()))
    }

    /// Next record in file order; `Ok(None)` at end of data
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let reader = self.reader()?;
        read_record(reader)
    }

    /// Next key/value pair; a key without its value counts as end of data
    pub fn read_entry<V: DeserializeOwned>(&mut self) -> Result<Option<(K, V)>> {
        let reader = self.reader()?;
        let Some(key) = read_record::<_, K>(reader)? else {
            return Ok(None);
        };
        Ok(read_record::<_, V>(reader)?.map(|value| (key, value)))
    }

    /// Reposition the reader and drop its read-ahead buffer
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.reader()?.seek_to(offset)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush and release the file handles; the index stays available
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.writer = None;
        self.reader = None;
        Ok(())
    }
}
