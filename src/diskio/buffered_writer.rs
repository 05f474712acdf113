//! BufferedWriter - append-only buffered writes with position tracking
//!
//! The writer knows the logical offset of the next byte it will write, which is
//! what the sparse index records. An optional flush interval pushes the buffer to
//! the file every N bytes so concurrent readers see a bounded lag.

use std::fs::{File, OpenOptions};
use std::io::{Result as IoResult, Write};
use std::path::{Path, PathBuf};

/// Write mode for BufferedWriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create new file, truncate if exists
    Create,
    /// Append to existing file, create if doesn't exist
    Append,
}

pub struct BufferedWriter {
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
    buffer_pos: usize,
    // Bytes already handed to the file
    flushed: u64,
    flush_interval: Option<u64>,
    next_flush_at: u64,
}

impl BufferedWriter {
    pub fn open(path: &Path, mode: WriteMode, buffer_size: usize) -> IoResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        match mode {
            WriteMode::Create => {
                options.create(true).write(true).truncate(true);
            }
            WriteMode::Append => {
                options.create(true).append(true);
            }
        }

        let file = options.open(path)?;
        let flushed = match mode {
            WriteMode::Append => file.metadata()?.len(),
            WriteMode::Create => 0,
        };

        Ok(BufferedWriter {
            path: path.to_path_buf(),
            file,
            buffer: vec![0u8; buffer_size.max(1)],
            buffer_pos: 0,
            flushed,
            flush_interval: None,
            next_flush_at: u64::MAX,
        })
    }

    /// Flush to the file every `bytes` bytes written, in addition to buffer-full flushes
    pub fn with_flush_interval(mut self, bytes: u64) -> Self {
        if bytes > 0 {
            self.flush_interval = Some(bytes);
            self.next_flush_at = self.position() + bytes;
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next byte to be written (including buffered data)
    pub fn position(&self) -> u64 {
        self.flushed + self.buffer_pos as u64
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> IoResult<()> {
        while !data.is_empty() {
            let available = self.buffer.len() - self.buffer_pos;
            let to_write = data.len().min(available);

            self.buffer[self.buffer_pos..self.buffer_pos + to_write]
                .copy_from_slice(&data[..to_write]);
            self.buffer_pos += to_write;
            data = &data[to_write..];

            if self.buffer_pos == self.buffer.len() {
                self.flush_buffer()?;
            }
        }

        if let Some(interval) = self.flush_interval {
            if self.position() >= self.next_flush_at {
                self.flush_buffer()?;
                self.next_flush_at = self.position() + interval;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> IoResult<()> {
        self.flush_buffer()?;
        self.file.flush()
    }

    fn flush_buffer(&mut self) -> IoResult<()> {
        if self.buffer_pos == 0 {
            return Ok(());
        }
        self.file.write_all(&self.buffer[..self.buffer_pos])?;
        self.flushed += self.buffer_pos as u64;
        self.buffer_pos = 0;
        Ok(())
    }
}

impl Write for BufferedWriter {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        BufferedWriter::flush(self)
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.flush_buffer();
    }
}
