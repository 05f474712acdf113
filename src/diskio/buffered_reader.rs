//! BufferedReader - sequential reads with an explicit, seekable read-ahead buffer
//!
//! Offsets handed to [`BufferedReader::seek`] come from a sparse index rather than
//! from the reader's own scan, so every seek drops whatever was read ahead and the
//! next read goes back to the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Result as IoResult, Seek, SeekFrom};
use std::path::Path;

pub struct BufferedReader {
    file: File,
    file_pos: u64,
    buffer: Vec<u8>,
    buffer_offset: usize,
    buffer_valid_len: usize,
}

impl BufferedReader {
    pub fn open(path: &Path, buffer_size: usize) -> IoResult<Self> {
        Self::open_at(path, 0, buffer_size)
    }

    /// Open a file and position the reader at `start_byte`
    pub fn open_at(path: &Path, start_byte: u64, buffer_size: usize) -> IoResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;

        let mut reader = BufferedReader {
            file,
            file_pos: 0,
            buffer: vec![0u8; buffer_size.max(1)],
            buffer_offset: 0,
            buffer_valid_len: 0,
        };
        if start_byte > 0 {
            reader.seek_to(start_byte)?;
        }
        Ok(reader)
    }

    /// Logical position: bytes consumed by callers so far
    pub fn position(&self) -> u64 {
        self.file_pos - (self.buffer_valid_len - self.buffer_offset) as u64
    }

    /// Reposition and discard any read-ahead data
    pub fn seek_to(&mut self, offset: u64) -> IoResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file_pos = offset;
        self.buffer_offset = 0;
        self.buffer_valid_len = 0;
        Ok(())
    }

    fn fill_buffer(&mut self) -> IoResult<()> {
        self.buffer_offset = 0;
        let n = self.file.read(&mut self.buffer)?;
        self.buffer_valid_len = n;
        self.file_pos += n as u64;
        Ok(())
    }
}

impl Read for BufferedReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut total_read = 0;

        loop {
            let available = self.buffer_valid_len - self.buffer_offset;
            if available > 0 {
                let to_copy = available.min(buf.len() - total_read);
                buf[total_read..total_read + to_copy].copy_from_slice(
                    &self.buffer[self.buffer_offset..self.buffer_offset + to_copy],
                );
                self.buffer_offset += to_copy;
                total_read += to_copy;

                if total_read == buf.len() {
                    return Ok(total_read);
                }
            }

            // Large reads with an empty buffer skip the copy
            if buf.len() - total_read >= self.buffer.len() {
                let n = self.file.read(&mut buf[total_read..])?;
                self.file_pos += n as u64;
                return Ok(total_read + n);
            }

            self.fill_buffer()?;
            if self.buffer_valid_len == 0 {
                // EOF
                return Ok(total_read);
            }
        }
    }
}

impl Seek for BufferedReader {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let new_pos = match pos {
            SeekFrom::Start(pos) => pos,
            SeekFrom::End(offset) => {
                let file_size = self.file.metadata()?.len();
                file_size.saturating_add_signed(offset)
            }
            SeekFrom::Current(offset) => self.position().saturating_add_signed(offset),
        };
        self.seek_to(new_pos)?;
        Ok(new_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_sequential_read() {
        let file = file_with(b"0123456789");
        let mut reader = BufferedReader::open(file.path(), 4).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(reader.position(), 10);
    }

    #[test]
    fn test_open_at_offset() {
        let file = file_with(b"abcdefghij");
        let mut reader = BufferedReader::open_at(file.path(), 6, 4).unwrap();
        let mut out = [0u8; 4];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ghij");
    }

    #[test]
    fn test_seek_discards_read_ahead() {
        let file = file_with(b"abcdefghij");
        let mut reader = BufferedReader::open(file.path(), 8).unwrap();

        let mut first = [0u8; 2];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"ab");
        assert_eq!(reader.position(), 2);

        // The file changes underneath; a seek must observe the new bytes
        fs::write(file.path(), b"ABCDEFGHIJ").unwrap();
        reader.seek_to(0).unwrap();
        let mut again = [0u8; 3];
        reader.read_exact(&mut again).unwrap();
        assert_eq!(&again, b"ABC");
    }

    #[test]
    fn test_seek_current_and_end() {
        let file = file_with(b"abcdefghij");
        let mut reader = BufferedReader::open(file.path(), 3).unwrap();
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).unwrap();
        assert_eq!(reader.seek(SeekFrom::Current(2)).unwrap(), 3);
        reader.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"d");
        assert_eq!(reader.seek(SeekFrom::End(-1)).unwrap(), 9);
        reader.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"j");
    }

    #[test]
    fn test_read_past_end() {
        let file = file_with(b"xy");
        let mut reader = BufferedReader::open(file.path(), 16).unwrap();
        let mut buf = [0u8; 4];
        let err = reader.read_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
