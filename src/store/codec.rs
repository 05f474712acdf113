//! Record codec shared by map files, index files and the wire protocol.
//!
//! Every record is an independent bincode value: no stream header, no state
//! carried between records, so a reader can start at any record boundary.

use std::io::{self, ErrorKind, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Serialize one record onto the end of `buf`
pub fn encode_into<T: Serialize + ?Sized>(buf: &mut Vec<u8>, value: &T) -> Result<()> {
    bincode::serialize_into(buf, value)?;
    Ok(())
}

pub fn write_record<W: Write, T: Serialize + ?Sized>(writer: &mut W, value: &T) -> Result<()> {
    bincode::serialize_into(writer, value)?;
    Ok(())
}

/// Read the next record; `Ok(None)` at end of data.
///
/// End of data means no byte of a new record was available. A record cut off
/// partway is a codec error.
pub fn read_record<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut counted = Counted { inner: reader, read: 0 };
    match bincode::deserialize_from(&mut counted) {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_eof(&e) && counted.read == 0 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// Counts the bytes a decode consumed
struct Counted<'a, R> {
    inner: &'a mut R,
    read: usize,
}

impl<R: Read> Read for Counted<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n;
        Ok(n)
    }
}

pub fn is_eof(err: &bincode::Error) -> bool {
    matches!(**err, bincode::ErrorKind::Io(ref e) if e.kind() == ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_records_concatenate() {
        let mut buf = Vec::new();
        encode_into(&mut buf, &7u32).unwrap();
        encode_into(&mut buf, &"seven".to_string()).unwrap();
        encode_into(&mut buf, &(1u8, 2i64)).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_record::<_, u32>(&mut cursor).unwrap(), Some(7));
        assert_eq!(
            read_record::<_, String>(&mut cursor).unwrap(),
            Some("seven".to_string())
        );
        assert_eq!(
            read_record::<_, (u8, i64)>(&mut cursor).unwrap(),
            Some((1, 2))
        );
        assert_eq!(read_record::<_, u32>(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let mut buf = Vec::new();
        encode_into(&mut buf, &1u32).unwrap();
        encode_into(&mut buf, &u64::MAX).unwrap();
        buf.truncate(4 + 3);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_record::<_, u32>(&mut cursor).unwrap(), Some(1));
        assert!(matches!(
            read_record::<_, u64>(&mut cursor),
            Err(crate::error::Error::Codec(_))
        ));
    }

    #[test]
    fn test_empty_input_is_end_of_data() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert_eq!(read_record::<_, String>(&mut cursor).unwrap(), None);
    }
}
