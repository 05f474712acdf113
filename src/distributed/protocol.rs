//! Messages exchanged between the master and its workers.
//!
//! Every message travels as a frame: a little-endian u32 body length followed
//! by the bincode encoding of a [`Message`].

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 9760;

/// Largest frame body either side accepts. Larger partition payloads need a
/// shared directory, so that only descriptors travel.
pub const MAX_FRAME: u32 = 256 << 20;

// Same encoding as `bincode::serialize`, bounded to one frame
fn frame_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(u64::from(MAX_FRAME))
}

/// Sent once per connection right after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub rank: usize,
    pub num_workers: usize,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    /// The argument value itself
    Serialized(Vec<u8>),
    /// The receiver builds a fresh instance from its registry
    Constructed,
}

/// How one argument of a work request is rebuilt on a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireArg {
    pub type_name: String,
    pub kind: ArgKind,
}

impl WireArg {
    pub fn serialized<T: Serialize + ?Sized>(type_name: &str, value: &T) -> Result<Self> {
        Ok(Self {
            type_name: type_name.to_string(),
            kind: ArgKind::Serialized(bincode::serialize(value)?),
        })
    }

    pub fn constructed(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            kind: ArgKind::Constructed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Registry name of the operation
    pub operation: String,
    pub args: Vec<WireArg>,
}

/// Outcome of one work request on a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub rank: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Register(Registration),
    Request(WorkRequest),
    /// Partition exchange payload of the final merge round
    Exchange(Vec<u8>),
    Finished(RunReport),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Register(_) => "register",
            Message::Request(_) => "request",
            Message::Exchange(_) => "exchange",
            Message::Finished(_) => "finished",
        }
    }
}

/// Frame and write one message
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let body = bincode::serialize(message)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| Error::Protocol(format!("message of {} bytes is too large", body.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message; `Ok(None)` when the peer closed between frames
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the limit of {}",
            len, MAX_FRAME
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(frame_options().deserialize(&body)?))
}

/// Buffered, framed message channel over a TCP stream
pub struct Connection {
    peer: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            peer,
            reader,
            writer: BufWriter::new(stream),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.writer, message)
    }

    pub fn recv(&mut self) -> Result<Option<Message>> {
        read_message(&mut self.reader)
    }

    /// Receive a message that must be present
    pub fn expect(&mut self) -> Result<Message> {
        self.recv()?
            .ok_or_else(|| Error::Protocol(format!("{} closed the connection", self.peer)))
    }

    pub fn shutdown(&self) -> Result<()> {
        match self.writer.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split `host[:port]` into its parts, defaulting the port
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in worker address {:?}", address)))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(Error::Config(format!("invalid worker address {:?}", address))),
        None if !address.is_empty() => Ok((address.to_string(), DEFAULT_PORT)),
        None => Err(Error::Config("empty worker address".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Exchange(vec![1, 2, 3])).unwrap();
        write_message(
            &mut buf,
            &Message::Finished(RunReport {
                rank: 2,
                error: None,
            }),
        )
        .unwrap();

        let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(
            bincode::deserialize::<Message>(&buf[4..4 + body_len])
                .unwrap()
                .name(),
            "exchange"
        );

        let mut reader = Cursor::new(buf);
        match read_message(&mut reader).unwrap() {
            Some(Message::Exchange(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
        match read_message(&mut reader).unwrap() {
            Some(Message::Finished(report)) => assert_eq!(report.rank, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(read_message(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Exchange(vec![0; 16])).unwrap();
        buf.truncate(10);
        assert!(read_message(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = (MAX_FRAME + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            read_message(&mut Cursor::new(buf)),
            Err(Error::Protocol(_))
        ));

        let mut buf = u32::MAX.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            read_message(&mut Cursor::new(buf)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_registration_carries_config() {
        let config = Config::default().with_threads(3).with_workers(["a", "b"]);
        let message = Message::Register(Registration {
            rank: 1,
            num_workers: 3,
            config: config.clone(),
        });
        let mut buf = Vec::new();
        write_message(&mut buf, &message).unwrap();
        match read_message(&mut Cursor::new(buf)).unwrap() {
            Some(Message::Register(r)) => {
                assert_eq!(r.rank, 1);
                assert_eq!(r.num_workers, 3);
                assert_eq!(r.config, config);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("node1").unwrap(),
            ("node1".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_address(" node2:9000 ").unwrap(),
            ("node2".to_string(), 9000)
        );
        assert!(parse_address("node3:http").is_err());
        assert!(parse_address(":80").is_err());
        assert!(parse_address("").is_err());
    }
}
