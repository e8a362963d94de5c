//! Framing, tags, handshake tokens and the method allow-list.
//!
//! # Frame Format
//!
//! ```text
//! +---------+------------------------------------------+
//! | 0-3     | length of tag + payload (u32, big-endian) |
//! | 4       | tag                                       |
//! | 5-N     | payload                                   |
//! +---------+------------------------------------------+
//! ```
//!
//! The first frame in each direction is a handshake carrying a protocol
//! token. The server speaks first with its newest token; the client answers
//! with the newest token both sides understand.

mod method;

use std::fmt;
use std::path::PathBuf;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StorageError;

pub use method::Method;

/// Largest frame accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame tag, selecting how the payload is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Protocol token, both directions.
    Handshake = b'H',
    /// Client call that expects a reply.
    Call = b'C',
    /// Client call with no reply.
    AsyncCall = b'A',
    /// Client heartbeat.
    Ping = b'P',
    /// Call reply carrying a value.
    Reply = b'R',
    /// Call reply carrying an error.
    Error = b'E',
    /// Asynchronous store result.
    Serial = b's',
    /// Verification invalidation.
    VerifyInvalidation = b'i',
    /// Committed transaction invalidation batch.
    Invalidation = b'I',
    /// Storage info update.
    Info = b'S',
    /// Start of a verify response stream.
    BeginVerify = b'b',
    /// End of a verify response stream.
    EndVerify = b'e',
    /// Commit lock granted after waiting.
    Unlock = b'U',
    /// One chunk of a blob download.
    BlobChunk = b'c',
    /// Heartbeat answer.
    Pong = b'p',
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            b'H' => Self::Handshake,
            b'C' => Self::Call,
            b'A' => Self::AsyncCall,
            b'P' => Self::Ping,
            b'R' => Self::Reply,
            b'E' => Self::Error,
            b's' => Self::Serial,
            b'i' => Self::VerifyInvalidation,
            b'I' => Self::Invalidation,
            b'S' => Self::Info,
            b'b' => Self::BeginVerify,
            b'e' => Self::EndVerify,
            b'U' => Self::Unlock,
            b'c' => Self::BlobChunk,
            b'p' => Self::Pong,
            other => return Err(other),
        })
    }
}

/// Errors raised while reading or writing frames.
#[derive(Debug)]
pub enum WireError {
    Io(std::io::Error),
    /// Declared frame length exceeds [`MAX_FRAME_SIZE`].
    FrameTooLarge(usize),
    /// A frame must at least carry its tag.
    EmptyFrame,
    UnknownTag(u8),
    /// A frame arrived that is not valid at this point of the conversation.
    UnexpectedTag(Tag),
    Decode(prost::DecodeError),
    UnknownMethod(String),
    /// The peer offered no protocol token we understand.
    UnsupportedProtocol(Vec<u8>),
    /// A message decoded but a field in it is unusable.
    Malformed(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::FrameTooLarge(len) => {
                write!(f, "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}")
            }
            Self::EmptyFrame => write!(f, "empty frame"),
            Self::UnknownTag(tag) => write!(f, "unknown frame tag 0x{tag:02x}"),
            Self::UnexpectedTag(tag) => write!(f, "unexpected frame tag {tag:?}"),
            Self::Decode(e) => write!(f, "undecodable payload: {e}"),
            Self::UnknownMethod(name) => write!(f, "method not allowed: {name:?}"),
            Self::UnsupportedProtocol(token) => {
                write!(f, "unsupported protocol {:?}", String::from_utf8_lossy(token))
            }
            Self::Malformed(what) => write!(f, "malformed {what}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<prost::DecodeError> for WireError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<WireError> for StorageError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => Self::Disconnected(e.to_string()),
            WireError::UnsupportedProtocol(_) => Self::Auth(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub const fn new(tag: Tag, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// A frame with no payload (`b`, `e`, `U`, `P`, `p`).
    #[must_use]
    pub const fn bare(tag: Tag) -> Self {
        Self::new(tag, Vec::new())
    }

    /// A frame carrying a prost message.
    #[must_use]
    pub fn message<M: Message>(tag: Tag, message: &M) -> Self {
        Self::new(tag, message.encode_to_vec())
    }

    /// Decode the payload as `M`.
    pub fn decode<M: Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.payload.as_slice())?)
    }

    /// The bytes written to the socket for this frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body_len = self.payload.len() + 1;
        if body_len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(body_len));
        }
        let len = u32::try_from(body_len).map_err(|_| WireError::FrameTooLarge(body_len))?;
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.tag as u8);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between
/// frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let tag = Tag::try_from(body[0]).map_err(WireError::UnknownTag)?;
    body.remove(0);
    Ok(Some(Frame::new(tag, body)))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), WireError> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Protocol versions this crate speaks, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    Z309,
    Z310,
    Z400,
}

impl ProtocolVersion {
    pub const ALL: [Self; 3] = [Self::Z309, Self::Z310, Self::Z400];
    pub const CURRENT: Self = Self::Z400;

    #[must_use]
    pub const fn token(self) -> &'static [u8] {
        match self {
            Self::Z309 => b"Z309",
            Self::Z310 => b"Z310",
            Self::Z400 => b"Z400",
        }
    }

    #[must_use]
    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.token() == token)
    }

    /// The version a client answers with after the server announced
    /// `offered`: the newest version not newer than either side.
    #[must_use]
    pub fn negotiate(offered: &[u8]) -> Option<Self> {
        if let Some(version) = Self::from_token(offered) {
            return Some(version.min(Self::CURRENT));
        }
        // A newer server still accepts our current token.
        if offered.len() == 4 && offered[0] == b'Z' && offered > Self::CURRENT.token() {
            return Some(Self::CURRENT);
        }
        None
    }
}

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Address {
    /// Parse an address. Anything containing `/` is a Unix socket path.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.contains('/') {
            Self::Unix(PathBuf::from(s))
        } else {
            Self::Tcp(s.to_string())
        }
    }

    /// Open a stream to this address. Also returns the canonical peer
    /// name: the resolved socket address for TCP, the path for Unix.
    pub async fn connect(&self) -> std::io::Result<(Box<dyn Stream>, String)> {
        match self {
            Self::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let peer = stream.peer_addr()?.to_string();
                Ok((Box::new(stream), peer))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A bidirectional byte stream: TCP or Unix socket.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}
