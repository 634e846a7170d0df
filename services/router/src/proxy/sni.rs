//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The peeker reads exactly the TLS records that carry the ClientHello,
//! keeping every byte it consumed, and hands back a [`ReplayableConnection`]
//! that yields those bytes again before reading from the live stream. The
//! backend therefore sees the untouched client byte stream.
//!
//! - peek timeout: 5s, applied to the peek only
//! - no bytes past the last ClientHello record are consumed

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use crate::error::PeekError;

/// Default timeout for reading the ClientHello.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum size of the ClientHello handshake message.
pub const DEFAULT_MAX_HANDSHAKE_LEN: usize = 64 * 1024;

/// Largest record body accepted (2^14 plaintext plus expansion slack).
const MAX_RECORD_LEN: usize = (1 << 14) + 256;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// What the peeker learned from the ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// SNI hostname as sent by the client; empty if the extension is absent.
    pub server_name: String,
    /// Every byte read from the client while peeking.
    pub raw: Vec<u8>,
}

/// Configuration for ClientHello peeking.
#[derive(Debug, Clone)]
pub struct PeekConfig {
    /// Maximum time to wait for the full ClientHello.
    pub timeout: Duration,
    /// Maximum handshake message length.
    pub max_handshake_len: usize,
}

impl Default for PeekConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PEEK_TIMEOUT,
            max_handshake_len: DEFAULT_MAX_HANDSHAKE_LEN,
        }
    }
}

/// Reads the ClientHello off a client stream without losing any bytes.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloPeeker {
    config: PeekConfig,
}

impl ClientHelloPeeker {
    /// Create a new peeker with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new peeker with custom configuration.
    pub fn with_config(config: PeekConfig) -> Self {
        Self { config }
    }

    /// Peek the ClientHello from `stream`.
    ///
    /// On success the returned connection replays the peeked bytes before
    /// continuing with `stream`. The timeout only covers the peek itself.
    pub async fn peek<S: AsyncRead + Unpin>(
        &self,
        mut stream: S,
    ) -> Result<(ClientHelloInfo, ReplayableConnection<S>), PeekError> {
        let mut raw = Vec::new();

        let handshake = timeout(
            self.config.timeout,
            self.read_client_hello(&mut stream, &mut raw),
        )
        .await
        .map_err(|_| PeekError::Timeout)??;

        let server_name = parse_client_hello(&handshake)?;
        debug!(
            server_name = %server_name,
            peeked_bytes = raw.len(),
            "ClientHello peeked"
        );

        let info = ClientHelloInfo {
            server_name,
            raw: raw.clone(),
        };
        Ok((info, ReplayableConnection::new(stream, raw)))
    }

    /// Read handshake records until the ClientHello message is complete.
    ///
    /// Returns the reassembled handshake message (header included); `raw`
    /// receives every byte read, record headers included.
    async fn read_client_hello<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        raw: &mut Vec<u8>,
    ) -> Result<Vec<u8>, PeekError> {
        let mut handshake = Vec::new();

        loop {
            let mut header = [0u8; RECORD_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            raw.extend_from_slice(&header);

            if header[0] != CONTENT_TYPE_HANDSHAKE {
                return Err(PeekError::NotTls {
                    content_type: header[0],
                });
            }

            let version = u16::from_be_bytes([header[1], header[2]]);
            if !(0x0300..=0x0304).contains(&version) {
                debug!(version = version, "Unexpected TLS record version");
            }

            let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
            if record_len == 0 {
                return Err(PeekError::Malformed("empty handshake record"));
            }
            if record_len > MAX_RECORD_LEN {
                return Err(PeekError::TooLarge { len: record_len });
            }

            let start = raw.len();
            raw.resize(start + record_len, 0);
            stream.read_exact(&mut raw[start..]).await?;
            handshake.extend_from_slice(&raw[start..]);

            if handshake.len() < HANDSHAKE_HEADER_LEN {
                continue;
            }
            if handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
                return Err(PeekError::NotClientHello {
                    handshake_type: handshake[0],
                });
            }

            let message_len = HANDSHAKE_HEADER_LEN
                + ((handshake[1] as usize) << 16
                    | (handshake[2] as usize) << 8
                    | handshake[3] as usize);
            if message_len > self.config.max_handshake_len {
                return Err(PeekError::TooLarge { len: message_len });
            }
            if handshake.len() >= message_len {
                handshake.truncate(message_len);
                return Ok(handshake);
            }
        }
    }
}

/// Parse the SNI hostname out of a complete ClientHello handshake message.
///
/// ClientHello layout after the 4-byte handshake header:
/// - 2 bytes: client version
/// - 32 bytes: random
/// - 1 byte + variable: session ID
/// - 2 bytes + variable: cipher suites
/// - 1 byte + variable: compression methods
/// - 2 bytes + variable: extensions (optional)
///
/// Returns an empty string if there is no `server_name` extension.
fn parse_client_hello(handshake: &[u8]) -> Result<String, PeekError> {
    let body = handshake
        .get(HANDSHAKE_HEADER_LEN..)
        .ok_or(PeekError::Malformed("short handshake header"))?;

    // Skip version (2) + random (32)
    let mut pos = 34;
    if pos > body.len() {
        return Err(PeekError::Malformed("short random"));
    }

    // Session ID
    let session_id_len = *body
        .get(pos)
        .ok_or(PeekError::Malformed("missing session id"))? as usize;
    pos += 1 + session_id_len;

    // Cipher suites
    let cipher_suites_len = read_u16(body, pos).ok_or(PeekError::Malformed("missing cipher suites"))?;
    pos += 2 + cipher_suites_len as usize;

    // Compression methods
    let compression_len = *body
        .get(pos)
        .ok_or(PeekError::Malformed("missing compression methods"))? as usize;
    pos += 1 + compression_len;

    if pos > body.len() {
        return Err(PeekError::Malformed("truncated compression methods"));
    }
    if pos == body.len() {
        // No extensions
        return Ok(String::new());
    }

    let extensions_len =
        read_u16(body, pos).ok_or(PeekError::Malformed("truncated extensions length"))? as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > body.len() {
        return Err(PeekError::Malformed("truncated extensions"));
    }

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(body, pos).ok_or(PeekError::Malformed("truncated extension"))?;
        let ext_len = read_u16(body, pos + 2).ok_or(PeekError::Malformed("truncated extension"))?
            as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return Err(PeekError::Malformed("extension overruns extensions block"));
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(&body[pos..pos + ext_len]);
        }

        pos += ext_len;
    }

    Ok(String::new())
}

/// Parse the `server_name` extension value.
///
/// Structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name_extension(data: &[u8]) -> Result<String, PeekError> {
    let list_len = read_u16(data, 0).ok_or(PeekError::Malformed("short server_name list"))? as usize;
    if data.len() < 2 + list_len {
        return Err(PeekError::Malformed("truncated server_name list"));
    }

    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = data[pos];
        let name_len = read_u16(data, pos + 1).ok_or(PeekError::Malformed("truncated server name"))?
            as usize;
        pos += 3;

        if pos + name_len > 2 + list_len {
            return Err(PeekError::Malformed("server name overruns list"));
        }

        if name_type == NAME_TYPE_HOST_NAME {
            if name_len == 0 {
                return Err(PeekError::Malformed("empty server name"));
            }
            return std::str::from_utf8(&data[pos..pos + name_len])
                .map(str::to_string)
                .map_err(|_| PeekError::Malformed("server name is not UTF-8"));
        }

        pos += name_len;
    }

    Ok(String::new())
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// A stream that replays already-consumed bytes before reading from the
/// underlying connection.
///
/// Writes, flushes and shutdown go straight to the underlying stream.
#[derive(Debug)]
pub struct ReplayableConnection<S> {
    inner: S,
    replay: Vec<u8>,
    pos: usize,
}

impl<S> ReplayableConnection<S> {
    /// Wrap `inner`, replaying `replay` first.
    pub fn new(inner: S, replay: Vec<u8>) -> Self {
        Self {
            inner,
            replay,
            pos: 0,
        }
    }

    /// Bytes still waiting to be replayed.
    pub fn pending(&self) -> &[u8] {
        &self.replay[self.pos..]
    }

    /// Unwrap into the underlying stream and any bytes not yet replayed.
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let pending = self.replay.split_off(self.pos);
        (self.inner, pending)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayableConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.replay.len() {
            let pending = &this.replay[this.pos..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            this.pos += n;

            if this.pos == this.replay.len() {
                // Drained; release the buffer.
                this.replay = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayableConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
