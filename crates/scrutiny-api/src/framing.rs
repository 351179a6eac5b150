//! Datagram framing shared by every link kind.
//!
//! Each JSON message travels as one datagram:
//!
//! ```text
//! <SCRUTINY size={hex} flags={c?h?}>{payload}{tag?}
//! ```
//!
//! `c` marks a zlib-compressed payload, `h` appends a 16-byte integrity tag
//! (truncated SHA-256 of the on-wire payload). The same [`DatagramCodec`]
//! drives a TCP byte stream through [`tokio_util::codec::Framed`] and UDP
//! packets through [`tokio_util::udp::UdpFramed`], so nothing above this
//! module knows which transport is in use.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

// ── Constants ────────────────────────────────────────────────────────

const HEADER_PREFIX: &[u8] = b"<SCRUTINY size=";
const FLAGS_PREFIX: &[u8] = b" flags=";

/// Size of the integrity tag appended when the `h` flag is set.
pub const TAG_SIZE: usize = 16;

/// Length of the longest header emitted for a 32-bit size.
pub const MAX_HEADER_LENGTH: usize = b"<SCRUTINY size=00000000 flags=ch>".len();

/// Largest MTU a header can describe.
pub const MAX_MTU: usize = u32::MAX as usize;

/// Default MTU: 1 MiB of on-wire payload.
pub const DEFAULT_MTU: usize = 1024 * 1024;

/// Upper bound on an inflated payload, whatever the compressed size.
const MAX_INFLATED_SIZE: usize = 64 * 1024 * 1024;

const COMPRESSION_LEVEL: u8 = 1;
const MAX_SIZE_DIGITS: usize = 16;

// ── FramingConfig ────────────────────────────────────────────────────

/// Framing options. Both peers must agree on nothing but the header
/// format: flags travel with every datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    /// Compress outgoing payloads with zlib.
    pub compress: bool,
    /// Append an integrity tag to outgoing payloads.
    pub use_hash: bool,
    /// Largest accepted on-wire payload, in bytes.
    pub mtu: usize,
    /// A partial datagram older than this is discarded when the next chunk arrives.
    pub interchunk_timeout: Duration,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            compress: true,
            use_hash: true,
            mtu: DEFAULT_MTU,
            interchunk_timeout: Duration::from_secs(1),
        }
    }
}

// ── Header parsing ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    size: usize,
    compressed: bool,
    use_hash: bool,
}

impl Header {
    fn wire_len(self) -> usize {
        if self.use_hash {
            self.size + TAG_SIZE
        } else {
            self.size
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// A complete header spanning `start..end`.
    Found {
        start: usize,
        end: usize,
        header: Header,
    },
    /// A header may begin at `start` but more bytes are needed.
    Incomplete { start: usize },
    NotFound,
}

fn scan_header(buf: &[u8]) -> Scan {
    let mut from = 0;
    while from < buf.len() {
        let Some(offset) = find_prefix(&buf[from..]) else {
            return Scan::NotFound;
        };
        let start = from + offset;
        match parse_header_at(&buf[start..]) {
            HeaderParse::Complete(len, header) => {
                return Scan::Found {
                    start,
                    end: start + len,
                    header,
                };
            }
            HeaderParse::NeedMore => return Scan::Incomplete { start },
            HeaderParse::Invalid => from = start + 1,
        }
    }
    Scan::NotFound
}

/// Position of the header prefix, or of a prefix fragment cut by the end of `buf`.
fn find_prefix(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| {
        let rest = &buf[i..];
        let n = rest.len().min(HEADER_PREFIX.len());
        rest[..n] == HEADER_PREFIX[..n]
    })
}

enum HeaderParse {
    Complete(usize, Header),
    NeedMore,
    Invalid,
}

fn parse_header_at(buf: &[u8]) -> HeaderParse {
    if buf.len() < HEADER_PREFIX.len() {
        return HeaderParse::NeedMore;
    }
    let mut pos = HEADER_PREFIX.len();

    let digits_start = pos;
    while pos < buf.len() && buf[pos].is_ascii_hexdigit() {
        pos += 1;
        if pos - digits_start > MAX_SIZE_DIGITS {
            return HeaderParse::Invalid;
        }
    }
    if pos == buf.len() {
        return HeaderParse::NeedMore;
    }
    if pos == digits_start {
        return HeaderParse::Invalid;
    }
    let Ok(digits) = std::str::from_utf8(&buf[digits_start..pos]) else {
        return HeaderParse::Invalid;
    };
    let Ok(size) = usize::from_str_radix(digits, 16) else {
        return HeaderParse::Invalid;
    };

    let rest = &buf[pos..];
    let n = rest.len().min(FLAGS_PREFIX.len());
    if rest[..n] != FLAGS_PREFIX[..n] {
        return HeaderParse::Invalid;
    }
    if n < FLAGS_PREFIX.len() {
        return HeaderParse::NeedMore;
    }
    pos += FLAGS_PREFIX.len();

    let mut header = Header {
        size,
        compressed: false,
        use_hash: false,
    };
    if buf.get(pos) == Some(&b'c') {
        header.compressed = true;
        pos += 1;
    }
    if buf.get(pos) == Some(&b'h') {
        header.use_hash = true;
        pos += 1;
    }
    match buf.get(pos) {
        None => HeaderParse::NeedMore,
        Some(b'>') => HeaderParse::Complete(pos + 1, header),
        Some(_) => HeaderParse::Invalid,
    }
}

fn integrity_tag(payload: &[u8]) -> [u8; TAG_SIZE] {
    let digest = Sha256::digest(payload);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&digest[..TAG_SIZE]);
    tag
}

// ── DatagramCodec ────────────────────────────────────────────────────

/// Encoder/decoder for Scrutiny datagrams.
///
/// Decoding never fails on bad input: garbage, oversized headers, tag
/// mismatches, and corrupt compressed data are logged and skipped so a
/// single bad datagram cannot take the link down.
#[derive(Debug)]
pub struct DatagramCodec {
    config: FramingConfig,
    pending: Option<Header>,
    last_len: usize,
    last_activity: Instant,
}

impl DatagramCodec {
    pub fn new(config: FramingConfig) -> Self {
        Self {
            config,
            pending: None,
            last_len: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Drop a stale partial datagram when new bytes arrive too late.
    fn expire_partial(&mut self, src: &mut BytesMut) {
        if src.len() > self.last_len {
            if self.pending.is_some()
                && self.last_activity.elapsed() > self.config.interchunk_timeout
            {
                tracing::warn!(
                    stale_bytes = self.last_len,
                    "inter-chunk timeout, discarding partial datagram"
                );
                src.advance(self.last_len.min(src.len()));
                self.pending = None;
            }
            self.last_activity = Instant::now();
        }
    }

    fn unpack(&self, mut frame: Bytes, header: Header) -> Result<Bytes, Error> {
        if header.use_hash {
            let tag = frame.split_off(header.size);
            if tag[..] != integrity_tag(&frame) {
                return Err(Error::IntegrityTag { size: header.size });
            }
        }
        if !header.compressed {
            return Ok(frame);
        }
        miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(&frame, MAX_INFLATED_SIZE)
            .map(Bytes::from)
            .map_err(|e| Error::Decompress(e.to_string()))
    }
}

impl Default for DatagramCodec {
    fn default() -> Self {
        Self::new(FramingConfig::default())
    }
}

impl Decoder for DatagramCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        self.expire_partial(src);

        let result = loop {
            if let Some(header) = self.pending {
                let wire_len = header.wire_len();
                if src.len() < wire_len {
                    src.reserve(wire_len - src.len());
                    break None;
                }
                let frame = src.split_to(wire_len).freeze();
                self.pending = None;
                match self.unpack(frame, header) {
                    Ok(payload) => break Some(payload),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping datagram");
                        continue;
                    }
                }
            }

            match scan_header(src) {
                Scan::Found { start, end, header } => {
                    if start > 0 {
                        tracing::debug!(bytes = start, "dropping garbage before header");
                    }
                    src.advance(end);
                    if header.size > self.config.mtu {
                        tracing::warn!(
                            size = header.size,
                            mtu = self.config.mtu,
                            "datagram larger than MTU, ignoring header"
                        );
                        continue;
                    }
                    self.pending = Some(header);
                }
                Scan::Incomplete { start } => {
                    src.advance(start);
                    break None;
                }
                Scan::NotFound => {
                    let keep = MAX_HEADER_LENGTH.min(src.len());
                    src.advance(src.len() - keep);
                    break None;
                }
            }
        };

        self.last_len = src.len();
        Ok(result)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            tracing::debug!(bytes = src.len(), "discarding incomplete datagram at end of input");
            src.clear();
        }
        self.pending = None;
        self.last_len = 0;
        Ok(None)
    }
}

impl Encoder<Bytes> for DatagramCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        let payload = if self.config.compress {
            Bytes::from(miniz_oxide::deflate::compress_to_vec_zlib(&item, COMPRESSION_LEVEL))
        } else {
            item
        };
        if payload.len() > self.config.mtu {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                mtu: self.config.mtu,
            });
        }

        let flags = match (self.config.compress, self.config.use_hash) {
            (true, true) => "ch",
            (true, false) => "c",
            (false, true) => "h",
            (false, false) => "",
        };
        let header = format!("<SCRUTINY size={:x} flags={flags}>", payload.len());

        dst.reserve(header.len() + payload.len() + TAG_SIZE);
        dst.put_slice(header.as_bytes());
        dst.put_slice(&payload);
        if self.config.use_hash {
            dst.put_slice(&integrity_tag(&payload));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
