//! Buffered zlib inflate for Git's deflated objects, hashing the canonical
//! object header and payload while decompressing so corruption is caught at
//! read time.

use std::{
    io,
    io::{BufRead, Write},
};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};

use crate::{errors::GvfsError, object::ObjectKind, oid::ObjectId};

/// Streaming inflate reader over a DEFLATE stream with [`BufRead`] underneath.
/// It never consumes bytes past the end of the compressed stream, so it can sit
/// inside a pack file where the next entry follows immediately.
pub struct InflateReader<R> {
    /// The reader from which bytes should be decompressed.
    pub inner: R,
    /// The decompressor doing all the work.
    pub decompressor: Box<Decompress>,
    /// Whether the hash state tracks decompressed bytes.
    count_hash: bool,
    /// SHA-1 over the object header + decompressed payload.
    hash: Sha1,
    /// The zlib stream reported its end; further reads are EOF.
    finished: bool,
}

impl<R> InflateReader<R>
where
    R: BufRead,
{
    /// Inflate a whole object, seeding the hash with its `"<kind> <len>\0"`
    /// header so the finished digest is the object id.
    pub fn new(inner: R, kind: ObjectKind, size: usize) -> Self {
        let mut hash = Sha1::new();
        hash.update(kind.as_bytes());
        hash.update(b" ");
        hash.update(size.to_string().as_bytes());
        hash.update(b"\0");
        InflateReader {
            inner,
            hash,
            count_hash: true,
            decompressor: Box::new(Decompress::new(true)),
            finished: false,
        }
    }

    /// Inflate without hashing; delta payloads are not addressed by id.
    pub fn new_raw(inner: R) -> Self {
        InflateReader {
            inner,
            hash: Sha1::new(),
            count_hash: false,
            decompressor: Box::new(Decompress::new(true)),
            finished: false,
        }
    }

    /// Digest of everything hashed so far.
    pub fn finish_hash(self) -> ObjectId {
        let mut out = [0u8; 20];
        out.copy_from_slice(self.hash.finalize().as_ref());
        ObjectId(out)
    }

    /// Compressed bytes consumed from the inner reader so far.
    pub fn compressed_in(&self) -> u64 {
        self.decompressor.total_in()
    }
}

impl<R> io::Read for InflateReader<R>
where
    R: BufRead,
{
    /// Pull buffered input through the decompressor until the caller's slice
    /// is full or the zlib stream ends. Bytes the decompressor did not take
    /// stay in the inner reader for whatever follows the stream.
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.finished {
            return Ok(0);
        }
        let mut filled = 0usize;
        loop {
            let input = self.inner.fill_buf()?;
            let flush = if input.is_empty() {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let in_mark = self.decompressor.total_in();
            let out_mark = self.decompressor.total_out();
            let status = self
                .decompressor
                .decompress(input, &mut out[filled..], flush)
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid deflate data")
                })?;
            let taken = (self.decompressor.total_in() - in_mark) as usize;
            let produced = (self.decompressor.total_out() - out_mark) as usize;
            self.inner.consume(taken);
            filled += produced;

            if matches!(status, Status::StreamEnd) {
                self.finished = true;
                break;
            }
            if filled == out.len() {
                break;
            }
            if taken == 0 && produced == 0 {
                // Output space remains but the decompressor is starved: the
                // stream was cut off before its end marker.
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "deflate stream ended early",
                ));
            }
        }
        if self.count_hash {
            self.hash.update(&out[..filled]);
        }
        Ok(filled)
    }
}

/// Inflate a loose object: parse the `"<kind> <len>\0"` header, return the
/// kind and payload, and verify the payload length against the header.
pub fn inflate_loose(compressed: &[u8]) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
    let mut decompressor = Decompress::new(true);
    let mut out = Vec::with_capacity(compressed.len() * 2);
    let mut buf = [0u8; 8192];
    loop {
        let before = decompressor.total_out();
        let status = decompressor
            .decompress(
                &compressed[decompressor.total_in() as usize..],
                &mut buf,
                FlushDecompress::None,
            )
            .map_err(|_| {
                GvfsError::CorruptObject("<loose>".into(), "corrupt deflate stream".into())
            })?;
        out.extend_from_slice(&buf[..(decompressor.total_out() - before) as usize]);
        match status {
            Status::StreamEnd => break,
            Status::Ok => {
                // No forward progress with nothing left to feed is a
                // truncated stream, not a reason to spin.
                if decompressor.total_out() == before
                    && decompressor.total_in() as usize >= compressed.len()
                {
                    return Err(GvfsError::CorruptObject(
                        "<loose>".into(),
                        "truncated deflate stream".into(),
                    ));
                }
            }
            Status::BufError => {
                if decompressor.total_out() == before {
                    return Err(GvfsError::CorruptObject(
                        "<loose>".into(),
                        "deflate stream made no progress".into(),
                    ));
                }
            }
        }
    }

    let nul = out
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| GvfsError::CorruptObject("<loose>".into(), "missing header".into()))?;
    let header = std::str::from_utf8(&out[..nul])
        .map_err(|_| GvfsError::CorruptObject("<loose>".into(), "non-utf8 header".into()))?;
    let (kind_str, len_str) = header
        .split_once(' ')
        .ok_or_else(|| GvfsError::CorruptObject("<loose>".into(), "malformed header".into()))?;
    let kind = ObjectKind::from_str(kind_str)?;
    let len: usize = len_str
        .parse()
        .map_err(|_| GvfsError::CorruptObject("<loose>".into(), "bad length".into()))?;
    let payload = out.split_off(nul + 1);
    if payload.len() != len {
        return Err(GvfsError::CorruptObject(
            "<loose>".into(),
            format!("length mismatch: header {len}, payload {}", payload.len()),
        ));
    }
    Ok((kind, payload))
}

/// Deflate a full loose object (`"<kind> <len>\0"` header + payload).
pub fn deflate_loose(kind: ObjectKind, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(kind.as_bytes())?;
    encoder.write_all(b" ")?;
    encoder.write_all(data.len().to_string().as_bytes())?;
    encoder.write_all(b"\0")?;
    encoder.write_all(data)?;
    encoder.finish()
}

/// Deflate raw bytes with no object header. Used when re-serving a cached
/// object in the loose wire format.
pub fn deflate_raw(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut compressor = Compress::new(Compression::default(), true);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut buf = [0u8; 8192];
    loop {
        let before = compressor.total_out();
        let status = compressor
            .compress(
                &data[compressor.total_in() as usize..],
                &mut buf,
                FlushCompress::Finish,
            )
            .map_err(io::Error::other)?;
        out.extend_from_slice(&buf[..(compressor.total_out() - before) as usize]);
        if status == Status::StreamEnd {
            return Ok(out);
        }
    }
}
