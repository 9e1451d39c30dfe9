//! Shared I/O utilities: counting readers, hashing writers, exact-read helpers,
//! and the atomic write-then-rename protocol used for everything that lands in
//! the shared object cache.

use std::{
    fs,
    io,
    io::{BufRead, Read, Write},
    path::Path,
};

use sha1::{Digest, Sha1};

pub fn read_bytes(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// A lightweight wrapper that counts bytes read from the underlying reader.
/// Used to know how much of a pack stream a decoder consumed.
pub struct CountingReader<R> {
    pub inner: R,
    pub bytes_read: u64,
}

impl<R> CountingReader<R> {
    /// Creates a new `CountingReader` wrapping the given reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.bytes_read += amt as u64;
        self.inner.consume(amt);
    }
}

/// A writer that tees everything through a SHA-1 state while forwarding to the
/// inner writer. Used when persisting a pack stream whose trailer hash we must
/// verify afterwards.
pub struct HashingWriter<W> {
    pub inner: W,
    hasher: Sha1,
    pub bytes_written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            bytes_written: 0,
        }
    }

    /// Consume the writer, returning the inner writer and the digest bytes.
    pub fn finish(self) -> (W, [u8; 20]) {
        let mut out = [0u8; 20];
        out.copy_from_slice(self.hasher.finalize().as_ref());
        (self.inner, out)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write `contents` to `dest` atomically: temp file in the same directory,
/// fsync, then rename over the destination. The temp name carries a random
/// suffix so concurrent writers never collide.
pub fn atomic_write(dest: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix("tmp_obj_")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Like [`atomic_write`] but keeps the existing file when one is already in
/// place. Object files are content-addressed, so an existing destination is
/// by definition the same bytes.
pub fn atomic_write_new(dest: &Path, contents: &[u8]) -> io::Result<()> {
    if dest.exists() {
        return Ok(());
    }
    atomic_write(dest, contents)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// CountingReader tracks how many bytes passed through.
    #[test]
    fn test_counting_reader() {
        let data = b"0123456789";
        let mut reader = CountingReader::new(Cursor::new(data));
        let got = read_bytes(&mut reader, 4).unwrap();
        assert_eq!(got, b"0123");
        assert_eq!(reader.bytes_read, 4);
        read_bytes(&mut reader, 6).unwrap();
        assert_eq!(reader.bytes_read, 10);
    }

    /// HashingWriter digest matches a one-shot SHA-1 of the same bytes.
    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"Hello, ").unwrap();
        w.write_all(b"world!").unwrap();
        let (inner, digest) = w.finish();
        assert_eq!(inner, b"Hello, world!");
        assert_eq!(
            hex::encode(digest),
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        );
    }

    /// atomic_write replaces the destination; atomic_write_new keeps it.
    #[test]
    fn test_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("aa").join("payload");

        atomic_write(&dest, b"first").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"first");

        atomic_write(&dest, b"second").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");

        atomic_write_new(&dest, b"third").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");

        // No leftover temp files after persisting.
        let names: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
