//! Streaming netascii translation (RFC 764 line endings over RFC 1350).
//!
//! The wire form uses CR LF for a line break and CR NUL for a carriage
//! return that is not part of a line break. Both translators stream: a file
//! is never buffered whole, and a CR that lands on a chunk boundary is
//! carried into the next call so the pair is recognised across the split.
//!
//! Two compatibility quirks are kept on purpose. On the wire, `LF CR` is
//! translated as two independent bytes (`CR LF` then, if nothing follows,
//! `CR NUL`). On the way to disk, a CR followed by a byte other than LF or
//! NUL is dropped and only the following byte is written; this is the
//! inverse widely shipped by existing implementations, asymmetric as it is
//! with the read side.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Local bytes in, wire netascii out.
///
/// Translation can grow the stream (every LF becomes two bytes), so a block
/// request may translate more than it can return; the excess waits in a
/// small output carry for the next call.
pub struct NetasciiReader<R> {
    inner: R,
    /// Translated bytes not yet handed out.
    carry: VecDeque<u8>,
    /// A raw CR seen at the end of a window, waiting for its follower.
    pending_cr: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> NetasciiReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            carry: VecDeque::with_capacity(crate::BLOCK_SIZE + 2),
            pending_cr: false,
            eof: false,
        }
    }

    /// Produce up to `want` wire bytes.
    ///
    /// `Ok(None)` means the stream is finished: the source hit EOF and no
    /// carried state remains. A `Some` shorter than `want` (empty included)
    /// is an ordinary short block.
    pub async fn read_block(&mut self, want: usize) -> io::Result<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(want + 2);

        loop {
            while out.len() < want {
                match self.carry.pop_front() {
                    Some(b) => out.push(b),
                    None => break,
                }
            }
            if out.len() >= want || (self.eof && !self.pending_cr) {
                break;
            }

            // Raw reads are bounded by what is still missing; at most one
            // byte of lookahead beyond the request is pulled in.
            let budget = want + 1 - out.len();
            let mut raw = vec![0u8; budget];
            let n = self.inner.read(&mut raw).await?;
            if n == 0 {
                self.eof = true;
                if self.pending_cr {
                    // A CR with nothing after it is a lone CR.
                    self.pending_cr = false;
                    self.carry.push_back(CR);
                    self.carry.push_back(NUL);
                }
                continue;
            }
            for &b in &raw[..n] {
                self.translate(b);
            }
        }

        if out.is_empty() && self.eof && self.carry.is_empty() && !self.pending_cr {
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn translate(&mut self, b: u8) {
        if self.pending_cr {
            self.pending_cr = false;
            if b == LF {
                self.carry.push_back(CR);
                self.carry.push_back(LF);
                return;
            }
            // Lone CR; the follower is processed on its own below.
            self.carry.push_back(CR);
            self.carry.push_back(NUL);
        }
        match b {
            LF => {
                self.carry.push_back(CR);
                self.carry.push_back(LF);
            }
            CR => self.pending_cr = true,
            other => self.carry.push_back(other),
        }
    }
}

/// Wire netascii in, local bytes out.
///
/// The host line terminator is whatever the caller materialises line breaks
/// with on this system; it is injected rather than assumed so the translator
/// itself stays platform-neutral.
pub struct NetasciiWriter<W> {
    inner: W,
    line_ending: Vec<u8>,
    /// A wire CR seen at the end of a block, waiting for its follower.
    pending_cr: bool,
}

impl<W: AsyncWrite + Unpin> NetasciiWriter<W> {
    pub fn new(inner: W, line_ending: &[u8]) -> Self {
        Self {
            inner,
            line_ending: line_ending.to_vec(),
            pending_cr: false,
        }
    }

    pub async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = Vec::with_capacity(data.len() + self.line_ending.len());
        for &b in data {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => out.extend_from_slice(&self.line_ending),
                    NUL => out.push(CR),
                    other => out.push(other),
                }
            } else if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        if !out.is_empty() {
            self.inner.write_all(&out).await?;
        }
        Ok(())
    }

    /// Flush the carry (a dangling CR is written as-is) and the sink.
    pub async fn finish(&mut self) -> io::Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.inner.write_all(&[CR]).await?;
        }
        self.inner.flush().await
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Hands the source out one byte per read, so every chunk boundary the
    /// translator can see is exercised.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl Trickle {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() {
                let b = self.data[self.pos];
                self.pos += 1;
                buf.put_slice(&[b]);
            }
            Poll::Ready(Ok(()))
        }
    }

    async fn read_all(data: &[u8], want: usize) -> Vec<u8> {
        let mut reader = NetasciiReader::new(data);
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_block(want).await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    async fn write_all(data: &[u8], chunk: usize, line_ending: &[u8]) -> Vec<u8> {
        let mut writer = NetasciiWriter::new(Vec::new(), line_ending);
        for piece in data.chunks(chunk.max(1)) {
            writer.write_block(piece).await.unwrap();
        }
        writer.finish().await.unwrap();
        writer.get_ref().clone()
    }

    #[tokio::test]
    async fn lf_becomes_cr_lf() {
        assert_eq!(read_all(b"a\nb", 512).await, b"a\r\nb");
        assert_eq!(read_all(b"\n\n\n", 512).await, b"\r\n\r\n\r\n");
    }

    #[tokio::test]
    async fn lone_cr_becomes_cr_nul() {
        assert_eq!(read_all(b"a\rb", 512).await, b"a\r\0b");
        assert_eq!(read_all(b"\r", 512).await, b"\r\0");
    }

    #[tokio::test]
    async fn cr_lf_stays_cr_lf() {
        assert_eq!(read_all(b"a\r\nb", 512).await, b"a\r\nb");
    }

    #[tokio::test]
    async fn lf_cr_is_two_independent_bytes() {
        assert_eq!(read_all(b"\n\r", 512).await, b"\r\n\r\0");
    }

    #[tokio::test]
    async fn cr_lf_split_by_the_source_still_pairs_up() {
        // One raw byte per read: the CR always arrives without its LF.
        let mut reader = NetasciiReader::new(Trickle::new(b"x\r\ny"));
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_block(512).await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"x\r\ny");
    }

    #[tokio::test]
    async fn cr_lf_split_by_the_block_boundary_still_pairs_up() {
        // want=2 forces the CR to be the last byte of a block window.
        for want in 1..6 {
            assert_eq!(
                read_all(b"ab\r\ncd", want).await,
                b"ab\r\ncd",
                "want={want}"
            );
        }
    }

    #[tokio::test]
    async fn expansion_overflow_is_carried_to_the_next_block() {
        // Three LFs expand to six wire bytes; a four-byte window splits them.
        let mut reader = NetasciiReader::new(&b"\n\n\n"[..]);
        let first = reader.read_block(4).await.unwrap().unwrap();
        assert_eq!(first, b"\r\n\r\n");
        let second = reader.read_block(4).await.unwrap().unwrap();
        assert_eq!(second, b"\r\n");
        assert!(reader.read_block(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_source_reports_end_immediately() {
        let mut reader = NetasciiReader::new(&b""[..]);
        assert!(reader.read_block(512).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exact_window_fill_then_end() {
        // Translated length is exactly the window; the next call is the
        // end-of-stream marker, not an error.
        let mut reader = NetasciiReader::new(&b"ab"[..]);
        let first = reader.read_block(2).await.unwrap().unwrap();
        assert_eq!(first, b"ab");
        assert!(reader.read_block(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_maps_cr_lf_to_host_terminator() {
        assert_eq!(write_all(b"a\r\nb", 512, b"\n").await, b"a\nb");
        assert_eq!(write_all(b"a\r\nb", 512, b"\r\n").await, b"a\r\nb");
    }

    #[tokio::test]
    async fn writer_maps_cr_nul_to_cr() {
        assert_eq!(write_all(b"a\r\0b", 512, b"\n").await, b"a\rb");
    }

    #[tokio::test]
    async fn writer_drops_cr_before_other_bytes() {
        assert_eq!(write_all(b"a\rxb", 512, b"\n").await, b"axb");
    }

    #[tokio::test]
    async fn writer_carries_cr_across_blocks() {
        // Every chunking of the same wire bytes writes the same file.
        for chunk in 1..6 {
            assert_eq!(
                write_all(b"ab\r\ncd\r\0e", chunk, b"\n").await,
                b"ab\ncd\re",
                "chunk={chunk}"
            );
        }
    }

    #[tokio::test]
    async fn writer_flushes_dangling_cr_on_finish() {
        assert_eq!(write_all(b"ab\r", 512, b"\n").await, b"ab\r");
    }

    #[tokio::test]
    async fn round_trip_preserves_text_without_stray_cr() {
        let source = b"one\ntwo\nthree\n\nfour";
        let wire = read_all(source, 512).await;
        let back = write_all(&wire, 512, b"\n").await;
        assert_eq!(back, source);
    }

    #[tokio::test]
    async fn round_trip_survives_any_block_size() {
        let source = b"alpha\nbeta\rgamma\r\ndelta\n";
        for want in 1..10 {
            let wire = read_all(source, want).await;
            // The reader's inverse is fixed regardless of how the wire
            // stream was blocked.
            assert_eq!(read_all(source, 512).await, wire, "want={want}");
        }
    }
}
