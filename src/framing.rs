//! Accumulation buffer with cached delimiter scanning.
//!
//! A [`FramingBuffer`] collects the bytes received for one connection (or one
//! multiplexed pipeline) and lets the application take them out as frames:
//! by delimiter, by length, or whatever is there.
//!
//! Delimiter search is amortized across partial reads. When a delimiter is not
//! found, the buffer remembers how far it has looked so a later call with the
//! same delimiter only examines the newly appended suffix plus the
//! `delimiter.len() - 1` bytes that could start a match straddling the old
//! end:
//!
//! ```text
//!   append("1234")  scan [0..4)        -> not found, scan_offset = 3
//!   append("\r\n")  scan [3..6)        -> found at 4
//!                        ^ overlap of delimiter.len() - 1
//! ```
//!
//! Every read either returns a complete result or [`Error::Incomplete`]
//! without consuming anything. Requests larger than the configured max read
//! size fail with [`Error::MaxReadSizeExceeded`].
//!
//! ```rust
//! use millstream::framing::FramingBuffer;
//!
//! let mut buf = FramingBuffer::new(1024);
//! buf.append(b"GET / HTTP/1.1\r");
//! assert!(buf.read_by_delimiter(b"\r\n").unwrap_err().is_incomplete());
//! buf.append(b"\nHost: x\r\n");
//! assert_eq!(&buf.read_by_delimiter(b"\r\n").unwrap()[..], b"GET / HTTP/1.1");
//! assert_eq!(buf.available(), 9);
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FramingBuffer {
    buf: BytesMut,
    max_read_size: usize,
    scan_offset: usize,
    pending_delimiter: Option<Vec<u8>>,
    // bytes consumed since the read mark was set
    mark: Option<BytesMut>,
    #[cfg(test)]
    scanned: usize,
}

impl FramingBuffer {
    pub fn new(max_read_size: usize) -> Self {
        Self::with_capacity(0, max_read_size)
    }

    pub fn with_capacity(capacity: usize, max_read_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            max_read_size,
            scan_offset: 0,
            pending_delimiter: None,
            mark: None,
            #[cfg(test)]
            scanned: 0,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, unconsumed bytes.
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    pub fn set_max_read_size(&mut self, max_read_size: usize) {
        self.max_read_size = max_read_size;
    }

    /// Returns the bytes before the first occurrence of `delimiter` and
    /// consumes them together with the delimiter.
    pub fn read_by_delimiter(&mut self, delimiter: &[u8]) -> Result<Bytes> {
        self.read_delimited(delimiter, self.max_read_size)
    }

    /// Like [`read_by_delimiter`](Self::read_by_delimiter), failing with
    /// `MaxReadSizeExceeded` once `max_length` bytes have been examined
    /// without finding the delimiter.
    pub fn read_by_delimiter_max(&mut self, delimiter: &[u8], max_length: usize) -> Result<Bytes> {
        self.read_delimited(delimiter, max_length.min(self.max_read_size))
    }

    pub fn read_string_by_delimiter(&mut self, delimiter: &[u8]) -> Result<String> {
        // validate before consuming so a bad frame stays buffered
        let pos = self.index_of(delimiter, self.max_read_size)?;
        let line = std::str::from_utf8(&self.buf[..pos])
            .map_err(|e| Error::Protocol(format!("frame is not valid UTF-8: {}", e)))?
            .to_owned();
        self.take_delimited(pos, delimiter.len());
        Ok(line)
    }

    /// Returns exactly `length` bytes, or `Incomplete` if fewer are buffered.
    pub fn read_by_length(&mut self, length: usize) -> Result<Bytes> {
        if length > self.max_read_size {
            return Err(Error::MaxReadSizeExceeded {
                max: self.max_read_size,
                requested: length,
            });
        }
        if self.buf.len() < length {
            return Err(Error::Incomplete);
        }
        Ok(self.consume(length).freeze())
    }

    /// Consumes and returns everything buffered, possibly nothing.
    pub fn read_available(&mut self) -> Bytes {
        let len = self.buf.len();
        self.consume(len).freeze()
    }

    /// Returns the first `length` buffered bytes without consuming them.
    pub fn peek(&self, length: usize) -> Result<&[u8]> {
        if self.buf.len() < length {
            return Err(Error::Incomplete);
        }
        Ok(&self.buf[..length])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_by_length(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_by_length(2)?.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_by_length(4)?.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_by_length(4)?.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.read_by_length(8)?.get_u64())
    }

    /// Starts recording consumed bytes so they can be restored by
    /// [`reset_to_read_mark`](Self::reset_to_read_mark). Replaces any
    /// previous mark. The mark is dropped once more than the max read size
    /// has been consumed past it.
    pub fn mark_read_position(&mut self) {
        self.mark = Some(BytesMut::new());
    }

    /// Puts every byte consumed since the mark back in front of the buffer.
    /// The mark stays set at the restored position. Returns `false` if no
    /// mark was set.
    pub fn reset_to_read_mark(&mut self) -> bool {
        match self.mark.as_mut() {
            Some(consumed) => {
                if !consumed.is_empty() {
                    let mut restored = consumed.split();
                    restored.extend_from_slice(&self.buf);
                    self.buf = restored;
                    self.reset_scan();
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_read_mark(&mut self) {
        self.mark = None;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.mark = None;
        self.reset_scan();
    }

    fn read_delimited(&mut self, delimiter: &[u8], max: usize) -> Result<Bytes> {
        let pos = self.index_of(delimiter, max)?;
        Ok(self.take_delimited(pos, delimiter.len()))
    }

    fn take_delimited(&mut self, pos: usize, delimiter_len: usize) -> Bytes {
        let frame = self.consume(pos + delimiter_len).freeze();
        self.reset_scan();
        frame.slice(..pos)
    }

    /// Position of the first occurrence of `delimiter`, scanning only bytes
    /// not examined by a previous unsuccessful search for the same delimiter.
    fn index_of(&mut self, delimiter: &[u8], max: usize) -> Result<usize> {
        if delimiter.is_empty() {
            return Err(Error::Configuration("delimiter must not be empty".into()));
        }
        if self.pending_delimiter.as_deref() != Some(delimiter) {
            self.pending_delimiter = Some(delimiter.to_vec());
            self.scan_offset = 0;
        }

        let len = self.buf.len();
        let start = self.scan_offset;
        let found = if len >= start + delimiter.len() {
            #[cfg(test)]
            {
                self.scanned += len - start;
            }
            self.buf[start..]
                .windows(delimiter.len())
                .position(|window| window == delimiter)
                .map(|i| start + i)
        } else {
            None
        };

        match found {
            Some(pos) if pos > max => Err(Error::MaxReadSizeExceeded { max, requested: pos }),
            Some(pos) => Ok(pos),
            None => {
                self.scan_offset = self.scan_offset.max((len + 1).saturating_sub(delimiter.len()));
                if len >= max + delimiter.len() {
                    Err(Error::MaxReadSizeExceeded { max, requested: len })
                } else {
                    Err(Error::Incomplete)
                }
            }
        }
    }

    fn consume(&mut self, n: usize) -> BytesMut {
        let taken = self.buf.split_to(n);
        let recorded = self.mark.as_ref().map(|consumed| consumed.len() + taken.len());
        match recorded {
            // a mark never restores more than one max-size read
            Some(len) if len > self.max_read_size => {
                debug!(recorded = len, "read mark dropped");
                self.mark = None;
            }
            Some(_) => {
                if let Some(consumed) = self.mark.as_mut() {
                    consumed.extend_from_slice(&taken);
                }
            }
            None => {}
        }
        self.scan_offset = self.scan_offset.saturating_sub(n);
        taken
    }

    fn reset_scan(&mut self) {
        self.scan_offset = 0;
        self.pending_delimiter = None;
    }
}

impl Default for FramingBuffer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_READ_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiter_across_appends() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"123456");
        assert_eq!(buf.available(), 6);
        buf.append(b"78901");
        assert_eq!(buf.available(), 11);
        buf.append(b"234");
        assert_eq!(buf.available(), 14);
        assert!(buf.read_by_delimiter(b"\r\n").unwrap_err().is_incomplete());
        assert_eq!(buf.available(), 14);

        buf.append(b"\r\n");
        let frame = buf.read_by_delimiter(b"\r\n").unwrap();
        assert_eq!(&frame[..], b"12345678901234");
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn test_delimiter_split_between_appends() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"hello\r");
        assert!(buf.read_by_delimiter(b"\r\n").unwrap_err().is_incomplete());
        buf.append(b"\nworld");
        assert_eq!(&buf.read_by_delimiter(b"\r\n").unwrap()[..], b"hello");
        assert_eq!(buf.available(), 5);
    }

    #[test]
    fn test_fragmented_appends_match_single_append() {
        let payload = b"alpha<END>beta<END>gamma<END>";
        let delimiter = b"<END>";

        let mut whole = FramingBuffer::new(1024);
        whole.append(payload);
        let mut expected = Vec::new();
        while let Ok(frame) = whole.read_by_delimiter(delimiter) {
            expected.push(frame);
        }

        for chunk in 1..payload.len() {
            let mut buf = FramingBuffer::new(1024);
            let mut frames = Vec::new();
            for piece in payload.chunks(chunk) {
                buf.append(piece);
                while let Ok(frame) = buf.read_by_delimiter(delimiter) {
                    frames.push(frame);
                }
            }
            assert_eq!(frames, expected, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_rescan_is_bounded_by_suffix_and_overlap() {
        let delimiter = b"\r\n\r\n";
        let mut buf = FramingBuffer::new(1 << 20);
        let mut previous_len = 0;

        for _ in 0..50 {
            buf.append(b"0123456789");
            let before = buf.scanned;
            assert!(buf.read_by_delimiter(delimiter).is_err());
            let rescanned = buf.scanned - before;
            let new_bytes = buf.available() - previous_len;
            assert!(rescanned <= new_bytes + delimiter.len() - 1);
            previous_len = buf.available();
        }
        buf.append(delimiter);
        assert_eq!(buf.read_by_delimiter(delimiter).unwrap().len(), 500);
    }

    #[test]
    fn test_delimiter_change_resets_scan() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"a;b\n");
        assert!(buf.read_by_delimiter(b"|").is_err());
        assert_eq!(&buf.read_by_delimiter(b";").unwrap()[..], b"a");
        assert_eq!(&buf.read_by_delimiter(b"\n").unwrap()[..], b"b");
    }

    #[test]
    fn test_read_by_length() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"abcdef");

        let before = buf.available();
        let data = buf.read_by_length(4).unwrap();
        assert_eq!(&data[..], b"abcd");
        assert_eq!(buf.available(), before - 4);

        assert!(buf.read_by_length(3).unwrap_err().is_incomplete());
        assert_eq!(buf.available(), 2);
        assert_eq!(&buf.read_available()[..], b"ef");
        assert!(buf.read_available().is_empty());
    }

    #[test]
    fn test_length_read_keeps_scan_cache_consistent() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"xxxxabc");
        assert!(buf.read_by_delimiter(b"\n").is_err());
        buf.read_by_length(4).unwrap();
        buf.append(b"\n");
        assert_eq!(&buf.read_by_delimiter(b"\n").unwrap()[..], b"abc");
    }

    #[test]
    fn test_max_read_size() {
        let mut buf = FramingBuffer::new(8);
        assert!(matches!(
            buf.read_by_length(9),
            Err(Error::MaxReadSizeExceeded { max: 8, requested: 9 })
        ));

        buf.append(b"0123456789");
        assert!(matches!(
            buf.read_by_delimiter(b"\n"),
            Err(Error::MaxReadSizeExceeded { .. })
        ));
        assert_eq!(buf.available(), 10);
    }

    #[test]
    fn test_read_by_delimiter_max() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"abcdef");
        assert!(buf.read_by_delimiter_max(b"\n", 10).unwrap_err().is_incomplete());
        assert!(matches!(
            buf.read_by_delimiter_max(b"\n", 3),
            Err(Error::MaxReadSizeExceeded { max: 3, .. })
        ));
        buf.append(b"\n");
        assert!(buf.read_by_delimiter_max(b"\n", 5).is_err());
        assert_eq!(&buf.read_by_delimiter_max(b"\n", 6).unwrap()[..], b"abcdef");
    }

    #[test]
    fn test_mark_and_reset() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"HEAD\r\nbody");

        assert!(!buf.reset_to_read_mark());
        buf.mark_read_position();
        assert_eq!(&buf.read_by_delimiter(b"\r\n").unwrap()[..], b"HEAD");
        assert!(buf.read_by_length(10).is_err());

        assert!(buf.reset_to_read_mark());
        assert_eq!(buf.available(), 10);
        buf.remove_read_mark();
        assert_eq!(&buf.read_string_by_delimiter(b"\r\n").unwrap(), "HEAD");
        assert!(!buf.reset_to_read_mark());
    }

    #[test]
    fn test_mark_dropped_past_max_read_size() {
        let mut buf = FramingBuffer::new(8);
        buf.mark_read_position();
        buf.append(b"abcdefgh");
        buf.read_by_length(6).unwrap();
        assert!(buf.reset_to_read_mark());
        assert_eq!(buf.available(), 8);

        buf.append(b"ijklmnop");
        for _ in 0..4 {
            buf.read_by_length(4).unwrap();
        }
        assert!(!buf.reset_to_read_mark());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_string_by_delimiter() {
        let mut buf = FramingBuffer::new(1024);
        buf.append("grüße\nrest".as_bytes());
        assert_eq!(buf.read_string_by_delimiter(b"\n").unwrap(), "grüße");
        assert_eq!(buf.available(), 4);
    }

    #[test]
    fn test_numeric_reads_are_big_endian() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(&[0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(buf.read_u8().unwrap(), 1);
        assert_eq!(buf.read_u16().unwrap(), 2);
        assert_eq!(buf.read_u32().unwrap(), 3);
        assert_eq!(buf.read_i32().unwrap(), -2);
        assert!(buf.read_u64().unwrap_err().is_incomplete());
    }

    #[test]
    fn test_invalid_utf8_stays_buffered() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(&[0xff, 0xfe, b'\n']);
        assert!(matches!(
            buf.read_string_by_delimiter(b"\n"),
            Err(Error::Protocol(_))
        ));
        assert_eq!(buf.available(), 3);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = FramingBuffer::new(1024);
        buf.append(b"abc");
        assert_eq!(buf.peek(2).unwrap(), b"ab");
        assert!(buf.peek(4).unwrap_err().is_incomplete());
        assert_eq!(buf.available(), 3);
    }
}
