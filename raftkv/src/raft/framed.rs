//! Buffered framed record I/O.
//!
//! Changelog and snapshot files are sequences of length-prefixed protobuf
//! records behind a fixed in-memory buffer with explicit flush and durable
//! sync. Length prefixes and file headers are little-endian i64.

use prost::Message;
use std::fs::File;
use std::io::{self, Read, Write};

/// Size of the in-memory buffer.
const BUF_SIZE: usize = 128 << 10;

/// A record-oriented wrapper over a file.
///
/// A given instance is used either for writing or for reading, never both.
pub struct FramedFile {
    file: File,
    buf: Box<[u8]>,
    data: usize,
    consumed: usize,
}

impl FramedFile {
    pub fn new(file: File) -> Self {
        FramedFile {
            file,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            data: 0,
            consumed: 0,
        }
    }

    /// Reserve `sz` bytes in the write buffer, flushing first if it would
    /// overflow. Returns the offset of the reserved region.
    fn reserve(&mut self, sz: usize) -> io::Result<usize> {
        if sz > BUF_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record exceeds buffer capacity",
            ));
        }
        if self.data + sz > BUF_SIZE {
            self.flush()?;
        }
        let ptr = self.data;
        self.data += sz;
        Ok(ptr)
    }

    /// Make `sz` contiguous bytes available in the read buffer, compacting
    /// the consumed prefix and refilling from the file. Returns the offset of
    /// the fetched region, or `None` when the file ends first.
    fn fetch(&mut self, sz: usize) -> io::Result<Option<usize>> {
        if sz > BUF_SIZE {
            return Ok(None);
        }
        if self.consumed + sz > self.data {
            self.buf.copy_within(self.consumed..self.data, 0);
            self.data -= self.consumed;
            self.consumed = 0;
            while self.data < sz {
                let read = self.file.read(&mut self.buf[self.data..])?;
                if read == 0 {
                    break;
                }
                self.data += read;
            }
        }
        if self.consumed + sz > self.data {
            return Ok(None);
        }
        let ptr = self.consumed;
        self.consumed += sz;
        Ok(Some(ptr))
    }

    pub fn write_i64(&mut self, val: i64) -> io::Result<()> {
        let ptr = self.reserve(8)?;
        self.buf[ptr..ptr + 8].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    pub fn read_i64(&mut self) -> io::Result<Option<i64>> {
        match self.fetch(8)? {
            Some(ptr) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[ptr..ptr + 8]);
                Ok(Some(i64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Append a length-prefixed record to the write buffer.
    pub fn write_record<M: Message>(&mut self, record: &M) -> io::Result<()> {
        let payload = record.encode_to_vec();
        self.write_i64(payload.len() as i64)?;
        let ptr = self.reserve(payload.len())?;
        self.buf[ptr..ptr + payload.len()].copy_from_slice(&payload);
        Ok(())
    }

    /// Read the next record. `None` on clean EOF, a truncated tail, an
    /// over-long frame or an undecodable payload.
    pub fn read_record<M: Message + Default>(&mut self) -> io::Result<Option<M>> {
        let len = match self.read_i64()? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len < 0 || len as usize > BUF_SIZE {
            return Ok(None);
        }
        let ptr = match self.fetch(len as usize)? {
            Some(ptr) => ptr,
            None => return Ok(None),
        };
        Ok(M::decode(&self.buf[ptr..ptr + len as usize]).ok())
    }

    /// Write the buffered bytes through to the file.
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.write_all(&self.buf[..self.data])?;
        self.data = 0;
        self.consumed = 0;
        Ok(())
    }

    /// Flush and force the file contents to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::pb::{LogRecord, Operation};
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn record(ts: i64, key: &str, value: &str) -> LogRecord {
        LogRecord {
            ts,
            operations: vec![Operation {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            }],
        }
    }

    fn writer(path: &std::path::Path) -> FramedFile {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .unwrap();
        FramedFile::new(file)
    }

    fn reader(path: &std::path::Path) -> FramedFile {
        FramedFile::new(File::open(path).unwrap())
    }

    #[test]
    fn test_i64_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ints");

        let mut out = writer(&path);
        out.write_i64(-1).unwrap();
        out.write_i64(0).unwrap();
        out.write_i64(i64::MAX).unwrap();
        out.sync().unwrap();

        let mut input = reader(&path);
        assert_eq!(input.read_i64().unwrap(), Some(-1));
        assert_eq!(input.read_i64().unwrap(), Some(0));
        assert_eq!(input.read_i64().unwrap(), Some(i64::MAX));
        assert_eq!(input.read_i64().unwrap(), None);
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records");

        let mut out = writer(&path);
        out.write_record(&record(0, "k1", "v1")).unwrap();
        out.write_record(&record(1, "k2", "v2")).unwrap();
        out.sync().unwrap();

        let mut input = reader(&path);
        assert_eq!(input.read_record::<LogRecord>().unwrap(), Some(record(0, "k1", "v1")));
        assert_eq!(input.read_record::<LogRecord>().unwrap(), Some(record(1, "k2", "v2")));
        assert_eq!(input.read_record::<LogRecord>().unwrap(), None);
    }

    #[test]
    fn test_truncated_tail_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("truncated");

        let mut out = writer(&path);
        out.write_record(&record(0, "k1", "v1")).unwrap();
        out.write_record(&record(1, "k2", "v2")).unwrap();
        out.sync().unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3).unwrap();

        let mut input = reader(&path);
        assert_eq!(input.read_record::<LogRecord>().unwrap(), Some(record(0, "k1", "v1")));
        assert_eq!(input.read_record::<LogRecord>().unwrap(), None);
    }

    #[test]
    fn test_many_records_cross_buffer_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large");
        let value = "x".repeat(300);

        let mut out = writer(&path);
        for ts in 0..1000 {
            out.write_record(&record(ts, &format!("key-{}", ts), &value)).unwrap();
        }
        out.sync().unwrap();

        let mut input = reader(&path);
        for ts in 0..1000 {
            let rec: LogRecord = input.read_record().unwrap().unwrap();
            assert_eq!(rec.ts, ts);
            assert_eq!(rec.operations[0].key, format!("key-{}", ts).into_bytes());
        }
        assert_eq!(input.read_record::<LogRecord>().unwrap(), None);
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oversized");

        let mut out = writer(&path);
        let huge = record(0, "k", &"x".repeat(BUF_SIZE));
        assert!(out.write_record(&huge).is_err());
    }
}
