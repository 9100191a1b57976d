//! Zip encoder for sinks that cannot seek, such as a response body.
//!
//! Members are written as stored (uncompressed) entries with general purpose
//! bit 3 set: the CRC-32 and sizes follow the data in a data descriptor, so
//! no header ever has to be patched after the fact. Zip64 fields are used
//! for members of 4 GiB or more and for offsets or counts past the classic
//! limits.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::io::{self, Read, Write};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_END_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const END_SIG: u32 = 0x0605_4b50;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8_NAME: u16 = 1 << 11;
const METHOD_STORED: u16 = 0;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const MADE_BY_UNIX: u16 = 3 << 8;
const ZIP64_EXTRA_ID: u16 = 0x0001;
/// Regular file, mode 0600, in the high half of the external attributes.
const UNIX_FILE_ATTRS: u32 = 0o100600 << 16;

const U16_MARKER: u16 = u16::MAX;
const U32_MARKER: u32 = u32::MAX;
const COPY_BUF_LEN: usize = 64 * 1024;

/// MS-DOS date and time fields stored with every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosTimestamp {
    pub date: u16,
    pub time: u16,
}

impl DosTimestamp {
    /// DOS timestamps cover 1980..=2107 with two-second resolution.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let year = at.year().clamp(1980, 2107) as u16;
        Self {
            date: ((year - 1980) << 9) | ((at.month() as u16) << 5) | at.day() as u16,
            time: ((at.hour() as u16) << 11) | ((at.minute() as u16) << 5) | (at.second() as u16 / 2),
        }
    }
}

struct CentralEntry {
    name: Vec<u8>,
    crc: u32,
    size: u64,
    offset: u64,
}

/// Write adapter tracking the archive offset.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct ZipStreamWriter<W: Write> {
    sink: CountingWriter<W>,
    entries: Vec<CentralEntry>,
    modified: DosTimestamp,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(sink: W, modified: DosTimestamp) -> Self {
        Self {
            sink: CountingWriter {
                inner: sink,
                written: 0,
            },
            entries: Vec::new(),
            modified,
        }
    }

    /// Append one member of exactly `size` bytes read from `data`.
    ///
    /// Fails with `InvalidData` when `data` yields a different length.
    pub fn append(&mut self, name: &str, size: u64, data: &mut dyn Read) -> io::Result<()> {
        let name_len = u16::try_from(name.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "member name too long for zip")
        })?;
        let zip64 = size >= U32_MARKER as u64;
        let offset = self.sink.written;

        let mut header = Vec::with_capacity(30 + name.len() + 20);
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
        put_u16(&mut header, FLAG_DATA_DESCRIPTOR | FLAG_UTF8_NAME);
        put_u16(&mut header, METHOD_STORED);
        put_u16(&mut header, self.modified.time);
        put_u16(&mut header, self.modified.date);
        // CRC and sizes live in the data descriptor.
        put_u32(&mut header, 0);
        let size_field = if zip64 { U32_MARKER } else { 0 };
        put_u32(&mut header, size_field);
        put_u32(&mut header, size_field);
        put_u16(&mut header, name_len);
        put_u16(&mut header, if zip64 { 20 } else { 0 });
        header.extend_from_slice(name.as_bytes());
        if zip64 {
            put_u16(&mut header, ZIP64_EXTRA_ID);
            put_u16(&mut header, 16);
            put_u64(&mut header, 0);
            put_u64(&mut header, 0);
        }
        self.sink.write_all(&header)?;

        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut copied = 0u64;
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            hasher.update(&buf[..n]);
            self.sink.write_all(&buf[..n])?;
            copied += n as u64;
        }
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("member `{}` is {} bytes, expected {}", name, copied, size),
            ));
        }
        let crc = hasher.finalize();

        let mut descriptor = Vec::with_capacity(24);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc);
        if zip64 {
            put_u64(&mut descriptor, size);
            put_u64(&mut descriptor, size);
        } else {
            put_u32(&mut descriptor, size as u32);
            put_u32(&mut descriptor, size as u32);
        }
        self.sink.write_all(&descriptor)?;

        self.entries.push(CentralEntry {
            name: name.as_bytes().to_vec(),
            crc,
            size,
            offset,
        });
        Ok(())
    }

    /// Write the central directory and end records, flush, and hand the sink
    /// back.
    pub fn finish(mut self) -> io::Result<W> {
        let directory_start = self.sink.written;
        let mut directory = Vec::new();
        for entry in &self.entries {
            let mut extra = Vec::new();
            let size_field = if entry.size >= U32_MARKER as u64 {
                put_u64(&mut extra, entry.size);
                put_u64(&mut extra, entry.size);
                U32_MARKER
            } else {
                entry.size as u32
            };
            let offset_field = if entry.offset >= U32_MARKER as u64 {
                put_u64(&mut extra, entry.offset);
                U32_MARKER
            } else {
                entry.offset as u32
            };
            let version = if extra.is_empty() { VERSION_DEFAULT } else { VERSION_ZIP64 };

            put_u32(&mut directory, CENTRAL_HEADER_SIG);
            put_u16(&mut directory, MADE_BY_UNIX | version);
            put_u16(&mut directory, version);
            put_u16(&mut directory, FLAG_DATA_DESCRIPTOR | FLAG_UTF8_NAME);
            put_u16(&mut directory, METHOD_STORED);
            put_u16(&mut directory, self.modified.time);
            put_u16(&mut directory, self.modified.date);
            put_u32(&mut directory, entry.crc);
            put_u32(&mut directory, size_field);
            put_u32(&mut directory, size_field);
            put_u16(&mut directory, entry.name.len() as u16);
            put_u16(&mut directory, if extra.is_empty() { 0 } else { extra.len() as u16 + 4 });
            put_u16(&mut directory, 0); // comment
            put_u16(&mut directory, 0); // disk
            put_u16(&mut directory, 0); // internal attributes
            put_u32(&mut directory, UNIX_FILE_ATTRS);
            put_u32(&mut directory, offset_field);
            directory.extend_from_slice(&entry.name);
            if !extra.is_empty() {
                put_u16(&mut directory, ZIP64_EXTRA_ID);
                put_u16(&mut directory, extra.len() as u16);
                directory.extend_from_slice(&extra);
            }
        }
        self.sink.write_all(&directory)?;

        let directory_len = directory.len() as u64;
        let count = self.entries.len() as u64;
        let mut tail = Vec::with_capacity(98);
        if count >= U16_MARKER as u64
            || directory_len >= U32_MARKER as u64
            || directory_start >= U32_MARKER as u64
        {
            let zip64_end_offset = self.sink.written;
            put_u32(&mut tail, ZIP64_END_SIG);
            put_u64(&mut tail, 44);
            put_u16(&mut tail, MADE_BY_UNIX | VERSION_ZIP64);
            put_u16(&mut tail, VERSION_ZIP64);
            put_u32(&mut tail, 0);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, count);
            put_u64(&mut tail, count);
            put_u64(&mut tail, directory_len);
            put_u64(&mut tail, directory_start);

            put_u32(&mut tail, ZIP64_LOCATOR_SIG);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, zip64_end_offset);
            put_u32(&mut tail, 1);
        }
        put_u32(&mut tail, END_SIG);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, count.min(U16_MARKER as u64) as u16);
        put_u16(&mut tail, count.min(U16_MARKER as u64) as u16);
        put_u32(&mut tail, directory_len.min(U32_MARKER as u64) as u32);
        put_u32(&mut tail, directory_start.min(U32_MARKER as u64) as u32);
        put_u16(&mut tail, 0);
        self.sink.write_all(&tail)?;
        self.sink.flush()?;

        Ok(self.sink.inner)
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}
