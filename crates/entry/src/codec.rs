use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::{EntryError, NodeStateEntry};

/// Size of the `body_len` prefix in front of every record.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Largest body the reader will allocate for (64 MiB). Guards against OOM on
/// corrupt files.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

const FLAG_LAST_MODIFIED: u8 = 0b01;
const FLAG_ID: u8 = 0b10;

fn field_len(len: usize) -> Result<u32, EntryError> {
    if len > MAX_RECORD_BYTES {
        return Err(EntryError::TooLarge(len));
    }
    Ok(len as u32)
}

/// Appends the body of `entry` (no length prefix) to `out`.
pub fn encode_body(entry: &NodeStateEntry, out: &mut Vec<u8>) -> Result<(), EntryError> {
    let start = out.len();

    out.write_u32::<LittleEndian>(field_len(entry.path.len())?)?;
    out.extend_from_slice(entry.path.as_bytes());

    let mut flags = 0u8;
    if entry.last_modified.is_some() {
        flags |= FLAG_LAST_MODIFIED;
    }
    if entry.id.is_some() {
        flags |= FLAG_ID;
    }
    out.write_u8(flags)?;

    if let Some(lm) = entry.last_modified {
        out.write_i64::<LittleEndian>(lm)?;
    }
    if let Some(id) = &entry.id {
        out.write_u32::<LittleEndian>(field_len(id.len())?)?;
        out.extend_from_slice(id.as_bytes());
    }

    out.write_u32::<LittleEndian>(field_len(entry.payload.len())?)?;
    out.extend_from_slice(&entry.payload);

    let body_len = out.len() - start;
    if body_len > MAX_RECORD_BYTES {
        out.truncate(start);
        return Err(EntryError::TooLarge(body_len));
    }
    Ok(())
}

fn read_str<'a>(br: &mut &'a [u8], what: &str) -> Result<&'a str, EntryError> {
    let len = br
        .read_u32::<LittleEndian>()
        .map_err(|_| EntryError::Corrupt(format!("truncated {what} length")))? as usize;
    if len > br.len() {
        return Err(EntryError::Corrupt(format!(
            "{what} length {len} exceeds remaining {} bytes",
            br.len()
        )));
    }
    let rest: &'a [u8] = *br;
    let (head, tail) = rest.split_at(len);
    *br = tail;
    std::str::from_utf8(head).map_err(|_| EntryError::Corrupt(format!("{what} is not utf-8")))
}

/// Returns the path of a record body without decoding the rest of it.
pub fn body_path(body: &[u8]) -> Result<&str, EntryError> {
    let mut br = body;
    read_str(&mut br, "path")
}

/// Decodes a record body produced by [`encode_body`].
pub fn decode_body(body: &[u8]) -> Result<NodeStateEntry, EntryError> {
    let mut br = body;
    let path = read_str(&mut br, "path")?.to_string();

    let flags = br
        .read_u8()
        .map_err(|_| EntryError::Corrupt("missing flags".into()))?;
    if flags & !(FLAG_LAST_MODIFIED | FLAG_ID) != 0 {
        return Err(EntryError::Corrupt(format!("unknown flags {flags:#04x}")));
    }

    let last_modified = if flags & FLAG_LAST_MODIFIED != 0 {
        Some(
            br.read_i64::<LittleEndian>()
                .map_err(|_| EntryError::Corrupt("truncated last_modified".into()))?,
        )
    } else {
        None
    };
    let id = if flags & FLAG_ID != 0 {
        Some(read_str(&mut br, "id")?.to_string())
    } else {
        None
    };

    let payload_len = br
        .read_u32::<LittleEndian>()
        .map_err(|_| EntryError::Corrupt("truncated payload length".into()))?
        as usize;
    if payload_len != br.len() {
        return Err(EntryError::Corrupt(format!(
            "payload length {payload_len} does not match remaining {} bytes",
            br.len()
        )));
    }

    Ok(NodeStateEntry {
        path,
        payload: br.to_vec(),
        last_modified,
        id,
    })
}

/// Writes `[body_len][body]` to `w`.
pub fn write_record<W: Write>(w: &mut W, body: &[u8]) -> Result<(), EntryError> {
    w.write_u32::<LittleEndian>(field_len(body.len())?)?;
    w.write_all(body)?;
    Ok(())
}

/// Encodes `entry` and writes it as one record.
pub fn write_entry<W: Write>(w: &mut W, entry: &NodeStateEntry) -> Result<(), EntryError> {
    let mut body = Vec::with_capacity(64 + entry.path.len() + entry.payload.len());
    encode_body(entry, &mut body)?;
    write_record(w, &body)
}

/// Serializes entries into a reusable scratch buffer.
///
/// One writer per transform worker: the scratch allocation grows to the
/// largest entry seen and is then reused for every following entry.
#[derive(Debug, Default)]
pub struct EntryWriter {
    scratch: Vec<u8>,
}

impl EntryWriter {
    pub fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(4096),
        }
    }

    /// Returns the body bytes for `entry`. Valid until the next call.
    pub fn serialize(&mut self, entry: &NodeStateEntry) -> Result<&[u8], EntryError> {
        self.scratch.clear();
        encode_body(entry, &mut self.scratch)?;
        Ok(self.scratch.as_slice())
    }
}

/// Sequential reader over a stream of length-prefixed records.
///
/// Used for spill files during the merge and for reading the final output.
///
/// # Termination
///
/// - **Clean EOF** at a record boundary ends the stream (`Ok(None)`).
/// - **Truncated prefix or body** is reported as [`EntryError::Corrupt`]:
///   spill files are closed before they are read, so a short record always
///   means damage, never an in-progress write.
pub struct RecordReader<R: Read> {
    rdr: BufReader<R>,
    /// Reusable body buffer.
    body: Vec<u8>,
    records_read: u64,
}

impl RecordReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EntryError> {
        Ok(Self::from_reader(File::open(path)?))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            rdr: BufReader::new(reader),
            body: Vec::with_capacity(256),
            records_read: 0,
        }
    }

    /// Number of complete records returned so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Reads the next record body. The slice is valid until the next call.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>, EntryError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        let mut filled = 0;
        while filled < prefix.len() {
            match self.rdr.read(&mut prefix[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < prefix.len() {
            return Err(EntryError::Corrupt(format!(
                "truncated length prefix after record {}",
                self.records_read
            )));
        }

        let len = LittleEndian::read_u32(&prefix) as usize;
        if len > MAX_RECORD_BYTES {
            return Err(EntryError::TooLarge(len));
        }
        let index = self.records_read;
        self.body.clear();
        self.body.resize(len, 0);
        self.rdr.read_exact(&mut self.body).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                EntryError::Corrupt(format!(
                    "truncated body of record {index} ({len} bytes expected)"
                ))
            } else {
                EntryError::Io(e)
            }
        })?;
        self.records_read += 1;
        Ok(Some(self.body.as_slice()))
    }

    /// Reads and decodes the next entry.
    pub fn next_entry(&mut self) -> Result<Option<NodeStateEntry>, EntryError> {
        match self.next_record()? {
            Some(body) => decode_body(body).map(Some),
            None => Ok(None),
        }
    }
}
