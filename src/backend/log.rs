use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::encoding::bincode;
use crate::error::Result;

/// A single mutation recorded in the commit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Put {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: String,
        key: Vec<u8>,
    },
}

/// Append-only log of committed batches.
///
/// Each committed batch is one framed record:
/// `[length: u32 BE][checksum: u64 BE][payload]`, where the payload is the
/// serialized list of operations and the checksum covers the payload.
/// A record that fails its checksum, or that is cut short, marks a torn tail
/// from a crash mid-append; replay stops there and truncates the file back
/// to the last complete record.
pub struct CommitLog {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: bool,
}

impl CommitLog {
    pub fn open(path: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file.try_clone()?);
        writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            writer,
            path,
            fsync,
        })
    }

    /// Appends one batch and makes it durable.
    pub fn append(&mut self, ops: &[LogOp]) -> Result<()> {
        let payload = bincode::serialize(&ops);

        let mut digest = crc64fast::Digest::new();
        digest.write(&payload);
        let checksum = digest.sum64();

        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_u64::<BigEndian>(checksum)?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        if self.fsync {
            self.file.sync_all()?;
        }

        Ok(())
    }

    /// Replays every complete batch from the start of the log. If a torn
    /// record is found, the file is truncated back to the end of the last
    /// complete record and replay returns what was recovered.
    pub fn replay(&mut self) -> Result<Vec<Vec<LogOp>>> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(0))?;

        let mut batches = Vec::new();
        let mut good_offset = 0u64;
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(ops)) => {
                    batches.push(ops);
                    good_offset = reader.stream_position()?;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset = good_offset,
                        error = %err,
                        "truncating torn commit log tail"
                    );
                    self.file.set_len(good_offset)?;
                    self.writer.seek(SeekFrom::Start(good_offset))?;
                    break;
                }
            }
        }

        Ok(batches)
    }

    fn read_record(reader: &mut File) -> Result<Option<Vec<LogOp>>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut checksum_buf = [0u8; 8];
        reader.read_exact(&mut checksum_buf)?;
        let stored_checksum = u64::from_be_bytes(checksum_buf);

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut digest = crc64fast::Digest::new();
        digest.write(&payload);
        if digest.sum64() != stored_checksum {
            return Err(crate::errdata!(
                "commit log checksum mismatch: computed {}, stored {}",
                digest.sum64(),
                stored_checksum
            ));
        }

        Ok(Some(bincode::deserialize(&payload)?))
    }
}
