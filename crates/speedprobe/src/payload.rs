/// Upload payload generation.
///
/// A payload is `n` random bytes, held in memory or in a temporary file that
/// is removed when the payload is dropped.

use std::io::{self, SeekFrom, Write};

use bytes::Bytes;
use rand::RngCore;
use speedprobe_types::UploadStorageType;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::protocol::PAYLOAD_FILE_CHUNK;

pub struct RandomPayloadGenerator;

impl RandomPayloadGenerator {
    pub fn generate(size: u64, storage: UploadStorageType) -> io::Result<Payload> {
        match storage {
            UploadStorageType::Ram => Self::in_memory(size),
            UploadStorageType::File => Self::file_backed(size),
        }
    }

    pub fn in_memory(size: u64) -> io::Result<Payload> {
        let len = usize::try_from(size).map_err(|_| {
            io::Error::new(io::ErrorKind::OutOfMemory, format!("payload of {size} bytes does not fit in memory"))
        })?;
        let mut buf = vec![0u8; len];
        rand::rng().fill_bytes(&mut buf);
        Ok(Payload {
            len: size,
            data: PayloadData::Memory(Bytes::from(buf)),
        })
    }

    /// Writes the payload to a temp file in fixed-size chunks.
    pub fn file_backed(size: u64) -> io::Result<Payload> {
        let mut temp = NamedTempFile::new()?;
        let mut rng = rand::rng();
        let mut chunk = vec![0u8; PAYLOAD_FILE_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(PAYLOAD_FILE_CHUNK as u64) as usize;
            rng.fill_bytes(&mut chunk[..n]);
            temp.as_file_mut().write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        temp.as_file_mut().flush()?;
        Ok(Payload {
            len: size,
            data: PayloadData::File { temp, reader: None },
        })
    }
}

pub struct Payload {
    len: u64,
    data: PayloadData,
}

enum PayloadData {
    Memory(Bytes),
    File {
        temp: NamedTempFile,
        reader: Option<tokio::fs::File>,
    },
}

impl Payload {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes `offset..offset + len`, clipped to the payload end.
    pub async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Bytes> {
        if offset >= self.len {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(len as u64).min(self.len);
        match &mut self.data {
            PayloadData::Memory(bytes) => Ok(bytes.slice(offset as usize..end as usize)),
            PayloadData::File { temp, reader } => {
                if reader.is_none() {
                    *reader = Some(tokio::fs::File::from_std(temp.reopen()?));
                }
                let Some(file) = reader.as_mut() else {
                    return Ok(Bytes::new());
                };
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; (end - offset) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}
