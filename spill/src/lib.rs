#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # spill
//!
//! A single-reader / single-writer on-disk FIFO holding compressed write
//! batches for one backend while it is unreachable.
//!
//! Two files per queue: `<name>.dat` is an append-log of records, each a
//! big-endian `u32` length followed by that many bytes of gzip payload;
//! `<name>.rec` holds two little-endian `u64` offsets, the producer head and
//! the consumer tail. A record is fsync'd before the producer head advances
//! past it, and only `update_meta` moves the consumer tail, so a crash at
//! any point leaves the tail on a committed record boundary.

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// File extension for the record append-log.
const DATA_FILE_EXTENSION: &str = "dat";
/// File extension for the offsets file.
const META_FILE_EXTENSION: &str = "rec";
/// Two little-endian u64 offsets.
const META_LEN: usize = 16;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    UnableToOpenFile { source: io::Error, path: PathBuf },

    UnableToWriteLength { source: io::Error },

    UnableToWriteData { source: io::Error },

    UnableToSync { source: io::Error },

    UnableToSeek { source: io::Error },

    UnableToWriteMeta { source: io::Error },

    UnableToReadMeta { source: io::Error },

    UnableToReadData { source: io::Error },

    UnableToReadFileMetadata { source: io::Error },

    UnableToTruncate { source: io::Error },

    #[snafu(display("record at offset {offset} is truncated"))]
    TruncatedRecord { offset: u64 },

    #[snafu(display(
        "record at offset {offset} claims {claimed} bytes past the committed head {head}"
    ))]
    RecordOverrunsHead { offset: u64, claimed: u64, head: u64 },

    #[snafu(display("batch of {len} bytes exceeds the record size limit"))]
    BatchTooLarge { len: usize },
}

/// A specialized `Result` for spill-queue errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The durable per-backend FIFO.
///
/// The producer side appends one record per failed batch; the consumer side
/// reads one record at a time and either commits its new tail with
/// [`update_meta`](Self::update_meta) or abandons the read with
/// [`rollback_meta`](Self::rollback_meta).
#[derive(Debug)]
pub struct SpillQueue {
    name: String,
    data_path: PathBuf,
    producer: File,
    consumer: File,
    meta: File,
    producer_offset: u64,
    consumer_offset: u64,
    pending_offset: Option<u64>,
}

impl SpillQueue {
    /// Opens (creating if necessary) the queue files `<name>.dat` and
    /// `<name>.rec` under `dir`, recovering offsets from a previous run.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let data_path = dir.join(name).with_extension(DATA_FILE_EXTENSION);
        let meta_path = dir.join(name).with_extension(META_FILE_EXTENSION);

        let producer = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&data_path)
            .context(UnableToOpenFileSnafu { path: &data_path })?;
        let consumer = File::open(&data_path).context(UnableToOpenFileSnafu { path: &data_path })?;
        let mut meta = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&meta_path)
            .context(UnableToOpenFileSnafu { path: &meta_path })?;

        let (mut producer_offset, mut consumer_offset) = read_meta(&mut meta)?;

        // Crash recovery: a partial append past the committed head is
        // discarded, and a tail past the head is pulled back to it.
        let data_len = producer
            .metadata()
            .context(UnableToReadFileMetadataSnafu)?
            .len();
        if producer_offset > data_len {
            warn!(
                name,
                producer_offset, data_len, "offsets ahead of data file, resetting head"
            );
            producer_offset = data_len;
        }
        if data_len > producer_offset {
            producer
                .set_len(producer_offset)
                .context(UnableToTruncateSnafu)?;
        }
        if consumer_offset > producer_offset {
            consumer_offset = producer_offset;
        }

        let mut queue = Self {
            name: name.to_owned(),
            data_path,
            producer,
            consumer,
            meta,
            producer_offset,
            consumer_offset,
            pending_offset: None,
        };
        queue
            .producer
            .seek(SeekFrom::Start(queue.producer_offset))
            .context(UnableToSeekSnafu)?;
        queue.write_meta()?;
        Ok(queue)
    }

    /// Appends one compressed batch and makes it durable before the producer
    /// head advances past it.
    pub fn write(&mut self, batch: &[u8]) -> Result<()> {
        let len = u32::try_from(batch.len())
            .ok()
            .context(BatchTooLargeSnafu { len: batch.len() })?;

        self.producer
            .write_u32::<BigEndian>(len)
            .context(UnableToWriteLengthSnafu)?;
        self.producer
            .write_all(batch)
            .context(UnableToWriteDataSnafu)?;
        self.producer.sync_data().context(UnableToSyncSnafu)?;

        self.producer_offset += 4 + u64::from(len);
        self.write_meta()?;
        debug!(name = %self.name, len, head = self.producer_offset, "spilled batch");
        Ok(())
    }

    /// True when uncommitted records remain.
    pub fn is_data(&self) -> bool {
        self.producer_offset > self.consumer_offset
    }

    /// Reads the record at the consumer tail without committing. Returns
    /// `None` when the queue is drained. A second `read` before
    /// [`update_meta`](Self::update_meta) returns the same record.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        self.pending_offset = None;
        if !self.is_data() {
            return Ok(None);
        }

        self.consumer
            .seek(SeekFrom::Start(self.consumer_offset))
            .context(UnableToSeekSnafu)?;
        let len = match self.consumer.read_u32::<BigEndian>() {
            Ok(len) => u64::from(len),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return TruncatedRecordSnafu {
                    offset: self.consumer_offset,
                }
                .fail();
            }
            Err(e) => return Err(e).context(UnableToReadDataSnafu),
        };
        let next = self.consumer_offset + 4 + len;
        ensure!(
            next <= self.producer_offset,
            RecordOverrunsHeadSnafu {
                offset: self.consumer_offset,
                claimed: len,
                head: self.producer_offset,
            }
        );

        let mut payload = vec![0u8; len as usize];
        self.consumer
            .read_exact(&mut payload)
            .map_err(|_| Error::TruncatedRecord {
                offset: self.consumer_offset,
            })?;

        self.pending_offset = Some(next);
        Ok(Some(payload))
    }

    /// Commits the tail past the last record returned by
    /// [`read`](Self::read). Idempotent when no read intervened. Draining
    /// the final record reclaims the data file.
    pub fn update_meta(&mut self) -> Result<()> {
        if let Some(next) = self.pending_offset.take() {
            self.consumer_offset = next;
        }
        if self.producer_offset > 0 && self.consumer_offset == self.producer_offset {
            self.producer.set_len(0).context(UnableToTruncateSnafu)?;
            self.producer
                .seek(SeekFrom::Start(0))
                .context(UnableToSeekSnafu)?;
            self.producer_offset = 0;
            self.consumer_offset = 0;
            debug!(name = %self.name, "spill queue drained, data file reclaimed");
        }
        self.write_meta()
    }

    /// Abandons the pending read; the next [`read`](Self::read) returns the
    /// same record.
    pub fn rollback_meta(&mut self) -> Result<()> {
        self.pending_offset = None;
        Ok(())
    }

    /// Flushes both files. Dropping the queue closes them.
    pub fn close(&mut self) -> Result<()> {
        self.producer.sync_all().context(UnableToSyncSnafu)?;
        self.meta.sync_all().context(UnableToSyncSnafu)?;
        Ok(())
    }

    /// Committed producer head, for observability.
    pub fn producer_offset(&self) -> u64 {
        self.producer_offset
    }

    /// Committed consumer tail, for observability.
    pub fn consumer_offset(&self) -> u64 {
        self.consumer_offset
    }

    /// Path of the data file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn write_meta(&mut self) -> Result<()> {
        let mut buf = [0u8; META_LEN];
        LittleEndian::write_u64(&mut buf[0..8], self.producer_offset);
        LittleEndian::write_u64(&mut buf[8..16], self.consumer_offset);
        self.meta
            .seek(SeekFrom::Start(0))
            .context(UnableToSeekSnafu)?;
        self.meta.write_all(&buf).context(UnableToWriteMetaSnafu)?;
        self.meta.sync_data().context(UnableToSyncSnafu)?;
        Ok(())
    }
}

/// Loads `(producer, consumer)` from the meta file; a short or empty file
/// reads as a fresh queue.
fn read_meta(meta: &mut File) -> Result<(u64, u64)> {
    let len = meta
        .metadata()
        .context(UnableToReadFileMetadataSnafu)?
        .len();
    if len < META_LEN as u64 {
        return Ok((0, 0));
    }
    meta.seek(SeekFrom::Start(0)).context(UnableToSeekSnafu)?;
    let producer = meta
        .read_u64::<LittleEndian>()
        .context(UnableToReadMetaSnafu)?;
    let consumer = meta
        .read_u64::<LittleEndian>()
        .context(UnableToReadMetaSnafu)?;
    Ok((producer, consumer))
}
