//! Dual-consumer file reading: one sequential byte source feeds both the
//! container prober and the PSI decoder bank.
//!
//! The prober drives its own reads and seeks; the reader shadows them with a
//! `psi_watermark` marking how far the bank has been fed. Bytes reach the
//! bank exactly once and strictly in file order: backward re-reads are not
//! re-fed, forward seeks feed the skipped gap first, and whatever the prober
//! never touched is drained to EOF after it returns.

use crate::framer::PacketFramer;
use crate::ingest::TableStateMachine;
use crate::probe::{ContainerProber, ProbeError, ProbeIo, StreamKind, Whence};
use crate::store::Store;
use crate::IndexError;
use log::{error, info, warn};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const BUF_SIZE: usize = 4096;

fn file_name_from_path(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => path.to_string_lossy().into_owned(),
    }
}

/// Reader wrapping one open file, feeding the PSI bank as a side effect of
/// the prober's I/O.
pub struct DualFeedReader<'a, 'db, R: Read + Seek> {
    src: R,
    size: u64,
    psi_watermark: u64,
    framer: PacketFramer,
    state: &'a mut TableStateMachine<'db>,
    /// Store failure raised inside a feed; surfaced as an I/O error to stop
    /// the prober, then re-raised to the caller.
    pending: Option<IndexError>,
}

impl<'a, 'db, R: Read + Seek> DualFeedReader<'a, 'db, R> {
    pub fn new(src: R, size: u64, state: &'a mut TableStateMachine<'db>) -> Self {
        Self {
            src,
            size,
            psi_watermark: 0,
            framer: PacketFramer::new(),
            state,
            pending: None,
        }
    }

    /// File offset up to which the PSI bank has been fed.
    pub fn psi_watermark(&self) -> u64 {
        self.psi_watermark
    }

    fn feed_bank(&mut self, bytes: &[u8]) {
        if self.pending.is_some() {
            return;
        }
        let state = &mut *self.state;
        let mut failure = None;
        self.framer.feed(bytes, |packet| {
            if failure.is_none() {
                if let Err(e) = state.feed_packet(packet) {
                    failure = Some(e);
                }
            }
        });
        self.pending = failure;
    }

    /// Read and feed `[start, dst)` ahead of a forward seek.
    fn feed_gap(&mut self, start: u64, dst: u64) -> io::Result<()> {
        self.src.seek(SeekFrom::Start(start))?;
        let mut buf = [0_u8; BUF_SIZE];
        let mut to_read = dst - start;
        while to_read > 0 {
            let chunk = (to_read as usize).min(BUF_SIZE);
            let readsize = self.src.read(&mut buf[..chunk])?;
            if readsize == 0 {
                break; /* seek destination beyond EOF */
            }
            self.feed_bank(&buf[..readsize]);
            to_read -= readsize as u64;
        }
        self.psi_watermark = dst;
        Ok(())
    }

    /// Surface a store failure captured while feeding.
    pub fn take_pending(&mut self) -> Result<(), IndexError> {
        match self.pending.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn pending_as_io(&self) -> io::Result<()> {
        if self.pending.is_some() {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "indexing error while feeding the PSI bank",
            ))
        } else {
            Ok(())
        }
    }

    /// Feed everything between the watermark and EOF to the PSI bank. The
    /// prober is free to stop reading anywhere; the bank is not.
    pub fn drain_to_eof(&mut self) -> Result<(), IndexError> {
        self.take_pending()?;
        self.src.seek(SeekFrom::Start(self.psi_watermark))?;
        let mut buf = [0_u8; BUF_SIZE];
        loop {
            let readsize = self.src.read(&mut buf)?;
            if readsize == 0 {
                break;
            }
            self.feed_bank(&buf[..readsize]);
            self.psi_watermark += readsize as u64;
            self.take_pending()?;
        }
        Ok(())
    }
}

impl<'a, 'db, R: Read + Seek> ProbeIo for DualFeedReader<'a, 'db, R> {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let readsize = self.src.read(buf)?;

        /* packets reach the bank only when the read went past the watermark;
         * a backward-seeked prober re-reads without re-feeding */
        let newpos = self.src.stream_position()?;
        if newpos > self.psi_watermark {
            self.feed_bank(&buf[..readsize]);
            self.psi_watermark = newpos;
        }
        self.pending_as_io()?;
        Ok(readsize)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> io::Result<u64> {
        if whence == Whence::QuerySize {
            return Ok(self.size);
        }
        let cur = self.src.stream_position()?;
        let dst = match whence {
            Whence::Start => offset,
            Whence::Current => cur as i64 + offset,
            Whence::End => self.size as i64 + offset,
            Whence::QuerySize => unreachable!(),
        };
        if dst < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        let dst = dst as u64;
        if dst > self.psi_watermark && dst > cur {
            /* jumping forward over bytes the bank has not seen */
            self.feed_gap(cur.max(self.psi_watermark), dst)?;
        }
        self.pending_as_io()?;
        self.src.seek(SeekFrom::Start(dst))?;
        Ok(dst)
    }
}

/// Index one regular file: probe it, stream it through the PSI bank, then
/// record the prober's stream summary.
pub fn process_file(
    store: &Store,
    prober: &dyn ContainerProber,
    path: &Path,
) -> Result<(), IndexError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let name = file_name_from_path(path);

    if store.has_file(&name, size)? {
        info!("{} [{}] already in database, skipping", name, size);
        return Ok(());
    }

    let mut state = TableStateMachine::new(store, &name, size);
    let mut reader = DualFeedReader::new(file, size, &mut state);
    let summary = match prober.probe(&mut reader) {
        Ok(summary) => summary,
        Err(e) => {
            reader.take_pending()?;
            return Err(match e {
                ProbeError::NotATransportStream => IndexError::NotATransportStream,
                ProbeError::Io(io_err) => io_err.into(),
            });
        }
    };
    reader.drain_to_eof()?;
    drop(reader);

    /* stream rows only after the whole file went through the bank */
    if !summary.streams.is_empty() {
        let file_rowid = state.file_rowid()?;
        store.begin()?;
        let result = (|| -> Result<(), IndexError> {
            for stream in &summary.streams {
                match stream.kind {
                    StreamKind::Video => {
                        store.insert_vid_stream(file_rowid, stream.id, stream.codec)?
                    }
                    StreamKind::Audio => {
                        store.insert_aud_stream(file_rowid, stream.id, stream.codec)?
                    }
                };
            }
            Ok(())
        })();
        if result.is_err() {
            let _ = store.rollback();
            return result;
        }
        store.end()?;
    }

    info!("Saved {}", name);
    Ok(())
}

/// Walk a file or directory tree, indexing every regular file. Physical
/// paths only; symbolic links are not followed. Recoverable per-file errors
/// are logged and the walk continues; fatal errors propagate.
pub fn walk_path(
    store: &Store,
    prober: &dyn ContainerProber,
    path: &Path,
) -> Result<(), IndexError> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        let mut entries = fs::read_dir(path)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let child = entry.path();
            if fs::symlink_metadata(&child)?.file_type().is_symlink() {
                continue;
            }
            walk_path(store, prober, &child)?;
        }
    } else if metadata.is_file() {
        let name = file_name_from_path(path);
        match process_file(store, prober, path) {
            Ok(()) => {}
            Err(IndexError::NotATransportStream) => {
                info!("{} does not look like a MPEG-TS", name);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error!("Error while reading {}: {}", name, e),
        }
    }
    Ok(())
}
