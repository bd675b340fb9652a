//! The mbox message source: a mostly-read-only mbox whose content can only
//! be replaced by overwriting the whole underlying file in place (never by
//! rename, which would break delivery agents holding the inode).

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use archivemail_core::{
    Flags, RunOptions, StaleHandle, guess_delivery_time, unexpected_error,
};
use log::debug;

use crate::lock::MboxLock;
use crate::message::{Body, Message, read_header_block};

#[derive(Debug)]
pub struct Mbox {
    file: File,
    path: PathBuf,
    pub starting_size: u64,
    original_atime: SystemTime,
    original_mtime: SystemTime,
    lock: MboxLock,
}

impl Mbox {
    /// Open an existing mbox through the paranoid checks: no symlinks, no
    /// extra hard links, no directories, no switcheroo between lstat and
    /// fstat.
    pub fn open(path: &Path) -> Result<Mbox> {
        let file = safe_open_existing(path)?;
        let meta = file.metadata()?;
        Ok(Mbox {
            starting_size: meta.len(),
            original_atime: meta.accessed()?,
            original_mtime: meta.modified()?,
            file,
            path: path.to_path_buf(),
            lock: MboxLock::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&mut self, options: &RunOptions, stale: &StaleHandle) -> Result<()> {
        self.lock.lock(&self.file, &self.path, options, stale)
    }

    pub fn unlock(&mut self, stale: &StaleHandle) -> Result<()> {
        self.lock.unlock(&self.file, &self.path, stale)
    }

    /// Size of the file on disk right now; compared against
    /// `starting_size` after iteration as the concurrent-writer fence.
    pub fn current_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Lazy, forward-only, single-pass message sequence over a separate
    /// read handle.
    pub fn messages(&self) -> Result<MboxMessages> {
        let mut read_file = self.file.try_clone()?;
        read_file.seek(SeekFrom::Start(0))?;
        Ok(MboxMessages {
            reader: BufReader::new(read_file),
            offset: 0,
            pending_from: None,
            done: false,
        })
    }

    /// A reader over one message's byte span, for verbatim copying. Reads
    /// are positioned, so the iterator's shared file offset never moves.
    pub fn span_reader(&self, start: u64, len: u64) -> Result<SpanReader> {
        Ok(SpanReader {
            file: self.file.try_clone()?,
            pos: start,
            remaining: len,
        })
    }

    /// Replace the mbox content with the given file's content: seek to the
    /// start, copy, truncate. The inode stays the same.
    pub fn overwrite_with(&mut self, retained: &Path) -> Result<()> {
        let mut source = File::open(retained)?;
        self.file.seek(SeekFrom::Start(0))?;
        let written = std::io::copy(&mut source, &mut self.file)?;
        self.file.set_len(written)?;
        Ok(())
    }

    /// Flush and fsync the mbox file.
    pub fn commit(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Best-effort restore of the pre-run access/modification timestamps.
    pub fn reset_timestamps(&self) {
        let times = std::fs::FileTimes::new()
            .set_accessed(self.original_atime)
            .set_modified(self.original_mtime);
        if let Err(err) = self.file.set_times(times) {
            debug!(
                "cannot restore timestamps of '{}': {err}",
                self.path.display()
            );
        }
    }
}

/// Reads one message's byte range with `pread(2)`-style positioned reads,
/// leaving the file descriptor's offset alone.
#[derive(Debug)]
pub struct SpanReader {
    file: File,
    pos: u64,
    remaining: u64,
}

impl Read for SpanReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf
            .len()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.file.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Iterator over the messages of an mbox. Boundaries are lines beginning
/// `From ` at the start of a line; the span of each message runs up to the
/// next boundary or end of file, so the spans of all messages exactly
/// tile the file.
pub struct MboxMessages {
    reader: BufReader<File>,
    offset: u64,
    /// The next message's From_ line and its starting offset, read while
    /// scanning the previous message's body.
    pending_from: Option<(u64, Vec<u8>)>,
    done: bool,
}

impl MboxMessages {
    fn read_line(&mut self, line: &mut Vec<u8>) -> std::io::Result<usize> {
        line.clear();
        let n = self.reader.read_until(b'\n', line)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn next_message(&mut self) -> Result<Option<Message>> {
        let (msg_start, envelope) = match self.pending_from.take() {
            Some(pending) => pending,
            None => {
                // Scan for the first From_ line, skipping any leading junk
                // the way other mbox readers do.
                let mut line = Vec::new();
                loop {
                    let start = self.offset;
                    if self.read_line(&mut line)? == 0 {
                        return Ok(None);
                    }
                    if line.starts_with(b"From ") {
                        break (start, line.clone());
                    }
                }
            }
        };

        let (header_block, consumed) = read_header_block(&mut self.reader)?;
        self.offset += consumed;
        let body_start = self.offset;

        let mut line = Vec::new();
        let msg_end;
        loop {
            let line_start = self.offset;
            if self.read_line(&mut line)? == 0 {
                msg_end = self.offset;
                self.done = true;
                break;
            }
            if line.starts_with(b"From ") {
                msg_end = line_start;
                self.pending_from = Some((line_start, line.clone()));
                break;
            }
        }

        let envelope = String::from_utf8_lossy(&envelope).into_owned();
        let body_len = msg_end - body_start;
        let size = envelope.len() as u64 + header_block.len() as u64 + 1 + body_len;
        let mut message = Message::new(
            header_block,
            Some(envelope),
            Body::MboxSpan {
                start: msg_start,
                len: msg_end - msg_start,
            },
            size,
        )?;
        message.flags = Flags::from_status_headers(
            message.get_header("Status"),
            message.get_header("X-Status"),
        );
        message.delivery_time = guess_delivery_time(
            message.headers(),
            message.envelope_from.as_deref(),
            None,
        );
        Ok(Some(message))
    }
}

impl Iterator for MboxMessages {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done && self.pending_from.is_none() {
            return None;
        }
        self.next_message().transpose()
    }
}

/// Open an existing file for read/write, refusing symlinks, files with
/// extra hard links, directories, files owned by another user, and files
/// whose identity changes between the lstat and the fstat.
pub fn safe_open_existing(path: &Path) -> Result<File> {
    let lst = std::fs::symlink_metadata(path)
        .with_context(|| format!("cannot stat '{}'", path.display()))?;
    if lst.file_type().is_symlink() {
        return unexpected_error(format!("file '{}' is a symlink", path.display()));
    }
    let file = File::options()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("cannot open '{}'", path.display()))?;
    let fst = file.metadata()?;
    if fst.nlink() != 1 {
        return unexpected_error(format!(
            "file '{}' has {} hard links",
            path.display(),
            fst.nlink()
        ));
    }
    if fst.is_dir() {
        return unexpected_error(format!("file '{}' is a directory", path.display()));
    }
    let uid = unsafe { libc::getuid() };
    if uid != 0 && fst.uid() != uid {
        return unexpected_error(format!(
            "file '{}' is owned by somebody else",
            path.display()
        ));
    }
    let same = fst.dev() == lst.dev()
        && fst.ino() == lst.ino()
        && fst.uid() == lst.uid()
        && fst.gid() == lst.gid()
        && fst.mode() == lst.mode()
        && fst.nlink() == lst.nlink();
    if !same {
        return unexpected_error("file status changed unexpectedly");
    }
    Ok(file)
}
