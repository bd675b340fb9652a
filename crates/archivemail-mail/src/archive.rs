//! Temp mbox writers and the archive commit protocol. Archived messages
//! are staged into a temp file first; the real archive is only touched
//! once the whole source has been read, and the source is only mutated
//! once the archive append is durable on disk.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archivemail_core::{RunOptions, StaleHandle, make_envelope_from, unexpected_error};
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, info, warn};

use crate::lock::MboxLock;
use crate::message::{Body, Message};
use crate::mbox::safe_open_existing;

enum TempWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl Write for TempWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TempWriter::Plain(file) => file.write(buf),
            TempWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TempWriter::Plain(file) => file.flush(),
            TempWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// A staging mbox in the per-run temp directory, registered with the
/// stale-file registry for the whole of its life. A gzip stream is never
/// zero bytes, so emptiness is tracked explicitly rather than by size.
pub struct TempMbox {
    writer: TempWriter,
    path: PathBuf,
    written: u64,
    empty: bool,
    stale: StaleHandle,
}

/// A finished temp mbox: flushed, synced and closed, but still on disk
/// and still registered until it is committed or discarded.
pub struct ClosedTemp {
    pub path: PathBuf,
    pub written: u64,
    pub empty: bool,
}

impl TempMbox {
    pub fn create(
        temp_dir: &Path,
        compress: bool,
        stale: &StaleHandle,
    ) -> Result<TempMbox> {
        let (file, path) = tempfile::Builder::new()
            .prefix("archivemail_")
            .tempfile_in(temp_dir)
            .with_context(|| {
                format!("cannot create temporary mailbox in '{}'", temp_dir.display())
            })?
            .keep()?;
        debug!("writing to temporary mailbox '{}'", path.display());
        stale.lock().unwrap_or_else(|e| e.into_inner()).add_temp_mbox(path.clone());
        let writer = if compress {
            TempWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            TempWriter::Plain(file)
        };
        Ok(TempMbox {
            writer,
            path,
            written: 0,
            empty: true,
            stale: stale.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical (uncompressed) bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Copy a message verbatim from its source mbox. The span already
    /// carries its own envelope line and trailing newline.
    pub fn write_span(&mut self, mut reader: impl Read) -> Result<()> {
        let copied = io::copy(&mut reader, &mut self.writer)?;
        self.written += copied;
        self.empty = false;
        Ok(())
    }

    /// Write a message that has no backing mbox span (maildir, MH, IMAP).
    /// The envelope line is synthesized, and `From ` body lines are quoted
    /// when `mangle` is set, since nothing else keeps them from reading as
    /// message boundaries later.
    pub fn write_message(&mut self, message: &Message, mangle: bool) -> Result<()> {
        let envelope = match &message.envelope_from {
            Some(line) => line.clone(),
            None => make_envelope_from(message.headers(), message.delivery_time),
        };
        self.write_all(envelope.as_bytes())?;
        self.write_all(message.header_block())?;
        self.write_all(b"\n")?;
        let mangle = mangle && message.envelope_from.is_none();
        match &message.body {
            Body::File { path, offset } => {
                let mut file = File::open(path)
                    .with_context(|| format!("cannot reopen '{}'", path.display()))?;
                file.seek(SeekFrom::Start(*offset))?;
                self.write_body(BufReader::new(file), mangle)?;
            }
            Body::Bytes(bytes) => {
                self.write_body(bytes.as_slice(), mangle)?;
            }
            Body::MboxSpan { .. } => {
                return unexpected_error("mbox-backed message passed to write_message");
            }
        }
        // Blank separator line after every message, as the mbox format
        // expects between entries.
        self.write_all(b"\n")?;
        self.empty = false;
        Ok(())
    }

    fn write_body(&mut self, mut reader: impl BufRead, mangle: bool) -> Result<()> {
        let mut line = Vec::new();
        let mut last_byte = b'\n';
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if mangle && line.starts_with(b"From ") {
                self.write_all(b">")?;
            }
            self.write_all(&line)?;
            last_byte = line[line.len() - 1];
        }
        if last_byte != b'\n' {
            self.write_all(b"\n")?;
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Flush, sync and close the temp mbox. The file stays on disk and
    /// stays registered.
    pub fn close(self) -> Result<ClosedTemp> {
        let file = match self.writer {
            TempWriter::Plain(file) => file,
            TempWriter::Gzip(encoder) => encoder.finish()?,
        };
        file.sync_all()?;
        Ok(ClosedTemp {
            path: self.path,
            written: self.written,
            empty: self.empty,
        })
    }
}

impl ClosedTemp {
    /// Remove the temp file and deregister it. Used when nothing was
    /// archived, or after a successful commit.
    pub fn discard(self, stale: &StaleHandle) -> Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("cannot remove '{}'", self.path.display()))?;
        stale
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget_temp_mbox(&self.path);
        Ok(())
    }

    /// Deregister without deleting, so abnormal-exit cleanup will not
    /// destroy a file the user has been told to recover by hand.
    fn preserve(&self, stale: &StaleHandle) {
        stale
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget_temp_mbox(&self.path);
    }
}

/// Open the archive mbox, creating it when absent. Creation goes through
/// a private temp file hard-linked into place; on NFS a failed link with
/// the temp's nlink at 2 still means we won the race.
pub fn safe_open_archive(path: &Path) -> Result<File> {
    if path.symlink_metadata().is_ok() {
        return safe_open_existing(path);
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("archive"));
    let pre = tempfile::Builder::new()
        .prefix(&name)
        .suffix(".pre")
        .tempfile_in(dir)
        .with_context(|| format!("cannot create archive in '{}'", dir.display()))?;
    match std::fs::hard_link(pre.path(), path) {
        Ok(()) => {}
        Err(err) => {
            let nlink = pre
                .path()
                .symlink_metadata()
                .map(|m| std::os::unix::fs::MetadataExt::nlink(&m))
                .unwrap_or(0);
            if nlink != 2 {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    // Lost the creation race; the other writer's file is fine.
                    return safe_open_existing(path);
                }
                return Err(anyhow::Error::from(err)
                    .context(format!("cannot create archive '{}'", path.display())));
            }
        }
    }
    drop(pre);
    safe_open_existing(path)
}

/// Append a finished temp archive onto the real archive, durably, under
/// the archive's own lock. The source mailbox must not have been mutated
/// yet: if the append fails the archive is truncated back to its old
/// length, and the temp file is preserved and reported so no mail can be
/// lost either way.
pub fn commit_archive(
    temp: ClosedTemp,
    archive_path: &Path,
    options: &RunOptions,
    stale: &StaleHandle,
) -> Result<u64> {
    if temp.empty {
        debug!("no messages archived; removing empty temporary mailbox");
        return temp.discard(stale).map(|()| 0);
    }
    match append_temp(&temp, archive_path, options, stale) {
        Ok(appended) => {
            info!(
                "committed {} bytes to archive '{}'",
                appended,
                archive_path.display()
            );
            temp.discard(stale)?;
            Ok(appended)
        }
        Err(err) => {
            temp.preserve(stale);
            warn!(
                "archived mail saved at '{}'; recover it by hand",
                temp.path.display()
            );
            Err(err.context(format!(
                "cannot write to archive '{}' (archived mail preserved at '{}')",
                archive_path.display(),
                temp.path.display()
            )))
        }
    }
}

fn append_temp(
    temp: &ClosedTemp,
    archive_path: &Path,
    options: &RunOptions,
    stale: &StaleHandle,
) -> Result<u64> {
    let mut archive = safe_open_archive(archive_path)?;
    let mut lock = MboxLock::default();
    lock.lock(&archive, archive_path, options, stale)?;
    let result = append_locked(temp, &mut archive);
    let unlock = lock.unlock(&archive, archive_path, stale);
    result.and(unlock.map(|()| temp.written))
}

fn append_locked(temp: &ClosedTemp, archive: &mut File) -> Result<()> {
    let old_len = archive.seek(SeekFrom::End(0))?;
    let mut reader = File::open(&temp.path)
        .with_context(|| format!("cannot reopen '{}'", temp.path.display()))?;
    if let Err(err) = io::copy(&mut reader, archive) {
        // The source is untouched, so a half-written tail is safe to cut.
        let _ = archive.set_len(old_len);
        let _ = archive.sync_all();
        return Err(err.into());
    }
    archive.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivemail_core::{Flags, new_stale_handle};
    use flate2::read::MultiGzDecoder;

    fn bytes_message(body: &[u8]) -> Message {
        let mut message = Message::new(
            b"From: carol@example.org\nSubject: t\n".to_vec(),
            None,
            Body::Bytes(body.to_vec()),
            body.len() as u64,
        )
        .unwrap();
        message.delivery_time = 994939200;
        message.flags = Flags::default();
        message
    }

    #[test]
    fn synthesized_message_gets_envelope_and_separator_line() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = new_stale_handle();
        let mut temp = TempMbox::create(dir.path(), false, &stale)?;
        temp.write_message(&bytes_message(b"no trailing newline"), true)?;
        let closed = temp.close()?;
        let text = std::fs::read_to_string(&closed.path)?;
        assert!(text.starts_with("From carol@example.org "));
        // The body is newline-terminated and a blank line follows it.
        assert!(text.ends_with("no trailing newline\n\n"));
        Ok(())
    }

    #[test]
    fn from_lines_in_the_body_are_quoted_when_mangling() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = new_stale_handle();
        let mut temp = TempMbox::create(dir.path(), false, &stale)?;
        temp.write_message(&bytes_message(b"From here it looks fine\nok\n"), true)?;
        let closed = temp.close()?;
        let text = std::fs::read_to_string(&closed.path)?;
        assert!(text.contains("\n>From here it looks fine\n"));

        let mut plain = TempMbox::create(dir.path(), false, &stale)?;
        plain.write_message(&bytes_message(b"From here it looks fine\n"), false)?;
        let text = std::fs::read_to_string(&plain.close()?.path)?;
        assert!(text.contains("\nFrom here it looks fine\n"));
        Ok(())
    }

    #[test]
    fn gzip_temp_is_nonzero_but_reports_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = new_stale_handle();
        let temp = TempMbox::create(dir.path(), true, &stale)?;
        let closed = temp.close()?;
        assert!(closed.empty);
        assert!(std::fs::metadata(&closed.path)?.len() > 0);
        Ok(())
    }

    #[test]
    fn commit_appends_and_removes_the_temp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = new_stale_handle();
        let options = RunOptions::default();
        let archive_path = dir.path().join("inbox_archive");
        std::fs::write(&archive_path, b"From old@example.org Mon Jul 16 12:00:00 2001\n\nold\n")?;
        let old_len = std::fs::metadata(&archive_path)?.len();

        let mut temp = TempMbox::create(dir.path(), false, &stale)?;
        temp.write_message(&bytes_message(b"fresh\n"), true)?;
        let temp_path = temp.path().to_path_buf();
        let appended = commit_archive(temp.close()?, &archive_path, &options, &stale)?;

        assert!(appended > 0);
        assert_eq!(std::fs::metadata(&archive_path)?.len(), old_len + appended);
        assert!(!temp_path.exists());
        Ok(())
    }

    #[test]
    fn empty_commit_leaves_no_archive_behind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = new_stale_handle();
        let options = RunOptions::default();
        let archive_path = dir.path().join("inbox_archive");
        let temp = TempMbox::create(dir.path(), false, &stale)?;
        let appended = commit_archive(temp.close()?, &archive_path, &options, &stale)?;
        assert_eq!(appended, 0);
        assert!(!archive_path.exists());
        Ok(())
    }

    #[test]
    fn gzip_members_concatenate_across_commits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = new_stale_handle();
        let options = RunOptions::default();
        let archive_path = dir.path().join("inbox_archive.gz");
        for body in [&b"first run\n"[..], &b"second run\n"[..]] {
            let mut temp = TempMbox::create(dir.path(), true, &stale)?;
            temp.write_message(&bytes_message(body), true)?;
            commit_archive(temp.close()?, &archive_path, &options, &stale)?;
        }
        let mut text = String::new();
        MultiGzDecoder::new(File::open(&archive_path)?).read_to_string(&mut text)?;
        assert!(text.contains("first run\n"));
        assert!(text.contains("second run\n"));
        Ok(())
    }

    #[test]
    fn archive_creation_refuses_a_symlink_target() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let real = dir.path().join("real");
        std::fs::write(&real, b"")?;
        let link = dir.path().join("inbox_archive");
        std::os::unix::fs::symlink(&real, &link)?;
        assert!(safe_open_archive(&link).is_err());
        Ok(())
    }
}
