//! One-file-per-message sources: maildir (`new`/`cur` subdirectories,
//! state in a `:2,<letters>` filename suffix) and MH (numeric filenames,
//! no suffix convention). Neither needs locking: file rename/unlink is
//! atomic at the one-message granularity.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archivemail_core::{Flags, guess_delivery_time};
use log::debug;

use crate::message::{Body, Message, read_header_block};

/// Build a message from a one-message file. Headers are read off the
/// front of the file; the body stays on disk.
fn message_from_file(path: &Path, flags: Flags) -> Result<Message> {
    let file = File::open(path)
        .with_context(|| format!("cannot open message file '{}'", path.display()))?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let (header_block, consumed) = read_header_block(&mut reader)?;
    let mut message = Message::new(
        header_block,
        None,
        Body::File {
            path: path.to_path_buf(),
            offset: consumed,
        },
        size,
    )?;
    message.flags = flags;
    message.delivery_time =
        guess_delivery_time(message.headers(), None, Some(path));
    Ok(message)
}

/// Decode the flag letters from a maildir file name, if any.
fn maildir_flags(file_name: &str, in_cur: bool) -> Flags {
    match file_name.rsplit_once(":2,") {
        Some((_, info)) => Flags::from_maildir_info(info, in_cur),
        None => Flags {
            recent: !in_cur,
            ..Flags::default()
        },
    }
}

pub struct MaildirSource {
    entries: std::vec::IntoIter<(PathBuf, bool)>,
}

impl MaildirSource {
    /// Open a maildir: messages under `new` are recent, messages under
    /// `cur` are not. Dot-prefixed files are internal and skipped.
    pub fn open(path: &Path) -> Result<MaildirSource> {
        let mut entries = Vec::new();
        for (sub, in_cur) in [("new", false), ("cur", true)] {
            let sub_path = path.join(sub);
            let mut files = list_message_files(&sub_path, |_| true)?;
            files.sort();
            entries.extend(files.into_iter().map(|file| (file, in_cur)));
        }
        Ok(MaildirSource {
            entries: entries.into_iter(),
        })
    }
}

impl Iterator for MaildirSource {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        let (path, in_cur) = self.entries.next()?;
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let flags = maildir_flags(&name, in_cur);
        Some(message_from_file(&path, flags))
    }
}

pub struct MhSource {
    entries: std::vec::IntoIter<PathBuf>,
}

impl MhSource {
    /// Open an MH folder: messages are the files with purely numeric
    /// names, in numeric order. Flags come only from whatever Status and
    /// X-Status headers the messages already carry.
    pub fn open(path: &Path) -> Result<MhSource> {
        let mut files = list_message_files(path, |name| {
            !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
        })?;
        files.sort_by_key(|file| {
            file.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<u64>().ok())
                .unwrap_or(u64::MAX)
        });
        Ok(MhSource {
            entries: files.into_iter(),
        })
    }
}

impl Iterator for MhSource {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.entries.next()?;
        Some(message_from_file(&path, Flags::default()).map(|mut message| {
            message.flags = Flags::from_status_headers(
                message.get_header("Status"),
                message.get_header("X-Status"),
            );
            message
        }))
    }
}

fn list_message_files(
    dir: &Path,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read mailbox directory '{}'", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !keep(&name) {
            continue;
        }
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Remove the original files of archived messages, after the archive has
/// been durably committed. A file that is already gone counts as removed.
pub fn remove_queued(queue: &[PathBuf]) -> Result<()> {
    for path in queue {
        debug!("removing original message '{}'", path.display());
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("cannot remove '{}'", path.display())));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_maildir(root: &Path) -> Result<()> {
        for sub in ["new", "cur", "tmp"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(())
    }

    const MAIL: &str = "From: alice@example.org\nSubject: hi\n\nbody\n";

    #[test]
    fn maildir_iterates_new_then_cur_with_flags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_maildir(dir.path())?;
        std::fs::write(dir.path().join("new/100.host"), MAIL)?;
        std::fs::write(dir.path().join("cur/200.host:2,FS"), MAIL)?;
        std::fs::write(dir.path().join("cur/.dotfile"), b"ignored")?;

        let messages: Vec<Message> = MaildirSource::open(dir.path())?.collect::<Result<_>>()?;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].flags.recent);
        assert!(!messages[0].flags.seen);
        assert!(!messages[1].flags.recent);
        assert!(messages[1].flags.seen && messages[1].flags.flagged);
        Ok(())
    }

    #[test]
    fn maildir_message_size_is_the_file_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_maildir(dir.path())?;
        std::fs::write(dir.path().join("cur/1.host:2,S"), MAIL)?;
        let message = MaildirSource::open(dir.path())?.next().unwrap()?;
        assert_eq!(message.size, MAIL.len() as u64);
        Ok(())
    }

    #[test]
    fn maildir_file_without_info_suffix_has_no_flag_letters() {
        let flags = maildir_flags("12345.host", false);
        assert!(flags.recent && !flags.seen && !flags.flagged);
    }

    #[test]
    fn mh_keeps_only_numeric_names_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("10"), MAIL)?;
        std::fs::write(dir.path().join("2"), MAIL)?;
        std::fs::write(dir.path().join(".mh_sequences"), b"unseen: 2")?;
        std::fs::write(dir.path().join("notes.txt"), b"not mail")?;

        let paths: Vec<PathBuf> = MhSource::open(dir.path())?
            .map(|message| {
                let message = message.unwrap();
                match message.body {
                    Body::File { path, .. } => path,
                    _ => panic!("MH messages are file-backed"),
                }
            })
            .collect();
        let names: Vec<_> = paths
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["2", "10"]);
        Ok(())
    }

    #[test]
    fn mh_flags_come_from_existing_status_headers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("1"),
            "Status: RO\nX-Status: F\nSubject: x\n\nbody\n",
        )?;
        let message = MhSource::open(dir.path())?.next().unwrap()?;
        assert!(message.flags.seen && message.flags.flagged && !message.flags.recent);
        Ok(())
    }

    #[test]
    fn remove_queued_treats_missing_files_as_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let present = dir.path().join("1");
        std::fs::write(&present, MAIL)?;
        let gone = dir.path().join("2");
        remove_queued(&[present.clone(), gone])?;
        assert!(!present.exists());
        Ok(())
    }
}
