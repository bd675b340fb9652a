//! Archive naming: `<mailbox-basename><expanded-suffix>[.gz]`, next to
//! the mailbox unless `--output-dir` relocates it.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Result;
use archivemail_core::{RunOptions, user_error};
use chrono::{Local, TimeZone};

/// Expand strftime sequences in the suffix against the cutoff instant, so
/// `_%Y-%m` buckets mail by the month it became old. A suffix without `%`
/// passes through untouched.
pub fn expand_suffix(suffix: &str, cutoff: i64) -> Result<String> {
    if !suffix.contains('%') {
        return Ok(suffix.to_string());
    }
    let when = match Local.timestamp_opt(cutoff, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            return user_error(format!("cannot expand suffix '{suffix}': bad cutoff"));
        }
    };
    let mut expanded = String::new();
    if write!(expanded, "{}", when.format(suffix)).is_err() {
        return user_error(format!("invalid strftime sequence in suffix '{suffix}'"));
    }
    Ok(expanded)
}

/// The uncompressed archive path for a mailbox name or IMAP folder leaf.
/// `.gz` is appended separately so the conflict check can consider both
/// forms.
pub fn make_archive_name(source: &str, options: &RunOptions, cutoff: i64) -> Result<PathBuf> {
    let source = source.trim_end_matches('/');
    let leaf = source.rsplit('/').next().unwrap_or(source);
    if leaf.is_empty() {
        return user_error(format!("cannot derive an archive name from '{source}'"));
    }
    let file_name = format!("{leaf}{}", expand_suffix(&options.suffix, cutoff)?);
    let dir = match &options.output_dir {
        Some(dir) => dir.clone(),
        None => Path::new(source)
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    Ok(dir.join(file_name))
}

/// The path the archive is actually written to.
pub fn final_archive_path(base: &Path, options: &RunOptions) -> PathBuf {
    if options.no_compress {
        base.to_path_buf()
    } else {
        let mut path = base.as_os_str().to_os_string();
        path.push(".gz");
        PathBuf::from(path)
    }
}

/// Refuse to run when the archive already exists in the other
/// compression form; appending would silently split the archive in two.
pub fn check_archive(base: &Path, options: &RunOptions) -> Result<()> {
    let compressed = final_archive_path(base, &RunOptions {
        no_compress: false,
        ..options.clone()
    });
    if options.no_compress {
        if compressed.exists() {
            return user_error(format!(
                "archive '{}' exists; uncompressed archiving would split it \
                 (remove it or drop --no-compress)",
                compressed.display()
            ));
        }
    } else if base.exists() {
        return user_error(format!(
            "uncompressed archive '{}' exists; compressed archiving would split it \
             (remove it or pass --no-compress)",
            base.display()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2001-07-16 12:00 UTC
    const CUTOFF: i64 = 995284800;

    #[test]
    fn plain_suffix_is_appended_next_to_the_mailbox() {
        let options = RunOptions::default();
        let base = make_archive_name("/var/mail/alice", &options, CUTOFF).unwrap();
        assert_eq!(base, PathBuf::from("/var/mail/alice_archive"));
        assert_eq!(
            final_archive_path(&base, &options),
            PathBuf::from("/var/mail/alice_archive.gz")
        );
    }

    #[test]
    fn bare_mailbox_name_lands_in_the_current_directory() {
        let options = RunOptions::default();
        let base = make_archive_name("inbox", &options, CUTOFF).unwrap();
        assert_eq!(base, PathBuf::from("./inbox_archive"));
    }

    #[test]
    fn output_dir_relocates_the_archive() {
        let options = RunOptions {
            output_dir: Some(PathBuf::from("/backup")),
            ..RunOptions::default()
        };
        let base = make_archive_name("/var/mail/alice", &options, CUTOFF).unwrap();
        assert_eq!(base, PathBuf::from("/backup/alice_archive"));
    }

    #[test]
    fn strftime_suffix_expands_against_the_cutoff() {
        let options = RunOptions {
            suffix: "_%Y-%m".to_string(),
            ..RunOptions::default()
        };
        let base = make_archive_name("inbox", &options, CUTOFF).unwrap();
        let name = base.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("inbox_2001-"), "{name}");
    }

    #[test]
    fn trailing_slash_and_folder_leaf_are_handled() {
        let options = RunOptions::default();
        let base = make_archive_name("Lists/rust/", &options, CUTOFF).unwrap();
        assert_eq!(
            base.file_name().unwrap().to_string_lossy(),
            "rust_archive"
        );
    }

    #[test]
    fn conflicting_compression_form_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("inbox_archive");
        let options = RunOptions::default();
        check_archive(&base, &options).unwrap();
        std::fs::write(&base, b"").unwrap();
        assert!(check_archive(&base, &options).is_err());

        let options = RunOptions {
            no_compress: true,
            ..RunOptions::default()
        };
        let base2 = dir.path().join("other_archive");
        check_archive(&base2, &options).unwrap();
        std::fs::write(dir.path().join("other_archive.gz"), b"").unwrap();
        assert!(check_archive(&base2, &options).is_err());
    }
}
