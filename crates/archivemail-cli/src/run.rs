//! The per-mailbox orchestrator: sniff the mailbox type, drive the right
//! source, and enforce the ordering that makes a crash safe at any point:
//! the archive is durably committed before the source loses a single byte.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archivemail_core::{
    IdentityCache, MessageFacts, RunMode, RunOptions, StaleHandle, Verdict, decide, login_name,
    now_epoch, unexpected_error, user_error,
};
use archivemail_mail::archive::{ClosedTemp, TempMbox, commit_archive};
use archivemail_mail::dir::{MaildirSource, MhSource, remove_queued};
use archivemail_mail::imap::{ImapSource, ImapUrl, build_filter, parse_imap_url};
use archivemail_mail::mbox::Mbox;
use archivemail_mail::message::{Body, Message};
use log::{debug, info, warn};

use crate::name::{check_archive, final_archive_path, make_archive_name};
use crate::stats::Stats;

/// Asks the user for an IMAP password when the URL and --pwfile supply
/// none. The CLI wires a terminal prompt; tests wire a closure.
pub type PasswordPrompt<'a> = &'a mut dyn FnMut(&ImapUrl) -> Result<String>;

pub fn run(
    options: &RunOptions,
    mailboxes: &[String],
    stale: &StaleHandle,
    prompt: PasswordPrompt,
) -> Result<()> {
    for mailbox in mailboxes {
        let result = archive_mailbox(mailbox, options, stale, prompt);
        // Cleanup runs on both paths; recovery copies are deregistered
        // before this point and survive it.
        stale.lock().unwrap_or_else(|e| e.into_inner()).drain();
        result.with_context(|| format!("cannot archive '{mailbox}'"))?;
    }
    Ok(())
}

fn archive_mailbox(
    mailbox: &str,
    options: &RunOptions,
    stale: &StaleHandle,
    prompt: PasswordPrompt,
) -> Result<()> {
    if is_imap_url(mailbox) {
        return drive_imap(mailbox, options, stale, prompt);
    }
    let name = mailbox.trim_end_matches('/');
    let path = Path::new(name);
    let Ok(meta) = fs::symlink_metadata(path) else {
        return user_error(format!("'{name}' does not exist"));
    };
    check_ownership(name, &meta)?;
    let cutoff = options.cutoff_epoch(now_epoch());
    let archive_base = make_archive_name(name, options, cutoff)?;
    if options.mode != RunMode::Delete {
        check_archive(&archive_base, options)?;
    }
    if meta.is_dir() {
        let kind = if path.join("cur").is_dir() && path.join("new").is_dir() {
            DirKind::Maildir
        } else {
            DirKind::Mh
        };
        drive_dir(kind, path, name, &archive_base, options, stale)
    } else {
        drive_mbox(path, name, &archive_base, options, stale)
    }
}

fn is_imap_url(mailbox: &str) -> bool {
    let lower = mailbox.to_ascii_lowercase();
    lower.starts_with("imap://") || lower.starts_with("imaps://")
}

/// Refuse to touch mailboxes the invoking user does not own; root
/// archiving a user's mail is the one sanctioned exception.
fn check_ownership(name: &str, meta: &fs::Metadata) -> Result<()> {
    let uid = unsafe { libc::getuid() };
    if uid != 0 && meta.uid() != uid {
        return user_error(format!(
            "you ({}) are not the owner of '{name}'",
            login_name()
        ));
    }
    Ok(())
}

/// Per-run scratch directory next to the archive, registered so abnormal
/// exits can sweep it.
fn make_temp_dir(archive_base: &Path, stale: &StaleHandle) -> Result<PathBuf> {
    let parent = archive_base.parent().unwrap_or_else(|| Path::new("."));
    let dir = tempfile::Builder::new()
        .prefix(".archivemail-")
        .tempdir_in(parent)
        .with_context(|| {
            format!("cannot create a temporary directory in '{}'", parent.display())
        })?
        .keep();
    stale
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .set_temp_dir(dir.clone());
    Ok(dir)
}

fn facts_of(message: &Message) -> MessageFacts {
    MessageFacts {
        delivery_time: message.delivery_time,
        size: message.size,
        flagged: message.flags.flagged,
        unread: !message.flags.seen,
    }
}

fn log_verdict(message: &Message, verdict: Verdict) {
    let id = message.message_id().unwrap_or("<no message id>");
    match verdict {
        Verdict::Archive => info!("archiving {id} ({} bytes)", message.size),
        Verdict::Retain => debug!("retaining {id}"),
    }
}

fn drive_mbox(
    path: &Path,
    display: &str,
    archive_base: &Path,
    options: &RunOptions,
    stale: &StaleHandle,
) -> Result<()> {
    info!("archiving mbox '{display}'");
    let mut stats = Stats::new();
    let mut mbox = Mbox::open(path)?;
    // Locked even for a dry run, so a cooperating delivery agent blocks
    // instead of tripping the size fence.
    mbox.lock(options, stale)?;
    let result = mbox_pass(&mut mbox, archive_base, options, stale, &mut stats, display);
    let unlock = mbox.unlock(stale);
    result?;
    unlock?;
    stats.print(display, options);
    Ok(())
}

fn mbox_pass(
    mbox: &mut Mbox,
    archive_base: &Path,
    options: &RunOptions,
    stale: &StaleHandle,
    stats: &mut Stats,
    display: &str,
) -> Result<()> {
    let now = now_epoch();
    let wants_archive = !options.dry_run && options.mode != RunMode::Delete;
    let wants_retain = !options.read_only();
    let temp_dir = if wants_archive || wants_retain {
        Some(make_temp_dir(archive_base, stale)?)
    } else {
        None
    };
    let mut archive_temp = match (&temp_dir, wants_archive) {
        (Some(dir), true) => Some(TempMbox::create(dir, !options.no_compress, stale)?),
        _ => None,
    };
    let mut retain_temp = match (&temp_dir, wants_retain) {
        (Some(dir), true) => Some(TempMbox::create(dir, false, stale)?),
        _ => None,
    };
    let mut dupes = IdentityCache::new(display);
    let mut count: u64 = 0;

    for message in mbox.messages()? {
        let message = message?;
        count += 1;
        stats.add_total(message.size);
        if options.warn_duplicates {
            dupes.warn_if_dupe(message.message_id());
        }
        let Body::MboxSpan { start, len } = message.body else {
            return unexpected_error("mbox iterator produced a non-span message");
        };
        let verdict = decide(&facts_of(&message), options, now);
        log_verdict(&message, verdict);
        match verdict {
            Verdict::Archive => {
                stats.add_archived(message.size);
                if let Some(temp) = &mut archive_temp {
                    temp.write_span(mbox.span_reader(start, len)?)?;
                }
            }
            Verdict::Retain => {
                if let Some(temp) = &mut retain_temp {
                    temp.write_span(mbox.span_reader(start, len)?)?;
                }
            }
        }
    }

    if count == 0 && mbox.starting_size > 0 {
        return unexpected_error(format!(
            "found no messages in non-empty mbox '{display}'; it may be corrupt"
        ));
    }
    // Concurrent-writer fence: a delivery during the run means every span
    // offset is suspect, so nothing gets mutated.
    if mbox.current_size()? != mbox.starting_size {
        return unexpected_error(format!(
            "mbox '{display}' changed size during the run; giving up before touching it"
        ));
    }

    if let Some(temp) = archive_temp {
        let archive_path = final_archive_path(archive_base, options);
        commit_archive(temp.close()?, &archive_path, options, stale)?;
    }

    if let Some(temp) = retain_temp {
        let retained = temp.close()?;
        if retained.written == mbox.starting_size {
            debug!("no messages archived from '{display}'; mbox untouched");
            retained.discard(stale)?;
        } else if let Err(err) = rewrite_mbox(mbox, &retained) {
            let saved = save_recovery(&retained, mbox.path(), stale);
            return Err(err.context(format!(
                "cannot rewrite '{display}'; the messages to keep are saved at '{}'",
                saved.display()
            )));
        } else {
            retained.discard(stale)?;
        }
        mbox.reset_timestamps();
    }
    Ok(())
}

fn rewrite_mbox(mbox: &mut Mbox, retained: &ClosedTemp) -> Result<()> {
    mbox.overwrite_with(&retained.path)?;
    mbox.commit()
}

/// Move the retain temp to a deterministic name the error message can
/// point at, and deregister it so cleanup never deletes it.
fn save_recovery(retained: &ClosedTemp, source: &Path, stale: &StaleHandle) -> PathBuf {
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("mailbox"));
    let target = retained
        .path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(
            "archivemail.{basename}.{}-{}-{}",
            gethostname::gethostname().to_string_lossy(),
            unsafe { libc::getuid() },
            std::process::id()
        ));
    let saved = match fs::rename(&retained.path, &target) {
        Ok(()) => target,
        Err(err) => {
            warn!("cannot rename recovery file: {err}");
            retained.path.clone()
        }
    };
    let mut registry = stale.lock().unwrap_or_else(|e| e.into_inner());
    registry.forget_temp_mbox(&retained.path);
    saved
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DirKind {
    Maildir,
    Mh,
}

fn drive_dir(
    kind: DirKind,
    path: &Path,
    display: &str,
    archive_base: &Path,
    options: &RunOptions,
    stale: &StaleHandle,
) -> Result<()> {
    match kind {
        DirKind::Maildir => info!("archiving maildir '{display}'"),
        DirKind::Mh => info!("archiving MH folder '{display}'"),
    }
    let now = now_epoch();
    let mut stats = Stats::new();
    let mut archive_temp = if !options.dry_run && options.mode != RunMode::Delete {
        let temp_dir = make_temp_dir(archive_base, stale)?;
        Some(TempMbox::create(&temp_dir, !options.no_compress, stale)?)
    } else {
        None
    };
    let mut dupes = IdentityCache::new(display);
    let mut delete_queue: Vec<PathBuf> = Vec::new();

    let messages: Box<dyn Iterator<Item = Result<Message>>> = match kind {
        DirKind::Maildir => Box::new(MaildirSource::open(path)?),
        DirKind::Mh => Box::new(MhSource::open(path)?),
    };
    for message in messages {
        let mut message = message?;
        stats.add_total(message.size);
        if options.warn_duplicates {
            dupes.warn_if_dupe(message.message_id());
        }
        let verdict = decide(&facts_of(&message), options, now);
        log_verdict(&message, verdict);
        if verdict != Verdict::Archive {
            continue;
        }
        stats.add_archived(message.size);
        if let Some(temp) = &mut archive_temp {
            // Maildir state lives in the filename, so the Status headers
            // are rewritten from the flags; MH messages go verbatim.
            if kind == DirKind::Maildir {
                message.apply_status_headers();
            }
            temp.write_message(&message, options.mangle_from)?;
        }
        if !options.read_only() {
            if let Body::File { path, .. } = &message.body {
                delete_queue.push(path.clone());
            }
        }
    }

    if let Some(temp) = archive_temp {
        let archive_path = final_archive_path(archive_base, options);
        commit_archive(temp.close()?, &archive_path, options, stale)?;
    }
    if !options.read_only() {
        remove_queued(&delete_queue)?;
    }
    stats.print(display, options);
    Ok(())
}

fn drive_imap(
    mailbox: &str,
    options: &RunOptions,
    stale: &StaleHandle,
    prompt: PasswordPrompt,
) -> Result<()> {
    let url = parse_imap_url(mailbox.trim_end_matches('/'), options.pwfile.is_some())?;
    let display = format!(
        "{}://{}@{}/{}",
        if url.secure { "imaps" } else { "imap" },
        url.user,
        url.host,
        url.folder
    );
    info!("archiving IMAP folder '{display}'");
    let password = match (&url.password, &options.pwfile) {
        (Some(password), _) => password.clone(),
        (None, Some(file)) => fs::read_to_string(file)
            .with_context(|| format!("cannot read pwfile '{}'", file.display()))?
            .trim_end_matches(['\r', '\n'])
            .to_string(),
        (None, None) => prompt(&url)?,
    };

    let cutoff = options.cutoff_epoch(now_epoch());
    let archive_base = make_archive_name(&url.folder, options, cutoff)?;
    if options.mode != RunMode::Delete {
        check_archive(&archive_base, options)?;
    }

    let mut stats = Stats::new();
    let mut source = ImapSource::connect(&url, &password, options)?;
    let result = imap_pass(
        &mut source,
        &url,
        &archive_base,
        cutoff,
        options,
        stale,
        &mut stats,
        &display,
    );
    let finish = source.finish();
    result?;
    finish?;
    stats.print(&display, options);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn imap_pass(
    source: &mut ImapSource,
    url: &ImapUrl,
    archive_base: &Path,
    cutoff: i64,
    options: &RunOptions,
    stale: &StaleHandle,
    stats: &mut Stats,
    display: &str,
) -> Result<()> {
    let folder = source.resolve_folder(&url.folder)?;
    let exists = source.open_folder(&folder)?;
    if exists == 0 {
        info!("folder '{folder}' is empty");
        return Ok(());
    }
    let sizes = source.fetch_sizes("1:*")?;
    for &size in sizes.values() {
        stats.add_total(size);
    }
    // --all takes the whole folder; a SEARCH would reintroduce the
    // UNFLAGGED/SEEN criteria that --all is supposed to override.
    let matches: Vec<u32> = if options.archive_all {
        (1..=exists).collect()
    } else {
        let filter = build_filter(options, cutoff);
        source.search_old(&filter)?
    };
    for seq in &matches {
        stats.add_archived(sizes.get(seq).copied().unwrap_or(0));
    }
    if options.dry_run || matches.is_empty() {
        return Ok(());
    }

    if options.mode != RunMode::Delete {
        let temp_dir = make_temp_dir(archive_base, stale)?;
        let mut temp = TempMbox::create(&temp_dir, !options.no_compress, stale)?;
        let mut dupes = IdentityCache::new(display);
        for &seq in &matches {
            let mut message = source.fetch_message(seq)?;
            if options.warn_duplicates {
                dupes.warn_if_dupe(message.message_id());
            }
            log_verdict(&message, Verdict::Archive);
            message.apply_status_headers();
            temp.write_message(&message, options.mangle_from)?;
        }
        let archive_path = final_archive_path(archive_base, options);
        commit_archive(temp.close()?, &archive_path, options, stale)?;
    }
    if options.mode != RunMode::Copy {
        source.delete_messages(&matches)?;
    }
    Ok(())
}
