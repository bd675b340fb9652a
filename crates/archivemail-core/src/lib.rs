//! Storage-agnostic core for archivemail: error taxonomy, run options,
//! message flags and their mbox Status/X-Status translation, delivery-time
//! inference, the archive/retain selection policy, and the stale-resource
//! registry shared with the signal handler.

use std::collections::HashSet;
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use log::{debug, warn};
use mailparse::dateparse;
use thiserror::Error;

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Error taxonomy. `User` stops the current invocation with a plain message,
/// `Unexpected` is an invariant violation or impossible filesystem/protocol
/// state, `LockUnavailable` is internal to the lock retry loop and escalates
/// to `Unexpected` once the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    User(String),
    #[error("{0}")]
    Unexpected(String),
    #[error("{0}")]
    LockUnavailable(String),
}

pub fn user_error<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(RunError::User(msg.into()).into())
}

pub fn unexpected_error<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(RunError::Unexpected(msg.into()).into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeLimit {
    /// Archive messages older than this many days.
    Days(u32),
    /// Archive messages delivered before this epoch timestamp.
    Date(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Move old messages into the archive (the default).
    Archive,
    /// Delete old messages without writing an archive.
    Delete,
    /// Write the archive but leave the source untouched.
    Copy,
}

/// Runtime options threaded through the whole run. One value per
/// invocation, never a module-level global.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub age: AgeLimit,
    pub min_size: Option<u64>,
    pub include_flagged: bool,
    pub preserve_unread: bool,
    pub archive_all: bool,
    pub mode: RunMode,
    pub dry_run: bool,
    pub mangle_from: bool,
    pub no_compress: bool,
    pub warn_duplicates: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub suffix: String,
    pub output_dir: Option<PathBuf>,
    pub pwfile: Option<PathBuf>,
    pub filter_append: Option<String>,
    pub debug_imap: u32,
    pub locking_attempts: u32,
    pub lock_sleep: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            age: AgeLimit::Days(180),
            min_size: None,
            include_flagged: false,
            preserve_unread: false,
            archive_all: false,
            mode: RunMode::Archive,
            dry_run: false,
            mangle_from: true,
            no_compress: false,
            warn_duplicates: false,
            quiet: false,
            verbose: false,
            suffix: "_archive".to_string(),
            output_dir: None,
            pwfile: None,
            filter_append: None,
            debug_imap: 0,
            locking_attempts: 5,
            lock_sleep: Duration::from_secs(1),
        }
    }
}

impl RunOptions {
    /// Complain about bad options now rather than halfway through a mailbox.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let AgeLimit::Days(days) = self.age {
            if days >= 10000 {
                return user_error("--days argument must be less than 10000");
            }
        }
        if let Some(size) = self.min_size {
            if size < 1 {
                return user_error("--size argument must be greater than zero");
            }
        }
        if self.quiet && self.verbose {
            return user_error("you cannot use both the --quiet and --verbose options");
        }
        if let Some(dir) = &self.output_dir {
            check_sane_destdir(dir)?;
        }
        if let Some(pwfile) = &self.pwfile {
            if !pwfile.is_file() {
                return user_error(format!("pwfile {} does not exist", pwfile.display()));
            }
        }
        Ok(())
    }

    /// The instant separating old mail from new, as an epoch timestamp.
    pub fn cutoff_epoch(&self, now: i64) -> i64 {
        match self.age {
            AgeLimit::Days(days) => now - i64::from(days) * SECONDS_PER_DAY,
            AgeLimit::Date(epoch) => epoch,
        }
    }

    /// A read-only run never mutates the source mailbox.
    pub fn read_only(&self) -> bool {
        self.dry_run || self.mode == RunMode::Copy
    }
}

/// Primitive check that a directory is a plausible archive destination.
pub fn check_sane_destdir(dir: &Path) -> anyhow::Result<()> {
    if !dir.is_dir() {
        return user_error(format!(
            "output directory does not exist: '{}'",
            dir.display()
        ));
    }
    if !path_is_writable(dir) {
        return user_error(format!(
            "no write permission on output directory: '{}'",
            dir.display()
        ));
    }
    Ok(())
}

pub fn path_is_writable(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::W_OK) == 0 }
}

/// Parse a `--date` argument. ISO format, Internet format, or Internet
/// format with full month names.
pub fn parse_date_argument(arg: &str) -> anyhow::Result<i64> {
    for format in ["%Y-%m-%d", "%d %b %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(arg, format) {
            if let Some(datetime) = date.and_hms_opt(0, 0, 0) {
                if let Some(epoch) = local_epoch(datetime) {
                    return Ok(epoch);
                }
            }
        }
    }
    user_error(format!(
        "cannot parse the date argument '{arg}'\n\
         The date should be in ISO format (eg '2002-04-23'),\n\
         Internet format (eg '23 Apr 2002') or\n\
         Internet format with full month names (eg '23 April 2002')"
    ))
}

fn local_epoch(datetime: NaiveDateTime) -> Option<i64> {
    match Local.from_local_datetime(&datetime) {
        LocalResult::Single(dt) => Some(dt.timestamp()),
        LocalResult::Ambiguous(dt, _) => Some(dt.timestamp()),
        LocalResult::None => None,
    }
}

/// Native message status flags, normalized across the four mailbox formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub draft: bool,
    pub deleted: bool,
    pub recent: bool,
}

impl Flags {
    /// Decode a maildir `:2,<letters>` info suffix. Files under `cur` are no
    /// longer recent regardless of their letters.
    pub fn from_maildir_info(info: &str, in_cur: bool) -> Flags {
        let mut flags = Flags {
            recent: !in_cur,
            ..Flags::default()
        };
        for letter in info.chars() {
            match letter {
                'D' => flags.draft = true,
                'F' => flags.flagged = true,
                'R' => flags.answered = true,
                'S' => flags.seen = true,
                'T' => flags.deleted = true,
                _ => {}
            }
        }
        flags
    }

    /// Reconstruct flags from mbox/MH `Status`/`X-Status` headers.
    pub fn from_status_headers(status: Option<&str>, x_status: Option<&str>) -> Flags {
        let status = status.unwrap_or("");
        let x_status = x_status.unwrap_or("");
        Flags {
            seen: status.contains('R'),
            recent: !status.contains('O'),
            flagged: x_status.contains('F'),
            answered: x_status.contains('A'),
            draft: false,
            deleted: false,
        }
    }

    /// Translate native flags into synthetic `Status`/`X-Status` header
    /// values. Returns `None` for a header that would be empty; Draft and
    /// Deleted have no mbox equivalent.
    pub fn status_headers(&self) -> (Option<String>, Option<String>) {
        let mut status = String::new();
        let mut x_status = String::new();
        if self.seen {
            status.push('R');
        }
        if !self.recent {
            status.push('O');
        }
        if self.flagged {
            x_status.push('F');
        }
        if self.answered {
            x_status.push('A');
        }
        let status = (!status.is_empty()).then_some(status);
        let x_status = (!x_status.is_empty()).then_some(x_status);
        (status, x_status)
    }
}

/// What the policy needs to know about one message.
#[derive(Debug, Clone, Copy)]
pub struct MessageFacts {
    pub delivery_time: i64,
    pub size: u64,
    pub flagged: bool,
    pub unread: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Archive,
    Retain,
}

/// The archive/retain decision. Short-circuits on the first failing
/// predicate; a failing predicate means the message is retained.
pub fn decide(facts: &MessageFacts, options: &RunOptions, now: i64) -> Verdict {
    if options.archive_all {
        return Verdict::Archive;
    }
    let old = match options.age {
        AgeLimit::Days(days) => is_older_than_days(facts.delivery_time, days, now),
        AgeLimit::Date(epoch) => is_older_than_time(facts.delivery_time, epoch),
    };
    if !old {
        return Verdict::Retain;
    }
    if facts.flagged && !options.include_flagged {
        debug!("retaining: message is flagged important");
        return Verdict::Retain;
    }
    if let Some(min_size) = options.min_size {
        if facts.size < min_size {
            debug!(
                "retaining: message is too small ({} bytes, minimum {})",
                facts.size, min_size
            );
            return Verdict::Retain;
        }
    }
    if options.preserve_unread && facts.unread {
        debug!("retaining: message is unread");
        return Verdict::Retain;
    }
    Verdict::Archive
}

fn is_older_than_days(delivery_time: i64, max_days: u32, now: i64) -> bool {
    if delivery_time > now {
        debug!("message has a date in the future");
        return false;
    }
    delivery_time + i64::from(max_days) * SECONDS_PER_DAY < now
}

fn is_older_than_time(delivery_time: i64, cutoff: i64) -> bool {
    delivery_time < cutoff
}

/// Guess the delivery time of a message. Headers are tried from most to
/// least trustworthy, then the envelope-from date, then the backing file's
/// modification time, then the current time (which guarantees the message
/// is never considered old).
pub fn guess_delivery_time(
    headers: &[(String, String)],
    envelope_from: Option<&str>,
    backing_file: Option<&Path>,
) -> i64 {
    for name in ["Delivery-date", "Received", "Resent-Date", "Date"] {
        for (key, value) in headers {
            if !key.eq_ignore_ascii_case(name) {
                continue;
            }
            // For Received, the date is the part after the final ';'.
            let candidate = if name.eq_ignore_ascii_case("Received") {
                match value.rsplit_once(';') {
                    Some((_, date)) => date,
                    None => continue,
                }
            } else {
                value.as_str()
            };
            if let Some(epoch) = parse_header_date(candidate) {
                debug!("using valid time found in '{name}' header");
                return epoch;
            }
        }
    }
    if let Some(line) = envelope_from {
        if let Some(epoch) = parse_envelope_date(line) {
            debug!("using valid time found in the envelope From_ line");
            return epoch;
        }
    }
    if let Some(path) = backing_file {
        if let Ok(meta) = std::fs::metadata(path) {
            if let Ok(mtime) = meta.modified() {
                if let Ok(age) = mtime.duration_since(UNIX_EPOCH) {
                    debug!(
                        "using last-modification time of '{}'",
                        path.display()
                    );
                    return age.as_secs() as i64;
                }
            }
        }
    }
    debug!("no valid times found at all, using the current time");
    now_epoch()
}

/// Parse an RFC 2822 date header value. `dateparse` drains input with no
/// recognizable date tokens and reports it as epoch 0, so that result is
/// treated as a parse failure and the caller's fallback chain continues.
fn parse_header_date(value: &str) -> Option<i64> {
    match dateparse(value.trim()) {
        Ok(epoch) if epoch > 0 => Some(epoch),
        _ => None,
    }
}

/// Parse the trailing date of a `From <addr> <date>` envelope line.
fn parse_envelope_date(line: &str) -> Option<i64> {
    let mut tokens = line.trim_end().splitn(3, char::is_whitespace);
    tokens.next()?; // "From"
    tokens.next()?; // the address
    let date = tokens.next()?.trim();
    if let Some(epoch) = parse_header_date(date) {
        return Some(epoch);
    }
    // asctime, as written by mail delivery agents.
    let datetime = NaiveDateTime::parse_from_str(date, "%a %b %e %H:%M:%S %Y").ok()?;
    local_epoch(datetime)
}

/// Guess a Return-Path address for a message lacking a native envelope:
/// `Return-path` header, a bare address from `From`, else the login name of
/// the running user.
pub fn guess_return_path(headers: &[(String, String)]) -> String {
    for name in ["Return-path", "From"] {
        for (key, value) in headers {
            if !key.eq_ignore_ascii_case(name) {
                continue;
            }
            if let Some(addr) = bare_address(value) {
                return addr;
            }
        }
    }
    login_name()
}

fn bare_address(value: &str) -> Option<String> {
    let parsed = mailparse::addrparse(value).ok()?;
    for addr in parsed.iter() {
        match addr {
            mailparse::MailAddr::Single(info) if !info.addr.is_empty() => {
                return Some(info.addr.clone());
            }
            mailparse::MailAddr::Group(group) => {
                if let Some(info) = group.addrs.first() {
                    if !info.addr.is_empty() {
                        return Some(info.addr.clone());
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Build a `From <addr> <asctime>` envelope line for a message that has
/// none, from the guessed return path and the inferred delivery time.
pub fn make_envelope_from(headers: &[(String, String)], delivery_time: i64) -> String {
    let address = guess_return_path(headers);
    let date = Local
        .timestamp_opt(delivery_time, 0)
        .earliest()
        .map(|dt| dt.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_else(|| String::from("Thu Jan  1 00:00:00 1970"));
    format!("From {address} {date}\n")
}

/// The login name of the running user, the way mutt figures it out.
pub fn login_name() -> String {
    unsafe {
        let passwd = libc::getpwuid(libc::getuid());
        if !passwd.is_null() && !(*passwd).pw_name.is_null() {
            if let Ok(name) = CStr::from_ptr((*passwd).pw_name).to_str() {
                return name.to_string();
            }
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "nobody".to_string())
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|age| age.as_secs() as i64)
        .unwrap_or(0)
}

/// Not-yet-committed temp files, dotlocks and the per-run temp directory.
/// Every resource is registered the instant it is created and removed the
/// instant it is cleanly released; `drain` runs on abnormal exit only.
#[derive(Debug, Default)]
pub struct StaleFiles {
    dotlocks: Vec<PathBuf>,
    temp_mboxes: Vec<PathBuf>,
    temp_dir: Option<PathBuf>,
}

impl StaleFiles {
    pub fn add_dotlock(&mut self, path: PathBuf) {
        self.dotlocks.push(path);
    }

    pub fn forget_dotlock(&mut self, path: &Path) {
        self.dotlocks.retain(|p| p != path);
    }

    pub fn add_temp_mbox(&mut self, path: PathBuf) {
        self.temp_mboxes.push(path);
    }

    pub fn forget_temp_mbox(&mut self, path: &Path) {
        self.temp_mboxes.retain(|p| p != path);
    }

    pub fn set_temp_dir(&mut self, path: PathBuf) {
        self.temp_dir = Some(path);
    }

    pub fn clear_temp_dir(&mut self) {
        self.temp_dir = None;
    }

    /// Remove whatever is still registered: temp mboxes first, then
    /// dotlocks, then the temp directory (only if empty). Never fails.
    pub fn drain(&mut self) {
        while let Some(path) = self.temp_mboxes.pop() {
            debug!("removing stale temporary mbox '{}'", path.display());
            let _ = std::fs::remove_file(&path);
        }
        while let Some(path) = self.dotlocks.pop() {
            debug!("removing stale dotlock file '{}'", path.display());
            let _ = std::fs::remove_file(&path);
        }
        if let Some(path) = self.temp_dir.take() {
            debug!("removing stale tempfile directory '{}'", path.display());
            if let Err(err) = std::fs::remove_dir(&path) {
                warn!(
                    "cannot remove temporary directory '{}': {err}",
                    path.display()
                );
            }
        }
    }
}

/// Run-context handle to the registry; the signal handler holds a snapshot
/// of the same allocation.
pub type StaleHandle = Arc<Mutex<StaleFiles>>;

pub fn new_stale_handle() -> StaleHandle {
    Arc::new(Mutex::new(StaleFiles::default()))
}

/// Remembers Message-IDs and warns when one is seen twice. Diagnostic only:
/// duplicates are neither skipped nor fatal.
pub struct IdentityCache {
    seen: HashSet<String>,
    mailbox_name: String,
}

impl IdentityCache {
    pub fn new(mailbox_name: &str) -> IdentityCache {
        IdentityCache {
            seen: HashSet::new(),
            mailbox_name: mailbox_name.to_string(),
        }
    }

    pub fn warn_if_dupe(&mut self, message_id: Option<&str>) {
        let Some(id) = message_id else { return };
        if !self.seen.insert(id.to_string()) {
            warn!(
                "duplicate message id: '{}' in mailbox '{}'",
                id, self.mailbox_name
            );
        }
    }
}

/// Render a byte count as 'B', 'kB' or 'MB' for the statistics line.
pub fn nice_size(size: u64) -> String {
    let kb = size as f64 / 1024.0;
    let mb = kb / 1024.0;
    if mb >= 1.0 {
        format!("{:.1}MB", (mb * 10.0).round() / 10.0)
    } else if kb >= 1.0 {
        format!("{:.0}kB", kb.round())
    } else {
        format!("{size}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn old_message(now: i64, days_old: i64) -> MessageFacts {
        MessageFacts {
            delivery_time: now - days_old * SECONDS_PER_DAY,
            size: 2048,
            flagged: false,
            unread: false,
        }
    }

    #[test]
    fn days_policy_archives_only_old_enough_messages() {
        let now = now_epoch();
        let options = RunOptions {
            age: AgeLimit::Days(180),
            ..RunOptions::default()
        };
        assert_eq!(decide(&old_message(now, 181), &options, now), Verdict::Archive);
        assert_eq!(decide(&old_message(now, 179), &options, now), Verdict::Retain);
    }

    #[test]
    fn future_dated_message_is_never_old() {
        let now = now_epoch();
        let options = RunOptions {
            age: AgeLimit::Days(0),
            ..RunOptions::default()
        };
        let facts = MessageFacts {
            delivery_time: now + SECONDS_PER_DAY,
            size: 100,
            flagged: false,
            unread: false,
        };
        assert_eq!(decide(&facts, &options, now), Verdict::Retain);
    }

    #[test]
    fn date_policy_compares_against_cutoff() {
        let now = now_epoch();
        let cutoff = now - 10 * SECONDS_PER_DAY;
        let options = RunOptions {
            age: AgeLimit::Date(cutoff),
            ..RunOptions::default()
        };
        assert_eq!(decide(&old_message(now, 11), &options, now), Verdict::Archive);
        assert_eq!(decide(&old_message(now, 9), &options, now), Verdict::Retain);
    }

    #[test]
    fn flagged_messages_are_retained_unless_included() {
        let now = now_epoch();
        let mut facts = old_message(now, 365);
        facts.flagged = true;
        let mut options = RunOptions::default();
        assert_eq!(decide(&facts, &options, now), Verdict::Retain);
        options.include_flagged = true;
        assert_eq!(decide(&facts, &options, now), Verdict::Archive);
    }

    #[test]
    fn size_limit_is_a_strict_less_than() {
        let now = now_epoch();
        let mut facts = old_message(now, 365);
        let options = RunOptions {
            min_size: Some(2048),
            ..RunOptions::default()
        };
        facts.size = 2048;
        assert_eq!(decide(&facts, &options, now), Verdict::Archive);
        facts.size = 2047;
        assert_eq!(decide(&facts, &options, now), Verdict::Retain);
    }

    #[test]
    fn unread_messages_are_retained_when_preserved() {
        let now = now_epoch();
        let mut facts = old_message(now, 365);
        facts.unread = true;
        let mut options = RunOptions::default();
        assert_eq!(decide(&facts, &options, now), Verdict::Archive);
        options.preserve_unread = true;
        assert_eq!(decide(&facts, &options, now), Verdict::Retain);
    }

    #[test]
    fn archive_all_overrides_every_other_check() {
        let now = now_epoch();
        let facts = MessageFacts {
            delivery_time: now,
            size: 1,
            flagged: true,
            unread: true,
        };
        let options = RunOptions {
            archive_all: true,
            min_size: Some(1000),
            preserve_unread: true,
            ..RunOptions::default()
        };
        assert_eq!(decide(&facts, &options, now), Verdict::Archive);
    }

    #[test]
    fn maildir_info_decodes_flag_letters() {
        let flags = Flags::from_maildir_info("FS", false);
        assert!(flags.flagged && flags.seen && flags.recent);
        assert!(!flags.answered && !flags.draft && !flags.deleted);
        let flags = Flags::from_maildir_info("RT", true);
        assert!(flags.answered && flags.deleted && !flags.recent);
        assert!(!flags.seen);
    }

    #[test]
    fn status_headers_follow_the_translation_table() {
        let flags = Flags::from_maildir_info("FS", false);
        assert_eq!(
            flags.status_headers(),
            (Some("R".to_string()), Some("F".to_string()))
        );
        let flags = Flags::from_maildir_info("RT", true);
        assert_eq!(
            flags.status_headers(),
            (Some("O".to_string()), Some("A".to_string()))
        );
        // Nothing to say: both headers omitted, not written empty.
        let flags = Flags {
            recent: true,
            ..Flags::default()
        };
        assert_eq!(flags.status_headers(), (None, None));
    }

    #[test]
    fn status_headers_round_trip_to_flags() {
        let flags = Flags::from_status_headers(Some("RO"), Some("FA"));
        assert!(flags.seen && !flags.recent && flags.flagged && flags.answered);
        let flags = Flags::from_status_headers(None, None);
        assert!(!flags.seen && flags.recent);
    }

    #[test]
    fn delivery_time_prefers_delivery_date_header() {
        let headers = headers(&[
            ("Date", "Mon, 1 Jan 2001 00:00:00 +0000"),
            ("Delivery-date", "Tue, 2 Jan 2001 00:00:00 +0000"),
        ]);
        let epoch = guess_delivery_time(&headers, None, None);
        assert_eq!(epoch, dateparse("Tue, 2 Jan 2001 00:00:00 +0000").unwrap());
    }

    #[test]
    fn received_header_uses_date_after_final_semicolon() {
        let headers = headers(&[(
            "Received",
            "from mail.example.org (mail.example.org [10.0.0.1]); \
             by mx.example.com; Wed, 3 Jan 2001 12:00:00 +0000",
        )]);
        let epoch = guess_delivery_time(&headers, None, None);
        assert_eq!(epoch, dateparse("Wed, 3 Jan 2001 12:00:00 +0000").unwrap());
    }

    #[test]
    fn unparsable_headers_fall_back_to_envelope_date() {
        let headers = headers(&[("Date", "not a date at all")]);
        let envelope = "From sender@example.org Thu Jan  4 09:30:00 2001";
        let epoch = guess_delivery_time(&headers, Some(envelope), None);
        let expected = NaiveDate::from_ymd_opt(2001, 1, 4)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert_eq!(epoch, local_epoch(expected).unwrap());
    }

    #[test]
    fn garbage_date_header_is_not_the_epoch() {
        let before = now_epoch();
        let headers = headers(&[("Date", "not a date at all")]);
        let epoch = guess_delivery_time(&headers, None, None);
        // A message whose only date is unparsable must never look old.
        assert!(epoch >= before);
    }

    #[test]
    fn no_dates_anywhere_yields_roughly_now() {
        let before = now_epoch();
        let epoch = guess_delivery_time(&[], None, None);
        assert!(epoch >= before && epoch <= now_epoch());
    }

    #[test]
    fn file_mtime_is_used_before_giving_up() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("1");
        std::fs::write(&path, b"Subject: x\n\nbody\n")?;
        let mtime = std::fs::metadata(&path)?
            .modified()?
            .duration_since(UNIX_EPOCH)?
            .as_secs() as i64;
        assert_eq!(guess_delivery_time(&[], None, Some(&path)), mtime);
        Ok(())
    }

    #[test]
    fn return_path_guess_falls_back_from_return_path_to_from() {
        let hs = headers(&[
            ("From", "Alice <alice@example.org>"),
            ("Return-path", "<bounce@example.org>"),
        ]);
        assert_eq!(guess_return_path(&hs), "bounce@example.org");
        let hs = headers(&[("From", "Alice <alice@example.org>")]);
        assert_eq!(guess_return_path(&hs), "alice@example.org");
        assert_eq!(guess_return_path(&[]), login_name());
    }

    #[test]
    fn envelope_line_has_address_and_asctime_date() {
        let hs = headers(&[("From", "alice@example.org")]);
        let line = make_envelope_from(&hs, 994939200); // mid-July 2001
        assert!(line.starts_with("From alice@example.org "));
        assert!(line.ends_with("2001\n"));
        assert_eq!(line.trim_end().split_whitespace().count(), 7);
    }

    #[test]
    fn date_argument_accepts_three_formats() {
        let iso = parse_date_argument("2002-04-23").unwrap();
        assert_eq!(parse_date_argument("23 Apr 2002").unwrap(), iso);
        assert_eq!(parse_date_argument("23 April 2002").unwrap(), iso);
        let err = parse_date_argument("yesterday").unwrap_err();
        assert!(err.to_string().contains("ISO format"));
    }

    #[test]
    fn validation_rejects_bad_combinations() {
        let options = RunOptions {
            age: AgeLimit::Days(10000),
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
        let options = RunOptions {
            min_size: Some(0),
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
        let options = RunOptions {
            quiet: true,
            verbose: true,
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
        let options = RunOptions {
            pwfile: Some(PathBuf::from("/nonexistent/pwfile")),
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn stale_registry_drains_temp_files_then_dotlocks_then_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let keep = dir.path().to_path_buf();
        let temp_mbox = keep.join("archivemail-temp");
        let dotlock = keep.join("inbox.lock");
        let work_dir = keep.join("work");
        std::fs::write(&temp_mbox, b"x")?;
        std::fs::write(&dotlock, b"")?;
        std::fs::create_dir(&work_dir)?;

        let mut stale = StaleFiles::default();
        stale.add_temp_mbox(temp_mbox.clone());
        stale.add_dotlock(dotlock.clone());
        stale.set_temp_dir(work_dir.clone());
        stale.drain();

        assert!(!temp_mbox.exists());
        assert!(!dotlock.exists());
        assert!(!work_dir.exists());
        Ok(())
    }

    #[test]
    fn stale_registry_forgets_released_resources() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let kept = dir.path().join("kept");
        std::fs::write(&kept, b"x")?;
        let mut stale = StaleFiles::default();
        stale.add_temp_mbox(kept.clone());
        stale.forget_temp_mbox(&kept);
        stale.drain();
        assert!(kept.exists());
        Ok(())
    }

    #[test]
    fn nonempty_temp_dir_is_left_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work_dir = dir.path().join("work");
        std::fs::create_dir(&work_dir)?;
        std::fs::write(work_dir.join("leftover"), b"x")?;
        let mut stale = StaleFiles::default();
        stale.set_temp_dir(work_dir.clone());
        stale.drain();
        assert!(work_dir.exists());
        Ok(())
    }

    #[test]
    fn nice_size_picks_sensible_units() {
        assert_eq!(nice_size(0), "0B");
        assert_eq!(nice_size(1023), "1023B");
        assert_eq!(nice_size(2048), "2kB");
        assert_eq!(nice_size(3 * 1024 * 1024), "3.0MB");
    }
}
