use std::time::Instant;

use archivemail_core::{RunMode, RunOptions, nice_size};

/// Per-mailbox counters, printed as a one-line summary unless --quiet.
pub struct Stats {
    started: Instant,
    total_count: u64,
    total_bytes: u64,
    archived_count: u64,
    archived_bytes: u64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            started: Instant::now(),
            total_count: 0,
            total_bytes: 0,
            archived_count: 0,
            archived_bytes: 0,
        }
    }

    pub fn add_total(&mut self, size: u64) {
        self.total_count += 1;
        self.total_bytes += size;
    }

    pub fn add_archived(&mut self, size: u64) {
        self.archived_count += 1;
        self.archived_bytes += size;
    }

    pub fn archived_count(&self) -> u64 {
        self.archived_count
    }

    pub fn print(&self, mailbox: &str, options: &RunOptions) {
        if options.quiet {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        println!("{}", self.render(mailbox, options, elapsed));
    }

    fn render(&self, mailbox: &str, options: &RunOptions, elapsed: f64) -> String {
        let mut action = match options.mode {
            RunMode::Delete => "deleted",
            RunMode::Archive | RunMode::Copy => "archived",
        }
        .to_string();
        if options.dry_run {
            action = format!("I would have {action}");
        }
        format!(
            "{}: {} {} of {} message(s) ({} of {}) in {:.1} seconds",
            mailbox,
            action,
            self.archived_count,
            self.total_count,
            nice_size(self.archived_bytes),
            nice_size(self.total_bytes),
            elapsed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counted() -> Stats {
        let mut stats = Stats::new();
        for size in [4096, 2048, 1024] {
            stats.add_total(size);
        }
        stats.add_archived(4096);
        stats.add_archived(2048);
        stats
    }

    #[test]
    fn summary_counts_messages_and_bytes() {
        let line = counted().render("inbox", &RunOptions::default(), 0.51);
        assert_eq!(
            line,
            format!(
                "inbox: archived 2 of 3 message(s) ({} of {}) in 0.5 seconds",
                nice_size(6144),
                nice_size(7168)
            )
        );
    }

    #[test]
    fn dry_run_and_delete_change_the_action_words() {
        let options = RunOptions {
            dry_run: true,
            mode: RunMode::Delete,
            ..RunOptions::default()
        };
        let line = counted().render("inbox", &options, 0.0);
        assert!(line.contains("I would have deleted 2 of 3"));
    }
}
