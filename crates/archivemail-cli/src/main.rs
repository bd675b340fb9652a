use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::OnceLock;

use anyhow::Result;
use archivemail_core::{RunError, RunOptions, StaleHandle, new_stale_handle, user_error};
use archivemail_mail::imap::ImapUrl;
use clap::Parser;
use env_logger::Env;

mod cli;
mod name;
mod run;
mod stats;

use cli::Cli;

/// Snapshot of the stale-file registry for the signal handler.
static STALE: OnceLock<StaleHandle> = OnceLock::new();

extern "C" fn handle_fatal_signal(_sig: libc::c_int) {
    if let Some(stale) = STALE.get() {
        stale.lock().unwrap_or_else(|e| e.into_inner()).drain();
    }
    unsafe { libc::_exit(1) }
}

fn install_signal_handlers() {
    let handler = handle_fatal_signal as extern "C" fn(libc::c_int) as usize;
    for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
        unsafe {
            libc::signal(sig, handler as libc::sighandler_t);
        }
    }
}

fn init_logging(options: &RunOptions) {
    let level = if options.debug_imap > 0 {
        "debug"
    } else if options.verbose {
        "info"
    } else if options.quiet {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn prompt_password(url: &ImapUrl, options: &RunOptions) -> Result<String> {
    if options.quiet {
        return user_error(
            "cannot prompt for a password with --quiet; use --pwfile or put it in the URL",
        );
    }
    if !io::stdin().is_terminal() {
        return user_error("cannot prompt for a password without a terminal; use --pwfile");
    }
    eprint!("Enter password for {}@{}: ", url.user, url.host);
    io::stderr().flush()?;
    let password = read_password_no_echo()?;
    eprintln!();
    Ok(password)
}

/// Read one line from the terminal with echo turned off, restoring the
/// terminal state whatever happens.
fn read_password_no_echo() -> Result<String> {
    let fd = libc::STDIN_FILENO;
    let saved = unsafe {
        let mut term = std::mem::MaybeUninit::<libc::termios>::uninit();
        if libc::tcgetattr(fd, term.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let saved = term.assume_init();
        let mut no_echo = saved;
        no_echo.c_lflag &= !libc::ECHO;
        if libc::tcsetattr(fd, libc::TCSANOW, &no_echo) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        saved
    };
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line);
    unsafe {
        libc::tcsetattr(fd, libc::TCSANOW, &saved);
    }
    read?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn fail(err: anyhow::Error) -> ! {
    match err.downcast_ref::<RunError>() {
        Some(RunError::User(_)) => eprintln!("archivemail: {err:#}"),
        _ => eprintln!("archivemail: unexpected error: {err:#}"),
    }
    std::process::exit(1)
}

fn main() {
    let cli = Cli::parse();
    let options = match cli.to_options() {
        Ok(options) => options,
        Err(err) => fail(err),
    };
    init_logging(&options);
    let stale = STALE.get_or_init(new_stale_handle).clone();
    install_signal_handlers();

    let prompt_options = options.clone();
    let mut prompt = move |url: &ImapUrl| prompt_password(url, &prompt_options);
    if let Err(err) = run::run(&options, &cli.mailboxes, &stale, &mut prompt) {
        stale.lock().unwrap_or_else(|e| e.into_inner()).drain();
        fail(err);
    }
}
