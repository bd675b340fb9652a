//! Mailbox storage layer: the message model, the four message sources
//! (mbox, maildir, MH, IMAP), mbox locking, and the temp/archive writers
//! with their commit protocol.

pub mod archive;
pub mod dir;
pub mod imap;
pub mod lock;
pub mod mbox;
pub mod message;
