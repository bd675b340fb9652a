//! The in-memory message model shared by all four sources: an ordered
//! header list with case-insensitive lookup, an optional native envelope
//! line, and a lazy body handle. The body is never buffered for file-backed
//! sources; only IMAP messages arrive as bytes.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use archivemail_core::Flags;

/// Where a message's body lives.
#[derive(Debug, Clone)]
pub enum Body {
    /// Byte range of the whole message (envelope included) inside the
    /// source mbox file; copied verbatim by the writers.
    MboxSpan { start: u64, len: u64 },
    /// A one-message file (maildir or MH); the body starts at `offset`.
    File { path: PathBuf, offset: u64 },
    /// Body bytes fetched over IMAP.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Message {
    /// Unfolded (name, value) pairs in original order, duplicates kept.
    headers: Vec<(String, String)>,
    /// Raw header block, LF line endings, without the terminating blank
    /// line. This is what the writers emit.
    header_block: Vec<u8>,
    /// The native `From ` line, mbox sources only, trailing newline kept.
    pub envelope_from: Option<String>,
    pub body: Body,
    pub size: u64,
    pub delivery_time: i64,
    pub flags: Flags,
}

impl Message {
    pub fn new(
        header_block: Vec<u8>,
        envelope_from: Option<String>,
        body: Body,
        size: u64,
    ) -> Result<Message> {
        let headers = parse_header_pairs(&header_block)?;
        Ok(Message {
            headers,
            header_block,
            envelope_from,
            body,
            size,
            delivery_time: 0,
            flags: Flags::default(),
        })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header_block(&self) -> &[u8] {
        &self.header_block
    }

    /// First value of the named header, case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get_header("Message-ID")
    }

    /// Replace any existing `Status`/`X-Status` headers with ones derived
    /// from the native flags. The native flag state is authoritative, so
    /// this replaces rather than merges; applied once, before writing.
    pub fn apply_status_headers(&mut self) {
        let (status, x_status) = self.flags.status_headers();
        let mut block = Vec::with_capacity(self.header_block.len());
        let mut skipping = false;
        for line in self.header_block.split_inclusive(|&b| b == b'\n') {
            if line.starts_with(b" ") || line.starts_with(b"\t") {
                if !skipping {
                    block.extend_from_slice(line);
                }
                continue;
            }
            skipping = header_name_is(line, b"status") || header_name_is(line, b"x-status");
            if !skipping {
                block.extend_from_slice(line);
            }
        }
        if !block.is_empty() && !block.ends_with(b"\n") {
            block.push(b'\n');
        }
        if let Some(status) = &status {
            block.extend_from_slice(format!("Status: {status}\n").as_bytes());
        }
        if let Some(x_status) = &x_status {
            block.extend_from_slice(format!("X-Status: {x_status}\n").as_bytes());
        }
        self.header_block = block;
        self.headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case("Status") && !key.eq_ignore_ascii_case("X-Status"));
        if let Some(status) = status {
            self.headers.push(("Status".to_string(), status));
        }
        if let Some(x_status) = x_status {
            self.headers.push(("X-Status".to_string(), x_status));
        }
    }
}

fn header_name_is(line: &[u8], name: &[u8]) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(colon) => line[..colon].trim_ascii().eq_ignore_ascii_case(name),
        None => false,
    }
}

/// Unfold a raw header block into (name, value) pairs.
pub fn parse_header_pairs(block: &[u8]) -> Result<Vec<(String, String)>> {
    if block.is_empty() {
        return Ok(Vec::new());
    }
    let (parsed, _) = mailparse::parse_headers(block).context("cannot parse message headers")?;
    Ok(parsed
        .iter()
        .map(|header| (header.get_key(), header.get_value()))
        .collect())
}

/// Read a header block off a buffered reader, up to and including the
/// blank separator line. Returns the block (blank line excluded) and the
/// total number of bytes consumed.
pub fn read_header_block<R: BufRead>(reader: &mut R) -> std::io::Result<(Vec<u8>, u64)> {
    let mut block = Vec::new();
    let mut consumed = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        consumed += n as u64;
        if line == b"\n" || line == b"\r\n" {
            break;
        }
        block.extend_from_slice(&line);
    }
    Ok((block, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivemail_core::Flags;
    use std::io::Cursor;

    fn message_with(block: &str) -> Message {
        Message::new(block.as_bytes().to_vec(), None, Body::Bytes(Vec::new()), 0).unwrap()
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_ordered() {
        let msg = message_with("Subject: hello\nX-Loop: one\nX-Loop: two\n");
        assert_eq!(msg.get_header("subject"), Some("hello"));
        assert_eq!(msg.get_header("X-LOOP"), Some("one"));
        assert_eq!(msg.headers().len(), 3);
    }

    #[test]
    fn status_injection_replaces_existing_headers() {
        let mut msg = message_with("Status: RO\nSubject: x\nX-Status: A\n");
        msg.flags = Flags {
            flagged: true,
            recent: true,
            ..Flags::default()
        };
        msg.apply_status_headers();
        let block = String::from_utf8(msg.header_block().to_vec()).unwrap();
        assert_eq!(block, "Subject: x\nX-Status: F\n");
        assert_eq!(msg.get_header("X-Status"), Some("F"));
        assert_eq!(msg.get_header("Status"), None);
    }

    #[test]
    fn status_injection_omits_empty_headers() {
        let mut msg = message_with("Status: R\nSubject: x\n");
        msg.flags = Flags {
            recent: true,
            ..Flags::default()
        };
        msg.apply_status_headers();
        let block = String::from_utf8(msg.header_block().to_vec()).unwrap();
        assert_eq!(block, "Subject: x\n");
    }

    #[test]
    fn status_injection_drops_continuation_lines_of_removed_headers() {
        let mut msg = message_with("X-Status: F\n garbage continuation\nSubject: x\n");
        msg.flags = Flags {
            seen: true,
            recent: true,
            ..Flags::default()
        };
        msg.apply_status_headers();
        let block = String::from_utf8(msg.header_block().to_vec()).unwrap();
        assert_eq!(block, "Subject: x\nStatus: R\n");
    }

    #[test]
    fn header_block_reader_stops_at_blank_line() -> Result<()> {
        let mut cursor = Cursor::new(b"A: 1\nB: 2\n\nbody\n".to_vec());
        let (block, consumed) = read_header_block(&mut cursor)?;
        assert_eq!(block, b"A: 1\nB: 2\n");
        assert_eq!(consumed, 11);
        Ok(())
    }
}
