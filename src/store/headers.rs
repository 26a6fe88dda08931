//! One-pass header extraction at delivery time
//!
//! The envelope fields and top-level MIME structure are parsed exactly once
//! when a message enters the store and cached redundantly on the message
//! row, so fetch and sort never re-parse payloads.

use chrono::DateTime;
use mailparse::MailHeaderMap;

use crate::error::{Error, Result};
use crate::models::{BodyStructure, CachedHeaders};

pub(crate) struct ParsedMessage {
    /// Byte length of the header section including the blank-line separator.
    pub header_len: usize,
    pub cached: CachedHeaders,
    pub structure: BodyStructure,
}

pub(crate) fn parse_message(raw: &[u8]) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(raw).map_err(|e| Error::BadMessage(e.to_string()))?;

    let first = |name: &str| mail.headers.get_first_value(name);
    let date = first("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    let cached = CachedHeaders {
        from: first("From"),
        to: first("To"),
        cc: first("Cc"),
        bcc: first("Bcc"),
        subject: first("Subject"),
        date,
        message_id: first("Message-ID"),
        in_reply_to: first("In-Reply-To"),
    };

    let structure = BodyStructure {
        content_type: mail.ctype.mimetype.clone(),
        parts: mail.subparts.len() as u32,
        encoding: first("Content-Transfer-Encoding"),
    };

    Ok(ParsedMessage {
        header_len: header_end(raw),
        cached,
        structure,
    })
}

/// Offset of the first byte after the header/body separator. A message
/// without a blank line is all header.
pub(crate) fn header_end(raw: &[u8]) -> usize {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            if raw.get(i + 1) == Some(&b'\n') {
                return i + 2;
            }
            if raw.get(i + 1) == Some(&b'\r') && raw.get(i + 2) == Some(&b'\n') {
                return i + 3;
            }
        }
        i += 1;
    }
    raw.len()
}

/// ASCII case-insensitive substring search, used by the textual search
/// criteria.
pub(crate) fn contains_ci(haystack: &[u8], needle: &str) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Utc};

    const SAMPLE: &[u8] = b"From: Alice <alice@example.org>\r\n\
To: bob@example.org\r\n\
Subject: lunch?\r\n\
Date: Tue, 1 Apr 2025 12:00:00 +0000\r\n\
Message-ID: <m1@example.org>\r\n\
\r\n\
Meet at noon.\r\n";

    #[test]
    fn test_parse_caches_envelope_fields() {
        let parsed = parse_message(SAMPLE).unwrap();
        assert_eq!(
            parsed.cached.from.as_deref(),
            Some("Alice <alice@example.org>")
        );
        assert_eq!(parsed.cached.to.as_deref(), Some("bob@example.org"));
        assert_eq!(parsed.cached.subject.as_deref(), Some("lunch?"));
        assert_eq!(parsed.cached.message_id.as_deref(), Some("<m1@example.org>"));
        let date = parsed.cached.date.unwrap().with_timezone(&Utc);
        assert_eq!((date.year(), date.month(), date.day()), (2025, 4, 1));
    }

    #[test]
    fn test_header_end_splits_at_blank_line() {
        let len = header_end(SAMPLE);
        assert_eq!(&SAMPLE[len..], b"Meet at noon.\r\n");
        assert!(SAMPLE[..len].ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn test_header_end_lf_only() {
        let raw = b"Subject: x\n\nbody";
        assert_eq!(&raw[header_end(raw)..], b"body");
    }

    #[test]
    fn test_header_end_without_body() {
        let raw = b"Subject: x\r\n";
        assert_eq!(header_end(raw), raw.len());
    }

    #[test]
    fn test_structure_counts_parts() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\
\r\n\
--b\r\nContent-Type: text/plain\r\n\r\none\r\n\
--b\r\nContent-Type: text/html\r\n\r\n<p>two</p>\r\n\
--b--\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.structure.content_type, "multipart/mixed");
        assert_eq!(parsed.structure.parts, 2);
    }

    #[test]
    fn test_contains_ci() {
        assert!(contains_ci(b"Hello World", "world"));
        assert!(contains_ci(b"Hello World", ""));
        assert!(!contains_ci(b"Hello", "elsewhere"));
    }
}
