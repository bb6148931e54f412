// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extension set discovered from the server CAPABILITY response at login.
/// Feature use is gated on this; servers missing CONDSTORE or IDLE get the
/// polling fallbacks.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    pub idle: bool,
    pub condstore: bool,
    pub mv: bool,
    pub uidplus: bool,
}

impl CapabilitySet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = CapabilitySet::default();
        for name in names {
            match name.as_ref().to_ascii_uppercase().as_str() {
                "IDLE" => caps.idle = true,
                "CONDSTORE" => caps.condstore = true,
                "MOVE" => caps.mv = true,
                "UIDPLUS" => caps.uidplus = true,
                _ => {}
            }
        }
        caps
    }
}

/// Result of a SELECT: the server-side folder coordinates the sync state
/// machine keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSelection {
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub exists: u32,
    pub highest_modseq: Option<u64>,
}

/// Outcome of one IDLE wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed an untagged update (EXISTS / EXPUNGE / FETCH).
    Changed,
    /// The renewal ceiling elapsed with no server activity.
    Timeout,
    /// Cancellation was observed; DONE has been sent.
    Cancelled,
}

/// A single mailbox participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub email: String,
}

/// Envelope subset the index keeps. Bodies are never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeMeta {
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Per-message metadata from a UID FETCH.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub uid: u32,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
    pub envelope: EnvelopeMeta,
}

impl Default for FolderSelection {
    fn default() -> Self {
        Self {
            uidvalidity: None,
            uidnext: None,
            exists: 0,
            highest_modseq: None,
        }
    }
}

pub(crate) fn flag_name(flag: &async_imap::types::Flag<'_>) -> String {
    use async_imap::types::Flag;
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn decode_address(addr: &async_imap::imap_proto::Address<'_>) -> Option<Address> {
    let mailbox = addr
        .mailbox
        .as_ref()
        .and_then(|m| std::str::from_utf8(m).ok())?;
    let host = addr.host.as_ref().and_then(|h| std::str::from_utf8(h).ok())?;
    let name = addr
        .name
        .as_ref()
        .and_then(|n| std::str::from_utf8(n).ok())
        .map(|n| n.to_string());
    Some(Address {
        name,
        email: format!("{}@{}", mailbox, host),
    })
}

fn decode_addresses(
    addrs: &Option<Vec<async_imap::imap_proto::Address<'_>>>,
) -> Vec<Address> {
    addrs
        .as_ref()
        .map(|list| list.iter().filter_map(decode_address).collect())
        .unwrap_or_default()
}

fn decode_text(field: &Option<std::borrow::Cow<'_, [u8]>>) -> Option<String> {
    field
        .as_ref()
        .and_then(|v| std::str::from_utf8(v).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pull the References message-id list out of the raw header block.
/// ENVELOPE does not carry References, so it is fetched as RFC822.HEADER
/// and parsed here.
fn references_from_header(raw: &[u8]) -> Vec<String> {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };
    let value = parsed
        .headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case("References"))
        .map(|h| h.get_value());
    match value {
        Some(v) => v
            .split_whitespace()
            .filter(|tok| tok.starts_with('<') && tok.ends_with('>'))
            .map(|tok| tok.to_string())
            .collect(),
        None => Vec::new(),
    }
}

impl MessageMeta {
    /// Convert a raw FETCH response into the metadata the index keeps.
    /// Returns `None` when the response carries no UID (untagged noise).
    pub(crate) fn from_fetch(fetch: &async_imap::types::Fetch) -> Option<Self> {
        let uid = fetch.uid?;
        let flags: Vec<String> = fetch.flags().map(|f| flag_name(&f)).collect();
        let internal_date = fetch.internal_date().map(|dt| dt.with_timezone(&Utc));
        let size = fetch.size;

        let mut envelope = EnvelopeMeta::default();
        if let Some(env) = fetch.envelope() {
            envelope.subject = decode_text(&env.subject);
            envelope.from = decode_addresses(&env.from);
            envelope.to = decode_addresses(&env.to);
            envelope.cc = decode_addresses(&env.cc);
            envelope.bcc = decode_addresses(&env.bcc);
            envelope.message_id = decode_text(&env.message_id);
            envelope.in_reply_to = decode_text(&env.in_reply_to);
        }
        if let Some(header) = fetch.header() {
            envelope.references = references_from_header(header);
        }

        Some(MessageMeta {
            uid,
            flags,
            internal_date,
            size,
            envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_parses_known_names() {
        let caps = CapabilitySet::from_names(["IMAP4rev1", "IDLE", "CONDSTORE", "UIDPLUS"]);
        assert!(caps.idle);
        assert!(caps.condstore);
        assert!(caps.uidplus);
        assert!(!caps.mv);
    }

    #[test]
    fn references_parsed_from_raw_header() {
        let raw = b"Subject: Re: hello\r\nReferences: <a@x> <b@y>\r\nMessage-ID: <c@z>\r\n\r\n";
        let refs = references_from_header(raw);
        assert_eq!(refs, vec!["<a@x>".to_string(), "<b@y>".to_string()]);
    }

    #[test]
    fn references_absent_yields_empty() {
        let raw = b"Subject: hi\r\n\r\n";
        assert!(references_from_header(raw).is_empty());
    }
}
