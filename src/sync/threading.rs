// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thread id assignment.
//!
//! A message joins the thread rooted at the first entry of its References
//! chain (falling back to In-Reply-To, then its own Message-ID). Messages
//! with no usable message ids cluster by normalized subject plus the sorted
//! participant set. Both paths digest with SHA-256 so ids are stable across
//! re-syncs.

use sha2::{Digest, Sha256};

use crate::imap::types::EnvelopeMeta;

/// Compute the stable thread id for a message.
pub fn thread_id(envelope: &EnvelopeMeta) -> String {
    let root = envelope
        .references
        .first()
        .map(|s| s.as_str())
        .or(envelope.in_reply_to.as_deref())
        .or(envelope.message_id.as_deref());

    match root {
        Some(root) => digest(&["ref", root]),
        None => {
            let subject = normalize_subject(envelope.subject.as_deref().unwrap_or(""));
            let mut participants: Vec<String> = envelope
                .from
                .iter()
                .chain(envelope.to.iter())
                .chain(envelope.cc.iter())
                .map(|a| a.email.to_lowercase())
                .collect();
            participants.sort();
            participants.dedup();
            let joined = participants.join(",");
            digest(&["subj", &subject, &joined])
        }
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Strip reply/forward markers, collapse whitespace, casefold.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let mut stripped = None;
        for marker in ["re:", "fwd:", "fw:"] {
            if let Some(prefix) = s.get(..marker.len()) {
                if prefix.eq_ignore_ascii_case(marker) {
                    stripped = Some(s[marker.len()..].trim_start());
                    break;
                }
            }
        }
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
