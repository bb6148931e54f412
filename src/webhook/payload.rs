// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Outbound webhook payloads: trigger kinds, the frozen JSON envelope and
//! body signing.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use crate::store::{AccountRow, MessageRow};

type HmacSha256 = Hmac<Sha256>;

/// Event kinds a tenant application may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "message.updated")]
    MessageUpdated,
    #[serde(rename = "folder.updated")]
    FolderUpdated,
    #[serde(rename = "account.connected")]
    AccountConnected,
    #[serde(rename = "account.invalid_credentials")]
    AccountInvalidCredentials,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::MessageCreated => "message.created",
            TriggerKind::MessageUpdated => "message.updated",
            TriggerKind::FolderUpdated => "folder.updated",
            TriggerKind::AccountConnected => "account.connected",
            TriggerKind::AccountInvalidCredentials => "account.invalid_credentials",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message.created" => Some(TriggerKind::MessageCreated),
            "message.updated" => Some(TriggerKind::MessageUpdated),
            "folder.updated" => Some(TriggerKind::FolderUpdated),
            "account.connected" => Some(TriggerKind::AccountConnected),
            "account.invalid_credentials" => Some(TriggerKind::AccountInvalidCredentials),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event produced by the sync engine, before it is fanned out to
/// subscriptions.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: TriggerKind,
    pub object: serde_json::Value,
}

impl Event {
    pub fn new(kind: TriggerKind, object: serde_json::Value) -> Self {
        Self { kind, object }
    }
}

/// The frozen delivery body. `id` is the delivery id, unique per
/// (subscription, event) pair.
pub fn envelope_json(
    delivery_id: &str,
    kind: TriggerKind,
    created_at: i64,
    application_id: &str,
    object: &serde_json::Value,
) -> serde_json::Value {
    json!({
        "id": delivery_id,
        "type": kind.as_str(),
        "created_at": created_at,
        "application_id": application_id,
        "object": object,
    })
}

/// Trigger-specific body for message events.
pub fn message_object(account: &AccountRow, folder_name: &str, row: &MessageRow) -> serde_json::Value {
    // Account-scoped message id: stable per (grant, folder, uid) while
    // UIDVALIDITY holds.
    let scoped_id = format!("{}.{}.{}", account.grant_id, folder_name, row.uid);
    let mut participants = row.from_list();
    participants.extend(row.to_list());
    participants.extend(row.cc_list());
    json!({
        "id": scoped_id,
        "grant_id": account.grant_id,
        "thread_id": row.thread_id,
        "folder": folder_name,
        "subject": row.subject,
        "from": row.from_list(),
        "to": row.to_list(),
        "cc": row.cc_list(),
        "participants": participants,
        "message_id": row.message_id,
        "flags": row.flag_set(),
        "size": row.size,
        "date": row.internal_date,
    })
}

pub fn folder_object(account: &AccountRow, folder_name: &str, reason: &str) -> serde_json::Value {
    json!({
        "grant_id": account.grant_id,
        "folder": folder_name,
        "reason": reason,
    })
}

pub fn account_object(account: &AccountRow) -> serde_json::Value {
    json!({
        "grant_id": account.grant_id,
        "email": account.email,
        "provider": account.imap_host,
    })
}

/// HMAC-SHA256 of the raw body under the subscription secret, formatted for
/// the `X-Signature` header.
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time-ish verification helper for receivers and tests.
pub fn verify_signature(secret: &str, body: &str, header: &str) -> bool {
    let hex_part = match header.strip_prefix("sha256=") {
        Some(h) => h,
        None => return false,
    };
    let expected = match hex::decode(hex_part) {
        Ok(e) => e,
        Err(_) => return false,
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
