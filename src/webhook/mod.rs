// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Webhook delivery: payload contract, signing and the dispatcher.

pub mod dispatcher;
pub mod payload;

pub use dispatcher::{
    backoff_delay, DeliveryTransport, DispatchConfig, DispatchError, Dispatcher, HttpTransport,
};
pub use payload::{sign_body, verify_signature, Event, TriggerKind};
