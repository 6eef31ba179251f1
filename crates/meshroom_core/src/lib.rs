/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod channel;
pub mod config;
pub mod error;
pub mod http_retry;
pub mod lifecycle;
pub mod loopback;
pub mod media;
pub mod metrics;
pub mod registry;
pub mod relay_client;
pub mod room_events;
pub mod router;
pub mod session;
pub mod transport;
pub mod webrtc_transport;
pub mod ws_channel;

pub use meshroom_protocol as protocol;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
