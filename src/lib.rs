// SPDX-License-Identifier: MIT
//! incorp — interactive US company formation, built on five remote
//! formation agents (name check, document filling, state filing, payment,
//! certificate generation).
//!
//! The library splits into four load-bearing pieces plus glue:
//!
//! - [`agent`] — resilient HTTP execution against the remote agents:
//!   retries with exponential backoff, idempotency keys, health probes.
//! - [`review`] — a single-shot localhost server that shows a generated
//!   certificate in the browser and blocks until approve/cancel/timeout.
//! - [`session`] — encrypted on-disk persistence for in-progress
//!   formations, with checksum-verified backups.
//! - [`crypto`] — the AEAD and HMAC primitives behind [`session`].
//! - [`workflow`] — composes the above into the certificate review flow.
//! - [`config`] — `config.toml` plus env/CLI overrides.

pub mod agent;
pub mod config;
pub mod crypto;
pub mod review;
pub mod session;
pub mod workflow;
