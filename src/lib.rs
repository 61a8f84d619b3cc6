//! The Rust SDK for Insert Affiliate, an affiliate attribution platform for apps with in-app
//! purchases.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that remembers which affiliate referred the current
//! device. A persistent 6-character user ID is generated once per device, and a referral link (or
//! a short code typed in by the user) is resolved into an affiliate short code. Together they form
//! the affiliate identifier `{shortCode}-{userId}`, which is attached to tracked events, expected
//! store transactions, and purchase validation requests.
//!
//! An attribution window can be configured on [`Client::initialize`]. Once the window has passed
//! since the affiliate was set, the identifier is no longer reported.
//!
//! State is persisted through an [`IdentityStore`]. [`JsonFileIdentityStore`] keeps it in a file;
//! hosts with their own storage can implement the trait.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use insert_affiliate::{ClientConfig, JsonFileIdentityStore};
//! # async fn run() {
//! let client = ClientConfig::new(JsonFileIdentityStore::new("insert-affiliate.json")).to_client();
//! client.initialize(Some("ACME123"), false, None).await;
//!
//! client.set_insert_affiliate_identifier("promo1").await;
//! let identifier = client.return_insert_affiliate_identifier(false).await;
//! # }
//! ```
//!
//! # Error Handling
//!
//! Affiliate attribution should never break the host app, so [`Client`] methods don't return
//! errors. Failures (network errors, missing configuration, invalid input) are logged and
//! reported as `None` or `false`. The [`Error`] enum is public for implementors of
//! [`IdentityStore`] and [`HttpTransport`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the
//! `insert_affiliate` target. Passing `verbose_logging = true` to [`Client::initialize`] enables
//! additional `info`-level messages about each step.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod engine;
mod error;
mod hooks;
mod id_generator;
mod identity_store;
mod purchase;
mod remote;
mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use hooks::{Clock, IdentifierChangeCallback, SystemClock, UrlOpener};
pub use id_generator::{generate_uuid, hash32, short_device_id, IdGenerator, RandomIdGenerator};
pub use identity_store::{IdentityStore, JsonFileIdentityStore, MemoryIdentityStore};
pub use purchase::Platform;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
