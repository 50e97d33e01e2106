#![cfg_attr(docsrs, feature(doc_cfg))]
//! The services around an external federated learning training service.
//!
//! - The `proxy` binary serves the training API to the dashboard. It
//!   forwards every request to the training service and relays the
//!   response, see [`rest`].
//! - The `trainer` binary drives a whole training without a user: it
//!   submits the configured setup and runs the scheduling loops of
//!   `flboard-sdk` until the training completes or fails, logging the
//!   progress along the way, see [`reporter`].
//!
//! Both binaries are configured through a TOML file whose values can be
//! overridden by environment variables, see [`settings`].

pub mod reporter;
pub mod rest;
pub mod settings;
pub mod signal;
