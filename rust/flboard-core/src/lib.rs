#![cfg_attr(docsrs, feature(doc_cfg))]
//! # flboard: drive a federated learning service from the outside
//!
//! ###### tags: Federated Learning, Differential Privacy, Dashboard
//!
//! The actual training, the differential privacy accounting and the
//! model aggregation all happen inside an external training service.
//! This crate only describes what travels between that service and
//! its clients:
//!
//! - the [`setup`] a user confirms before training starts (simulated
//!   clients and their data sizes) and the [`TrainingConfiguration`]
//!   derived from it,
//! - the [`RoundState`] and the [`MetricsHistory`] reconciled from the
//!   service after every poll,
//! - the JSON bodies of the service API in [`api`].
//!
//! The orchestration logic that talks to the service lives in the
//! `flboard-sdk` crate, the HTTP proxy and the binaries in
//! `flboard-server`.
#[macro_use]
extern crate serde;

pub mod api;
pub mod metrics;
pub mod session;
pub mod setup;
pub mod state;

pub use self::{
    metrics::{MetricsHistory, RoundMetrics},
    session::SessionId,
    setup::{ClientSetup, TrainingConfiguration, ValidationError},
    state::{PrivacySettings, RoundState, TrainingStatus},
};
