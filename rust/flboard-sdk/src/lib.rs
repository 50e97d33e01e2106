#![cfg_attr(docsrs, feature(doc_cfg))]
//! This crate drives the training of an external federated learning
//! service on behalf of one user.
//!
//! The service runs the actual training: it simulates the clients,
//! trains their local models, adds the differential privacy noise and
//! aggregates the updates. What it expects from its user is a session,
//! a training configuration, and a trigger for every round.
//!
//! # Running the training
//!
//! The [`Orchestrator`] owns the session and exposes one operation per
//! step of the training. The [`Scheduler`] then runs the loops that
//! trigger the rounds, poll the training state and keep the session
//! alive, until the training completes or fails.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use flboard_core::ClientSetup;
//! use flboard_sdk::{
//!     client::Client,
//!     Orchestrator,
//!     OrchestratorSettings,
//!     Scheduler,
//!     SchedulerSettings,
//! };
//!
//! let client = Client::new(reqwest::Client::new(), "http://localhost:8000")?;
//! let orchestrator = Arc::new(Orchestrator::new(client, OrchestratorSettings::default()));
//! orchestrator
//!     .initialize_from_setup(&ClientSetup::new(), Default::default())
//!     .await?;
//!
//! let mut scheduler = Scheduler::start(orchestrator.clone(), SchedulerSettings::default());
//! scheduler.finished().await;
//! ```
//!
//! The progress can be followed through the listeners handed out by
//! [`Orchestrator::subscribe`].
//!
//! # Features
//!
//! - `reqwest-client`: implements [`client::HttpClient`] for `reqwest::Client`

pub mod cancel;
pub mod client;
pub mod events;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod session;
mod traits;

pub use self::{
    orchestrator::{
        Orchestrator,
        OrchestratorError,
        OrchestratorSettings,
        Phase,
        RoundOutcome,
        SessionError,
        SkipReason,
    },
    scheduler::{Scheduler, SchedulerSettings},
    traits::TrainingClient,
};
