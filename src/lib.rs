//! `allotment`: batched Thompson-style adaptive allocation for experiments.
//!
//! Participants arrive one at a time, each is assigned to one of a small set of arms
//! (conditions, treatments, message variants), and a binary outcome comes back later. The
//! allocation probabilities are refreshed in **batches**: every batch carries a fixed number of
//! slots, a posterior snapshot per arm, and the Monte Carlo probability that each arm is the
//! best one. When the last slot of a batch is consumed, the responses charged to it update the
//! posteriors and exactly one successor batch is created.
//!
//! **Pieces:**
//! - [`estimate_win_probabilities`] / [`WinProbabilityEstimator`]: `n_sim` posterior draws
//!   per arm, count the per-column winners (ties to the lowest index), return a cumulative
//!   vector ([`CumulativePi`]).
//! - [`assign`]: inverse-CDF lookup of a uniform draw in a cumulative vector.
//! - [`PosteriorFamily`] / [`BetaBernoulli`]: the conjugate model used for draws and updates.
//! - [`lifecycle::BatchLifecycle`]: create, consume, advance, and resolve the current batch.
//!   Lost races resolve to "use whatever won".
//! - [`gates`]: warm-up, stoppage threshold, and study max-N, each latched once and
//!   dispatched to a [`Recruitment`] platform.
//! - [`Screener`]: participant quality checks that mark a response as garbage.
//! - [`Engine`]: the external operations, wired over a [`Store`] backend.
//!
//! **Concurrency model:** the engine holds no authoritative state in memory. Every atomic unit
//! (consume, record, create successor, halt latch) is delegated to the store, so any number of
//! engine instances can share one store.
//!
//! **Storage:** [`MemoryStore`] always; `SqliteStore` with feature `sqlite`.
//!
//! **Non-goals:**
//! - No HTTP surface, survey rendering, or participant payment.
//! - No multi-outcome or continuous-reward posteriors beyond what a [`PosteriorFamily`]
//!   implementation brings.
//!
//! ```no_run
//! use allotment::{Engine, EngineConfig, Outcome, ResponseSubmission};
//!
//! let engine = Engine::in_memory(EngineConfig::default())?;
//! engine.initialize(&["control".to_string(), "treatment".to_string()])?;
//!
//! let assignment = engine.assign_current()?;
//! let receipt = engine.record_response(
//!     ResponseSubmission::for_assignment(&assignment, Outcome::Success).with_identity("p-1"),
//! )?;
//! println!("{:?}", receipt.disposition);
//! # Ok::<(), allotment::EngineError>(())
//! ```

#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod model;
pub use model::*;

mod family;
pub use family::*;

mod prior;
pub use prior::*;

mod alloc;
pub use alloc::*;

mod seed;
pub use seed::*;

mod estimator;
pub use estimator::*;

mod sampler;
pub use sampler::*;

mod retry;
pub use retry::{retry, RetryError, RetryPolicies, RetryPolicy};

pub mod store;
pub use store::{BatchDraft, HaltKind, HaltSignal, MemoryStore, Store};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

pub mod lifecycle;

mod recruitment;
pub use recruitment::*;

pub mod gates;

mod screening;
pub use screening::*;

mod decision;
pub use decision::*;

mod config;
pub use config::*;

mod engine;
pub use engine::*;

mod harness;
pub use harness::*;
