//! Job orchestration for suitability analyses.
//!
//! [`JobService`] validates and records requests and puts a ticket on the
//! work queue. A worker's [`Dispatcher`] takes tickets off the queue and
//! hands each to a [`JobRunner`], which claims the job with a
//! compare-and-set, drives the [`Pipeline`] stage by stage and writes the
//! terminal state.
//!
//! ```text
//! PENDING ──claim──► RUNNING ──► COMPLETE
//!    │                  │  └───► FAILED
//!    └──cancel──► CANCELLED ◄──┘ (cancel at a stage boundary)
//! ```

pub mod config;
pub mod dispatcher;
pub mod pipeline;
pub mod plan;
pub mod runner;
pub mod submit;

pub use config::OrchestratorConfig;
pub use dispatcher::Dispatcher;
pub use pipeline::{Pipeline, PipelineState};
pub use plan::{AnalysisPlan, ConstraintPlan, FactorPlan, LayerPlan};
pub use runner::{JobRunner, RunOutcome, WorkerContext};
pub use submit::JobService;
