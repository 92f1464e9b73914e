// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable contract for the ISX pipeline orchestration core.
//!
//! If you only take one dependency to implement a stage, take this one: it
//! defines the state model ([`PipelineRequest`], [`PipelineState`],
//! [`StageState`]), the [`Stage`] trait and [`StageHandle`] stages are
//! driven through, the [`PipelineEvent`] broadcast envelope, and cooperative
//! [`CancellationToken`]s. Nothing here talks to a registry, a scheduler, or
//! a network socket — those live in `isx-runtime` and `isx-daemon`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cooperative cancellation primitives.
pub mod cancel;
/// The broadcast event envelope and its priority/coalescing rules.
pub mod event;
/// State model value objects.
pub mod model;
/// The Stage contract and `StageHandle`.
pub mod stage;

pub use cancel::{CancellationReason, CancellationToken};
pub use event::{PipelineEvent, PipelineEventType, Priority};
pub use model::{
    HistoricalSample, PipelineMode, PipelineRequest, PipelineState, PipelineStatus, StageState,
    StageStatus,
};
pub use stage::{HandleSignal, LogLevel, Stage, StageHandle};

/// Current contract version string, bumped whenever a wire-visible type in
/// this crate changes shape.
///
/// # Examples
///
/// ```
/// assert_eq!(isx_core::CONTRACT_VERSION, "isx-pipeline/v1");
/// ```
pub const CONTRACT_VERSION: &str = "isx-pipeline/v1";
