//! Scaling subsystem.
//!
//! # Data Flow
//! ```text
//! Every evaluation_interval:
//!     registry snapshot → load sample (connections / capacity, or external utilization)
//!     → window.rs (mean over evaluation_window)
//!     → controller.rs Autoscaler (desired replicas, cooldown, backoff hold)
//!     → orchestrator.rs (scale_up / scale_down)
//!     → registry register / deregister
//!
//! Health eviction → replacement candidate → raises desired on next evaluation
//! ```

pub mod controller;
pub mod orchestrator;
pub mod window;

pub use controller::{
    choose_victims, desired_replicas, Autoscaler, ScaleDirection, ScaleIntent, ScalingController, ScalingPolicy,
    ScalingStatus,
};
pub use orchestrator::{HttpOrchestrator, Orchestrator, OrchestratorError, StaticOrchestrator};
pub use window::{LoadSample, LoadWindow};
