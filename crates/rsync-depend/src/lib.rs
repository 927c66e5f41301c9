//! Dependency coordination for rsync
//!
//! Apps block on other apps reaching `Deployed` or `Ready`, and lifecycle
//! hooks block on single resources reaching `Ready` (or `Success` for pods
//! and jobs). One [`DependencyCoordinator`] serves one deployment session;
//! the [`CoordinatorRegistry`] owns them.

#![warn(missing_docs)]

pub mod coordinator;
pub mod registry;

pub use coordinator::{DependencyCoordinator, DependencySettings, ReadinessProbe};
pub use registry::CoordinatorRegistry;
pub use rsync_common::{Error, Result};
