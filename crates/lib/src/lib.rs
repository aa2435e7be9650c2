//! sw-lib: build system and package manager core.
//!
//! The crate resolves declarative package references against a remote
//! registry and the local service database, materializes sources into a
//! content-addressed storage, loads them into a settings-keyed target map
//! through language drivers, and drives the resulting command graph with
//! incremental re-use and bounded parallelism.
//!
//! Subsystem map:
//! - [`package`]: paths, versions, ranges, package identities
//! - [`settings`]: the canonical, hashable configuration record
//! - [`storage`]: on-disk layout, locks, and the service database
//! - [`registry`] / [`resolver`] / [`download`]: dependency pinning and
//!   installation
//! - [`target`] / [`driver`]: the target map and the drivers that fill it
//! - [`command`] / [`execute`]: the command graph and its executor
//! - [`context`] / [`build`]: the owning context and the build flow

pub mod build;
pub mod command;
pub mod consts;
pub mod context;
pub mod download;
pub mod driver;
pub mod execute;
pub mod package;
pub mod registry;
pub mod resolver;
pub mod settings;
pub mod storage;
pub mod target;
pub mod util;
