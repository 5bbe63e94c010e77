//! Incremental build staleness tracking.
//!
//! Decides, for every build, which source files changed since the last
//! successful compile of each build target and which previously produced
//! outputs must be deleted. State is split across independent stores under a
//! project data root:
//!
//! - [`TargetRegistry`] assigns each build target a stable compact [`TargetId`].
//! - [`ProjectStamps`] answers "is file F clean for target T?" using either
//!   timestamps or content hashes ([`TimestampStampStorage`], [`HashStampStorage`]).
//! - [`SourceToOutputMapping`] and [`OutputToTargetIndex`] track which outputs
//!   each source produced and which targets still claim each output.
//! - [`TargetConfiguration`] forces a full target rebuild when its settings change.
//!
//! [`BuildDataManager`] composes all of them behind the interface a build
//! driver calls before and after compiling.

#![warn(missing_docs)]

pub mod claims;
pub mod error;
pub mod facade;
pub mod fingerprint;
pub mod hasher;
pub mod hashed;
pub mod manager;
pub mod mapping;
pub mod paths;
pub mod stamp;
pub mod target;
pub mod timestamp;

pub use claims::OutputToTargetIndex;
pub use error::IncrementalError;
pub use facade::ProjectStamps;
pub use fingerprint::{ConfigurationStore, TargetConfiguration};
pub use hasher::{CancellationToken, ChangeSet, TargetHasher};
pub use hashed::HashStampStorage;
pub use manager::BuildDataManager;
pub use mapping::SourceToOutputMapping;
pub use paths::BuildDataPaths;
pub use stamp::{FileAttributes, Stamp, StampArray, StampStorage};
pub use target::{BuildTarget, TargetId, TargetRegistry};
pub use timestamp::TimestampStampStorage;
