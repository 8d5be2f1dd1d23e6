pub mod diff;
pub mod error;
pub mod ignore;
mod library;
pub mod manifest;
pub mod marker;
pub mod registry;
pub mod resolve;
pub mod source;
pub mod sync;

pub use crate::diff::{Change, apply_right, diff};
pub use crate::ignore::IgnoreFilter;
pub use crate::library::Library;
pub use crate::manifest::{ArchiveInfo, Manifest};
pub use crate::registry::Registry;
#[cfg(any(test, feature = "mock"))]
pub use crate::resolve::StaticLookup;
pub use crate::resolve::{NameLookup, NameResolver, WellKnownLookup};
pub use crate::source::Source;
pub use crate::sync::{Direction, Mirror, SyncState, SyncStatus};
