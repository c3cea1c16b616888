//! Chart sources for chartwarden
//!
//! - [`git`]: local mirrors of git remotes and per-commit exports
//! - [`sync`]: per-release tracking of git chart sources
//! - [`chart`]: download cache for charts from chart repositories

pub mod chart;
pub mod error;
pub mod git;
pub mod shutdown;
pub mod sync;

pub use chart::{ChartCache, ChartEntry, ChartIndex, FetchedChart};
pub use error::{Result, SourceError};
pub use git::{ChangeReceiver, Export, GitRepo, Mirror, MirrorStatus, Mirrors};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use sync::{ChartSourceTracker, ReleaseLister, ReleaseQueue, ResolvedChart, TrackerConfig};
