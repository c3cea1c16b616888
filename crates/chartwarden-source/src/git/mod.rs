//! Git mirrors and exports

mod mirrors;
mod repo;

pub use mirrors::{ChangeReceiver, Mirror, MirrorStatus, Mirrors};
pub use repo::{Export, GitRepo};
