pub mod archive;
pub mod config;
pub mod live;
pub mod reconcile;
pub mod replay;
pub mod repository;
pub mod revision;
pub mod runtime;
pub mod sync;
