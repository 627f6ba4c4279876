//! Keeping category feeds in the store in step with the remote catalog.

mod mediator;
mod pager;

pub use mediator::{LoadError, LoadType, MediatorResult, SyncMediator, SyncState};
pub use pager::{LoadState, Pager, PagerSnapshot};
