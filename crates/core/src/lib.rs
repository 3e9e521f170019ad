pub mod models;
pub mod sign;
pub mod xml;

pub use models::{Action, RemoteOutcome, TrackingInfo, WorkItem, WorkItemError};
