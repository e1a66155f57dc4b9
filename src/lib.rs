//! Feature flag service: flag records with tag-targeted rule chains, stored
//! in a document store and evaluated against caller-supplied tags.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod flags;
pub mod query;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;

pub use error::FlagError;
pub use evaluation::FlagEvaluation;
pub use service::FlagService;
