//! Trainable parameter storage and in-memory snapshots.

pub mod store;

pub use store::{ParameterStore, init_classifier, init_language_model};
