//! Chat session creation and lookup

pub mod factory;

pub use factory::{ChatSessionFactory, SESSION_COLLECTION};
