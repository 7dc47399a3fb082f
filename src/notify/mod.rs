//! Local event delivery to the UI layer

pub mod notifier;

pub use notifier::MatchNotifier;
