pub mod publisher;

pub use publisher::{PublishOutcome, PublishStats, Publisher};
