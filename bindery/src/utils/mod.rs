//! Shared utilities: timestamps and id generation.

mod ids;
mod timestamps;

pub use ids::{generate_uuid, short_id};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
