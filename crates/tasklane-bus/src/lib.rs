//! Tasklane Bus
//!
//! Topic-based publish/subscribe routing. Subscribers register dot-separated
//! patterns with `*` (exactly one segment) and `#` (zero or more trailing
//! segments) wildcards; published messages are dispatched to every matching
//! subscription in descending priority order.

pub mod error;
pub mod pattern;
pub mod router;

pub use error::BusError;
pub use pattern::{matches, validate_pattern};
pub use router::{SubscriptionOptions, TopicRouter};
