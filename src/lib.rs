//! Geoquota - quota admission control for IP geolocation APIs
//!
//! Every request is charged to a client key (normally the source IP) in a
//! fixed-window counter. Counters live in process memory, Redis or memcache;
//! the limiter compares the count with the configured limit and stays
//! available when the store is not.

pub mod admission;
pub mod config;
pub mod error;
pub mod quota;
