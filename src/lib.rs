//! Waypoint - a rule-driven DNS interception proxy.
//!
//! Incoming queries are matched against an ordered rule list; the first
//! matching rule decides whether the query is blocked, forwarded to an
//! upstream resolver, or answered with a configured address.

pub mod config;
pub mod dispatch;
pub mod rules;
pub mod server;
pub mod transport;
pub mod upstream;
