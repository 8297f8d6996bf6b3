//! Request interception for the active cache generation.
//!
//! [`FetchRules`] classifies each request into a [`Strategy`];
//! [`FetchInterceptor`] executes it against the network and the
//! [`CacheStorage`](crate::cache::CacheStorage).

pub mod interceptor;
pub mod strategy;

pub use interceptor::FetchInterceptor;
pub use strategy::{FetchRules, Strategy};
