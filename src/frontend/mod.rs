//! Frontend helpers
//!
//! Plumbing for serving traffic that is not tunnel traffic, such as
//! relaying it unchanged to a fixed upstream.

mod redirect;

pub use redirect::{RedirectConfig, RedirectUpstream};
