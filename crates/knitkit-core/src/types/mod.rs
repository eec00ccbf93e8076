//! Type system utilities and aliases.
//!
//! - [`aliases`]: Type aliases for `Arc<Mutex<T>>`, callbacks, etc.

pub mod aliases;

pub use aliases::*;
