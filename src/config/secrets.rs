//! Secret handling utilities.
//!
//! Re-exports the secrecy types used by [`Config`](super::Config).

pub use secrecy::{ExposeSecret, SecretString};
