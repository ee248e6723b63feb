//! Types shared by the OIDC relying-party crates and the gateway service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
