//! trakt OAuth device flow and token persistence.
//!
//! Independent of the mpv monitor; the binary composes the two.

mod auth;
mod error;
mod token;

pub use auth::{DeviceCode, TraktAuth};
pub use error::TokenError;
pub use token::{StoredToken, TokenStore};
