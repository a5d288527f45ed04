//! Roomrelay client library
//!
//! Connection handling with request/reply correlation, the session controller
//! that mirrors relay state, and the capture/render seams it drives.

mod error;
pub mod media;
pub mod network;
pub mod session;
pub mod state;

pub use error::{ClientError, Result};
pub use network::Connection;
pub use session::SessionController;
