pub mod cancel;
pub mod capability;
pub mod config;
pub mod error;
pub mod hook;
pub mod session;
pub mod skill;
pub mod stream;
pub mod tokens;
pub mod tool;
pub mod trace;

pub use cancel::CancelToken;
pub use error::{Error, Result};
