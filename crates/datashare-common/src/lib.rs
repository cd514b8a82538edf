pub mod error;
pub mod time;
pub mod types;

pub use error::{DatashareError, Result};
pub use types::{Project, User};
