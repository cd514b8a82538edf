pub mod handlers;
pub mod middleware;
pub mod router;
pub mod types;

pub use router::{WebState, api_router};
pub use types::{AuthMode, WebConfig};
