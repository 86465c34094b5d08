pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod handlers;
pub mod identifier;
pub mod middleware;
pub mod policy;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod sliding_window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use decision::Decision;
pub use error::{AdmissionError, Result};
pub use identifier::resolve_identifier;
pub use policy::{Policy, PolicyRegistry};
pub use rate_limiter::RateLimiter;
pub use server::create_app;
