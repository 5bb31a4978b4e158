mod useragent;
pub use useragent::{UserAgent, UserAgentBuilder, UserAgentRef};
pub mod dialog;
pub mod invitation;
pub mod registration;
pub mod routes;
pub mod transport;
pub use registration::{RegistrationConfig, RegistrationError, RegistrationState, RegistrationStatus};
#[cfg(test)]
mod tests;
