pub mod admin;
pub mod checkout;
pub mod installs;
pub mod setup;
pub mod system;
pub mod webhooks;
