mod builder;
mod controller;
mod phase;
mod run;


pub use builder::{ApplicationHostBuilder, BeforeInitializeHook};
pub use controller::ApplicationHost;
