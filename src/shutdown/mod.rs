//! Two-phase shutdown coordination.
//!
//! [`HostingShutdown`] reacts to external stop requests, gives the discovery
//! beacon a bounded chance to de-register, then hands the remaining budget to
//! [`ApplicationShutdown`], which is what hosted code observes.

mod application;
mod hosting;
pub mod signals;

pub use application::ApplicationShutdown;
pub use hosting::HostingShutdown;
