//! Several applications hosted against one shared environment.

mod host;

#[cfg(test)]
mod tests;

pub use host::{MultiHost, MultiHostBuilder, MultiRunResult};
