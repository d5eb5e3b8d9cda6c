//! Side-effecting collaborators: config, archive, driver and oracle adapters.

pub mod archive;
pub mod config;
pub mod driver;
pub mod gemini;
pub mod oracle;
pub mod webdriver;
