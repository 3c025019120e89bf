//! CLI command implementations

pub mod acquire;
pub mod config;
pub mod key;
pub mod list;
pub mod sweep;

pub use acquire::execute as acquire;
pub use config::execute as config;
pub use key::execute as key;
pub use list::execute as list;
pub use sweep::execute as sweep;
