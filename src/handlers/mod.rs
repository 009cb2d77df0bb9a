pub mod config;
pub mod index;

pub use self::config::get_config;
pub use self::index::index;
