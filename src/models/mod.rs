pub mod account;
pub mod config;

pub use account::{Account, AccountState, Credentials};
pub use config::AppConfig;
