pub mod account;
pub mod config;

pub use account::{
    AccountStatus, AntigravityAccount, KiroAccount, KiroAuthMethod, KiroUsage, Provider,
    QwenAccount, SharedFlag, SharingPreference, User,
};
pub use config::{AppConfig, DatabaseConfig, ServerConfig};
