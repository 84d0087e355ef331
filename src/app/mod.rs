pub mod config;

pub use config::{
    AppConfig, LocalSettings, ManagerSettings, ProviderBudget, ProviderConfig, ProviderKind, RoutingSettings,
};
