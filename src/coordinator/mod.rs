//! Local-versus-cloud routing on top of the provider manager.

pub mod service;
pub mod types;

pub use service::Coordinator;
pub use types::{
    AnalysisResult, AttemptRecord, Backend, CoordinatorCosts, CoordinatorStatus, LocalStats, LocalStatus,
    Priority, SceneEnhancer, SceneInsights,
};
