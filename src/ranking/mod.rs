pub mod engine;
pub mod model;

pub use engine::{confidence_weights, Interaction, RankingEngine, ScoringParams};
pub use model::{FactorModel, ModelArtifact};
