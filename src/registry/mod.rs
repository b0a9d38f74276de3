pub mod sqlite;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::ReactionType;

/// Catalog of reaction types and their weights.
#[async_trait]
pub trait TypeRegistry: Send + Sync {
    /// Fails with `DuplicateType` if the name is taken.
    async fn register(&self, name: &str, weight: i64, active: bool) -> Result<ReactionType>;
    /// Fails with `UnknownType` if absent.
    async fn get(&self, name: &str) -> Result<ReactionType>;
    /// Changes the weight. Aggregates are not touched here.
    async fn set_weight(&self, name: &str, weight: i64) -> Result<ReactionType>;
    async fn list(&self) -> Result<Vec<ReactionType>>;
}

/// Names double as scope keys, so they must be non-empty and may not
/// contain the `type:id` separator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains(':') {
        return Err(Error::InvalidTypeName(name.to_string()));
    }
    Ok(())
}
