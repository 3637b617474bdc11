use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Which embedding service backs indexing and search.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAI,
    Hashed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAI
}

/// Typed per-collection configuration. One collection owns one vector
/// table plus the source roots that feed it.
#[derive(Clone, Deserialize, Debug)]
pub struct CollectionConfig {
    pub id: String,
    pub name: String,
    pub data_paths: Vec<String>,
    /// Carried for the assistant front-end; not interpreted by indexing.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

impl AppConfig {
    /// Look up a collection by its configured identifier.
    pub fn collection(&self, id: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.id == id)
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_collections_with_defaults() {
        let raw = r#"
            surrealdb_address = "mem://"
            surrealdb_username = "root"
            surrealdb_password = "root"
            surrealdb_namespace = "docs"
            surrealdb_database = "docs"
            embedding_backend = "hashed"

            [[collections]]
            id = "procedures"
            name = "Procedure Expert"
            data_paths = ["data/procedures/manuals", "data/procedures/guidelines"]
        "#;

        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .expect("config should build")
            .try_deserialize()
            .expect("config should deserialize");

        assert_eq!(config.embedding_backend, EmbeddingBackend::Hashed);
        assert_eq!(config.embedding_dimensions, 1536);
        assert_eq!(config.embedding_model, "text-embedding-3-small");
        assert_eq!(config.collections.len(), 1);

        let collection = config.collection("procedures").expect("collection");
        assert_eq!(collection.name, "Procedure Expert");
        assert_eq!(collection.data_paths.len(), 2);
        assert!(collection.system_prompt.is_none());
        assert!(config.collection("marketing").is_none());
    }
}
