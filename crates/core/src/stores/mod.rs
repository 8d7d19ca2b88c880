pub mod json_file;

pub use json_file::{cosine_distance, distance_to_relevance, JsonFileIndex, INDEX_SCHEMA_VERSION};
