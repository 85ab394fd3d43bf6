pub mod exact;
pub mod qdrant;

pub use exact::{cosine_similarity, ExactCosineStore};
pub use qdrant::QdrantStore;
