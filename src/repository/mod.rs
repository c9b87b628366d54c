pub mod dictionary;
pub mod embedding;
pub mod fact;
pub mod novel;
pub mod task;
pub mod world;

pub use dictionary::{DictionaryRepository, SqliteDictionaryRepository};
pub use embedding::{EmbeddingRepository, SqliteEmbeddingRepository, StoredEmbedding};
pub use fact::{FactRepository, SqliteFactRepository};
pub use novel::{NovelRepository, SqliteNovelRepository};
pub use task::{SqliteTaskRepository, TaskRepository};
pub use world::{SqliteWorldRepository, WorldRepository};
