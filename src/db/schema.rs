//! Database schema. Idempotent: every statement is `IF NOT EXISTS`.

use sqlx::SqlitePool;

use crate::FabulaError;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS novels (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        author TEXT,
        total_chapters INTEGER NOT NULL DEFAULT 0,
        total_words INTEGER NOT NULL DEFAULT 0,
        content_hash TEXT NOT NULL DEFAULT '',
        prescan_status TEXT NOT NULL DEFAULT 'pending',
        is_sample INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chapters (
        novel_id TEXT NOT NULL REFERENCES novels(id) ON DELETE CASCADE,
        chapter_num INTEGER NOT NULL,
        volume_num INTEGER,
        title TEXT NOT NULL DEFAULT '',
        content TEXT NOT NULL,
        word_count INTEGER NOT NULL DEFAULT 0,
        analysis_status TEXT NOT NULL DEFAULT 'pending',
        is_excluded INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (novel_id, chapter_num)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chapter_facts (
        novel_id TEXT NOT NULL REFERENCES novels(id) ON DELETE CASCADE,
        chapter_num INTEGER NOT NULL,
        fact TEXT NOT NULL,
        model TEXT NOT NULL DEFAULT '',
        prompt_version TEXT NOT NULL DEFAULT '',
        updated_at TEXT NOT NULL,
        PRIMARY KEY (novel_id, chapter_num)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS world_structures (
        novel_id TEXT PRIMARY KEY REFERENCES novels(id) ON DELETE CASCADE,
        structure TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_tasks (
        id TEXT PRIMARY KEY,
        novel_id TEXT NOT NULL REFERENCES novels(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'pending',
        chapter_start INTEGER NOT NULL,
        chapter_end INTEGER NOT NULL,
        current_chapter INTEGER,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_dictionary (
        novel_id TEXT NOT NULL REFERENCES novels(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        entity_type TEXT NOT NULL DEFAULT 'unknown',
        frequency INTEGER NOT NULL DEFAULT 0,
        confidence REAL NOT NULL DEFAULT 0,
        aliases TEXT NOT NULL DEFAULT '[]',
        source TEXT NOT NULL DEFAULT 'freq',
        sample_context TEXT,
        PRIMARY KEY (novel_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_overrides (
        novel_id TEXT NOT NULL REFERENCES novels(id) ON DELETE CASCADE,
        override_type TEXT NOT NULL,
        override_key TEXT NOT NULL,
        value TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (novel_id, override_type, override_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        novel_id TEXT NOT NULL REFERENCES novels(id) ON DELETE CASCADE,
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        vector TEXT NOT NULL,
        PRIMARY KEY (novel_id, namespace, key)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tasks_novel ON analysis_tasks(novel_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_dictionary_freq ON entity_dictionary(novel_id, frequency DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chapters_status ON chapters(novel_id, analysis_status)",
];

/// Create all tables and indexes.
pub async fn apply_schema(pool: &SqlitePool) -> Result<(), FabulaError> {
    for stmt in TABLES.iter().chain(INDEXES) {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
