//! Corpus builders for integration tests.

use chrono::Utc;
use uuid::Uuid;

use fabula::models::{Chapter, ChapterFact, Novel, PrescanStatus};
use fabula::repository::NovelRepository;

use super::harness::TestCtx;

/// Insert a novel with the given chapter texts; prescan is marked completed
/// so analysis tests skip the dictionary pass.
pub async fn seed_novel(ctx: &TestCtx, title: &str, chapters: &[&str]) -> String {
    seed_novel_with_prescan(ctx, title, chapters, PrescanStatus::Completed).await
}

pub async fn seed_novel_with_prescan(
    ctx: &TestCtx,
    title: &str,
    chapters: &[&str],
    prescan_status: PrescanStatus,
) -> String {
    let novel_id = Uuid::new_v4().to_string();
    let novel = Novel {
        id: novel_id.clone(),
        title: title.to_string(),
        author: None,
        total_chapters: chapters.len() as u32,
        total_words: chapters.iter().map(|c| c.chars().count() as u64).sum(),
        content_hash: "test".to_string(),
        prescan_status,
        is_sample: false,
        created_at: Utc::now(),
    };
    ctx.novels.create_novel(&novel).await.expect("create novel");
    for (idx, content) in chapters.iter().enumerate() {
        ctx.novels
            .insert_chapter(&Chapter {
                novel_id: novel_id.clone(),
                chapter_num: idx as u32 + 1,
                volume_num: None,
                title: format!("第{}章", idx + 1),
                content: (*content).to_string(),
                word_count: content.chars().count() as u32,
                analysis_status: Default::default(),
                is_excluded: false,
            })
            .await
            .expect("insert chapter");
    }
    novel_id
}

/// Decode a ChapterFact literal from JSON.
pub fn fact_with(value: serde_json::Value) -> ChapterFact {
    serde_json::from_value(value).expect("fact literal")
}
