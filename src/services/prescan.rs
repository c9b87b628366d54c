//! Whole-book entity pre-scan.
//!
//! Phase 1 is a statistical pass: CJK n-gram frequency with dialogue, title
//! and suffix cues, budgeted at 15 seconds and best-effort. Phase 2 is a
//! single LLM classification call (30 second cap) whose results overwrite
//! lower-priority sources; its failure degrades to phase-1-only results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rapidfuzz::distance::levenshtein;
use serde::Deserialize;
use tracing::{info, warn};

use crate::llm::{json_repair, LlmEngine, LlmRequest};
use crate::models::{DictSource, EntityDictEntry, EntityType, PrescanStatus};
use crate::repository::{DictionaryRepository, NovelRepository};
use crate::utils::text::{char_count, han_runs};
use crate::FabulaError;

const PHASE1_BUDGET: Duration = Duration::from_secs(15);
const PHASE2_TIMEOUT: Duration = Duration::from_secs(30);
/// Entries offered to the LLM for classification.
const PHASE2_CANDIDATES: usize = 150;

const DIALOGUE_MARKERS: &[&str] = &["说道", "笑道", "喝道", "问道", "叹道", "道", "说"];

const TITLE_SUFFIXES: &[&str] = &[
    "长老", "道长", "真人", "仙子", "公子", "姑娘", "师兄", "师姐", "师弟", "师妹", "前辈",
    "道友", "大师", "掌门", "夫人",
];

const LOCATION_SUFFIXES: &[char] = &[
    '山', '峰', '城', '村', '镇', '国', '洲', '岛', '谷', '洞', '府', '宫', '殿', '园', '林',
    '湖', '河', '江', '海', '崖', '岭', '原', '漠',
];

const ORG_SUFFIXES: &[char] = &['门', '派', '宗', '帮', '教', '会', '阁', '盟', '殿', '堂'];

const ITEM_SUFFIXES: &[char] = &['剑', '刀', '枪', '丹', '诀', '经', '符', '鼎', '珠', '镜', '瓶'];

/// Function words that never sit inside an entity name; grams containing one
/// are segmentation noise ("韩立说", "门中弟").
const STOP_CHARS: &[char] = &[
    '说', '道', '了', '的', '是', '在', '有', '不', '着', '之', '也', '就', '都', '又', '与',
    '和', '这', '那', '我', '你', '他', '她', '它', '们', '个', '一', '来', '去', '到', '中',
    '被', '把', '对', '从', '向', '于', '便', '却', '很', '更', '最', '已', '将', '要', '笑',
    '喝', '问', '叹', '骂', '哭', '怒',
];

pub struct PreScanner {
    novels: Arc<dyn NovelRepository>,
    dictionary: Arc<dyn DictionaryRepository>,
    llm: Arc<dyn LlmEngine>,
}

impl PreScanner {
    pub fn new(
        novels: Arc<dyn NovelRepository>,
        dictionary: Arc<dyn DictionaryRepository>,
        llm: Arc<dyn LlmEngine>,
    ) -> Self {
        PreScanner {
            novels,
            dictionary,
            llm,
        }
    }

    /// Run the full pre-scan for a novel and persist the dictionary.
    pub async fn run(&self, novel_id: &str) -> Result<(), FabulaError> {
        self.novels
            .set_prescan_status(novel_id, PrescanStatus::Running)
            .await?;

        let result = self.scan(novel_id).await;
        match &result {
            Ok(count) => {
                info!(novel_id, entries = count, "pre-scan completed");
                self.novels
                    .set_prescan_status(novel_id, PrescanStatus::Completed)
                    .await?;
            }
            Err(e) => {
                warn!(novel_id, error = %e, "pre-scan failed");
                self.novels
                    .set_prescan_status(novel_id, PrescanStatus::Failed)
                    .await?;
            }
        }
        result.map(|_| ())
    }

    async fn scan(&self, novel_id: &str) -> Result<usize, FabulaError> {
        let metas = self.novels.list_chapter_meta(novel_id).await?;
        let mut texts = Vec::with_capacity(metas.len());
        for meta in &metas {
            if let Some(chapter) = self.novels.get_chapter(novel_id, meta.chapter_num).await? {
                texts.push(chapter.content);
            }
        }

        let mut entries = statistical_scan(&texts, PHASE1_BUDGET);

        match self.classify_with_llm(&entries).await {
            Ok(classified) => merge_classified(&mut entries, classified),
            Err(e) => {
                warn!(novel_id, error = %e, "LLM classification failed, keeping statistical results");
            }
        }

        entries.sort_by(|a, b| b.frequency.cmp(&a.frequency).then(a.name.cmp(&b.name)));
        self.dictionary.put_entries(novel_id, &entries).await?;
        Ok(entries.len())
    }

    /// Phase 2: one classification call over the top candidates.
    async fn classify_with_llm(
        &self,
        entries: &[EntityDictEntry],
    ) -> Result<Vec<EntityDictEntry>, FabulaError> {
        let mut top: Vec<&EntityDictEntry> = entries.iter().collect();
        top.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        top.truncate(PHASE2_CANDIDATES);
        if top.is_empty() {
            return Ok(Vec::new());
        }

        let listing: Vec<String> = top
            .iter()
            .map(|e| format!("{}({}次)", e.name, e.frequency))
            .collect();
        let hints = alias_hints(&top);

        let prompt = format!(
            "下面是一部小说的高频词。请判断每个词是人物、地点、物品、组织还是概念，\
并把指向同一实体的词归为一组（第一个为规范名）。\
输出 JSON：{{\"entities\":[{{\"name\":\"规范名\",\"type\":\"person|location|item|org|concept|unknown\",\"aliases\":[\"别名\"]}}]}}。\
不确定的词用 unknown。\n\n高频词：\n{}\n{}",
            listing.join("、"),
            hints
        );

        let mut request = LlmRequest::new("你是小说实体识别助手，只输出 JSON。", prompt);
        request.timeout = PHASE2_TIMEOUT;
        let reply = self.llm.generate(request).await?;
        let value = json_repair::extract_json(&reply.content)?;

        #[derive(Deserialize)]
        struct Classified {
            #[serde(default)]
            entities: Vec<ClassifiedEntity>,
        }
        #[derive(Deserialize)]
        struct ClassifiedEntity {
            name: String,
            #[serde(rename = "type", default)]
            entity_type: EntityType,
            #[serde(default)]
            aliases: Vec<String>,
        }

        let decoded: Classified = serde_json::from_value(value)?;
        let by_name: HashMap<&str, u32> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.frequency))
            .collect();

        Ok(decoded
            .entities
            .into_iter()
            .map(|e| {
                // The canonical entry's frequency covers its whole alias group.
                let frequency = std::iter::once(e.name.as_str())
                    .chain(e.aliases.iter().map(String::as_str))
                    .filter_map(|n| by_name.get(n))
                    .copied()
                    .max()
                    .unwrap_or(0);
                EntityDictEntry {
                    name: e.name,
                    entity_type: e.entity_type,
                    frequency,
                    confidence: 0.9,
                    aliases: e.aliases,
                    source: DictSource::Llm,
                    sample_context: None,
                }
            })
            .collect())
    }
}

/// Phase 1: frequency scan with dialogue/title/suffix cues. Best-effort
/// within `budget`; a partial result is still a result.
pub fn statistical_scan(chapters: &[String], budget: Duration) -> Vec<EntityDictEntry> {
    let deadline = Instant::now() + budget;
    let total_chars: usize = chapters.iter().map(|c| char_count(c)).sum();
    let min_freq = (total_chars / 200_000).max(5) as u32;

    let mut freq: HashMap<String, u32> = HashMap::new();
    let mut dialogue_hits: HashMap<String, u32> = HashMap::new();
    let mut title_hits: HashMap<String, u32> = HashMap::new();
    let mut samples: HashMap<String, String> = HashMap::new();

    'outer: for chapter in chapters {
        for run in han_runs(chapter) {
            if Instant::now() > deadline {
                warn!("phase-1 budget exhausted, keeping partial counts");
                break 'outer;
            }
            let chars: Vec<char> = run.chars().collect();
            for len in 2..=4usize {
                if chars.len() < len {
                    continue;
                }
                for start in 0..=chars.len() - len {
                    let gram: String = chars[start..start + len].iter().collect();
                    *freq.entry(gram.clone()).or_default() += 1;

                    let tail: String = chars[start + len..].iter().take(2).collect();
                    if DIALOGUE_MARKERS.iter().any(|m| tail.starts_with(m)) {
                        *dialogue_hits.entry(gram.clone()).or_default() += 1;
                    }
                    if TITLE_SUFFIXES.iter().any(|t| tail.starts_with(t)) {
                        *title_hits.entry(gram.clone()).or_default() += 1;
                    }
                    if !samples.contains_key(&gram) && samples.len() < 50_000 {
                        samples.insert(gram, run.to_string());
                    }
                }
            }
        }
    }

    // Keep frequent grams without function words; absorb a gram into a
    // longer gram that nearly always contains it.
    let mut candidates: Vec<(String, u32)> = freq
        .iter()
        .filter(|(g, n)| **n >= min_freq && !g.chars().any(|c| STOP_CHARS.contains(&c)))
        .map(|(g, n)| (g.clone(), *n))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    candidates.truncate(2_000);

    let absorbed: Vec<bool> = candidates
        .iter()
        .map(|(gram, count)| {
            candidates.iter().any(|(other, other_count)| {
                other.len() > gram.len()
                    && other.contains(gram.as_str())
                    && (*other_count as f64) >= 0.8 * (*count as f64)
            })
        })
        .collect();

    let mut entries = Vec::new();
    for (idx, (gram, count)) in candidates.iter().enumerate() {
        if absorbed[idx] {
            continue;
        }
        let dialogue = dialogue_hits.get(gram).copied().unwrap_or(0);
        let title = title_hits.get(gram).copied().unwrap_or(0);
        let last_char = gram.chars().last().unwrap_or(' ');

        let (entity_type, source, confidence) = if dialogue >= 3 {
            (EntityType::Person, DictSource::Dialogue, 0.8)
        } else if title >= 2 {
            (EntityType::Person, DictSource::Title, 0.7)
        } else if ORG_SUFFIXES.contains(&last_char) {
            (EntityType::Org, DictSource::Suffix, 0.5)
        } else if LOCATION_SUFFIXES.contains(&last_char) {
            (EntityType::Location, DictSource::Suffix, 0.5)
        } else if ITEM_SUFFIXES.contains(&last_char) {
            (EntityType::Item, DictSource::Suffix, 0.5)
        } else {
            (EntityType::Unknown, DictSource::Freq, 0.3)
        };

        entries.push(EntityDictEntry {
            name: gram.clone(),
            entity_type,
            frequency: *count,
            confidence,
            aliases: Vec::new(),
            source,
            sample_context: samples
                .get(gram)
                .map(|s| crate::utils::text::truncate_chars(s, 30).to_string()),
        });
    }
    entries
}

/// Fold LLM classifications into the statistical entries: the classified
/// canonical absorbs its aliases' rows, and alias rows are removed.
fn merge_classified(entries: &mut Vec<EntityDictEntry>, classified: Vec<EntityDictEntry>) {
    for class_entry in classified {
        let alias_set: Vec<String> = class_entry.aliases.clone();
        match entries.iter_mut().find(|e| e.name == class_entry.name) {
            Some(existing) => existing.absorb(class_entry),
            None => entries.push(class_entry),
        }
        entries.retain(|e| !alias_set.contains(&e.name));
    }
}

/// Fuzzy alias-pair hints offered to the classification prompt: names that
/// share characters or sit within edit distance 1 of each other.
fn alias_hints(top: &[&EntityDictEntry]) -> String {
    let mut pairs = Vec::new();
    for (i, a) in top.iter().enumerate() {
        for b in top.iter().skip(i + 1) {
            let a_chars: Vec<char> = a.name.chars().collect();
            let shared = b.name.chars().filter(|c| a_chars.contains(c)).count();
            let close = levenshtein::distance(a.name.chars(), b.name.chars()) <= 1;
            if shared >= 2 || close {
                pairs.push(format!("{}/{}", a.name, b.name));
            }
            if pairs.len() >= 30 {
                break;
            }
        }
        if pairs.len() >= 30 {
            break;
        }
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("\n疑似同实体（供参考）：{}", pairs.join("、"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(line: &str, times: usize) -> Vec<String> {
        vec![line.repeat(times)]
    }

    #[test]
    fn test_dialogue_cue_marks_person() {
        let chapters = corpus("韩立说道这件事不简单。\n", 20);
        let entries = statistical_scan(&chapters, Duration::from_secs(15));
        let hanli = entries.iter().find(|e| e.name == "韩立").unwrap();
        assert_eq!(hanli.entity_type, EntityType::Person);
        assert_eq!(hanli.source, DictSource::Dialogue);
    }

    #[test]
    fn test_suffix_cue_marks_org() {
        let chapters = corpus("七玄门中弟子众多。\n", 20);
        let entries = statistical_scan(&chapters, Duration::from_secs(15));
        let sect = entries.iter().find(|e| e.name == "七玄门").unwrap();
        assert_eq!(sect.entity_type, EntityType::Org);
    }

    #[test]
    fn test_shorter_gram_absorbed_by_longer() {
        let chapters = corpus("齐天大圣又来了。\n", 30);
        let entries = statistical_scan(&chapters, Duration::from_secs(15));
        assert!(entries.iter().any(|e| e.name == "齐天大圣"));
        // "齐天大" and "天大圣" ride along with the 4-gram and are absorbed.
        assert!(!entries.iter().any(|e| e.name == "齐天大"));
    }

    #[test]
    fn test_merge_classified_removes_alias_rows() {
        let mut entries = vec![
            EntityDictEntry {
                name: "齐天大圣".into(),
                entity_type: EntityType::Unknown,
                frequency: 8000,
                confidence: 0.3,
                aliases: vec![],
                source: DictSource::Freq,
                sample_context: None,
            },
            EntityDictEntry {
                name: "行者".into(),
                entity_type: EntityType::Unknown,
                frequency: 3000,
                confidence: 0.3,
                aliases: vec![],
                source: DictSource::Freq,
                sample_context: None,
            },
        ];
        let classified = vec![EntityDictEntry {
            name: "孙悟空".into(),
            entity_type: EntityType::Person,
            frequency: 8000,
            confidence: 0.9,
            aliases: vec!["齐天大圣".into(), "行者".into(), "猴王".into()],
            source: DictSource::Llm,
            sample_context: None,
        }];
        merge_classified(&mut entries, classified);
        let canonical = entries.iter().find(|e| e.name == "孙悟空").unwrap();
        assert_eq!(canonical.entity_type, EntityType::Person);
        assert!(canonical.aliases.contains(&"行者".to_string()));
        assert!(!entries.iter().any(|e| e.name == "行者"));
        assert!(!entries.iter().any(|e| e.name == "齐天大圣"));
    }
}
