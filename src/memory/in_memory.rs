//! 进程内记忆：计划记为 plan，结果记为 result；超过容量时丢弃最旧的记录
//!
//! recall 按关键词重叠打分；vector_search 在配置了 embedding 提供方时按余弦相似度排序，
//! 否则（或 embedding 失败时）退回 recall。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use crate::llm::LlmProvider;
use crate::memory::{MemoryError, MemoryKind, MemoryManager, MemoryRecord, MemorySnapshot};
use crate::react::actions::{ActionProposal, ActionResult};

/// 快照中 short_term 的条数
pub const SHORT_TERM_WINDOW: usize = 10;
/// 快照中 long_term 的最大条数
pub const LONG_TERM_LIMIT: usize = 5;

struct Entry {
    record: MemoryRecord,
    tokens: HashSet<String>,
    embedding: Option<Vec<f32>>,
}

pub struct InMemoryMemoryManager {
    entries: RwLock<Vec<Entry>>,
    max_records: usize,
    embedder: Option<Arc<dyn LlmProvider>>,
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

impl InMemoryMemoryManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_records: 1000,
            embedder: None,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    /// 用于 vector_search 的 embedding 提供方
    pub fn with_embedder(mut self, embedder: Arc<dyn LlmProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn records(&self) -> Vec<MemoryRecord> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    async fn push(&self, record: MemoryRecord) {
        let tokens = tokenize_lower(&record.content);
        let mut entries = self.entries.write().await;
        entries.push(Entry {
            record,
            tokens,
            embedding: None,
        });
        let n = entries.len();
        if n > self.max_records {
            entries.drain(0..n - self.max_records);
        }
    }

    /// 补齐缺失的 embedding 并返回查询向量；不在 await 期间持锁
    async fn embed_all(&self, embedder: &dyn LlmProvider, query: &str) -> Result<Vec<f32>, MemoryError> {
        let (pending_ids, mut texts): (Vec<_>, Vec<_>) = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|e| e.embedding.is_none())
                .map(|e| (e.record.id, e.record.content.clone()))
                .unzip()
        };
        texts.insert(0, query.to_string());

        let mut vectors = embedder
            .embed(&texts)
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        let query_vector = vectors.remove(0);

        let mut entries = self.entries.write().await;
        for (id, vector) in pending_ids.into_iter().zip(vectors) {
            if let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) {
                entry.embedding = Some(vector);
            }
        }
        Ok(query_vector)
    }
}

impl Default for InMemoryMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryManager for InMemoryMemoryManager {
    async fn capture_proposal(&self, proposal: &ActionProposal) -> Result<(), MemoryError> {
        let record = MemoryRecord::new(
            MemoryKind::Plan,
            format!(
                "Planned: {} - {}",
                proposal.command,
                proposal.reasoning.join("; ")
            ),
        )
        .with_metadata("command", json!(proposal.command))
        .with_metadata("cycle", json!(proposal.metadata.cycle));
        self.push(record).await;
        Ok(())
    }

    async fn capture_result(&self, result: &ActionResult) -> Result<(), MemoryError> {
        let record = MemoryRecord::new(MemoryKind::Result, format!("Result: {}", result.summary))
            .with_metadata("success", json!(result.success))
            .with_metadata("cycle", json!(result.metadata.cycle));
        self.push(record).await;
        Ok(())
    }

    async fn snapshot(&self) -> Result<MemorySnapshot, MemoryError> {
        let entries = self.entries.read().await;
        let split = entries.len().saturating_sub(SHORT_TERM_WINDOW);
        let short_term = entries[split..].iter().map(|e| e.record.clone()).collect();
        // 最近的失败排在最前
        let long_term: Vec<MemoryRecord> = entries[..split]
            .iter()
            .rev()
            .filter(|e| e.record.is_failure())
            .take(LONG_TERM_LIMIT)
            .map(|e| e.record.clone())
            .collect();
        Ok(MemorySnapshot {
            short_term,
            long_term,
        })
    }

    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().await;
        // 同分时较新的在前
        let mut scored: Vec<(usize, usize, &MemoryRecord)> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (query_tokens.intersection(&e.tokens).count(), i, &e.record))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, r)| r.clone())
            .collect())
    }

    async fn vector_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let Some(embedder) = self.embedder.clone() else {
            return self.recall(query, limit).await;
        };
        let query_vector = match self.embed_all(embedder.as_ref(), query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "vector search falling back to keyword recall");
                return self.recall(query, limit).await;
            }
        };

        let entries = self.entries.read().await;
        let mut scored: Vec<(f32, &MemoryRecord)> = entries
            .iter()
            .filter_map(|e| {
                e.embedding
                    .as_ref()
                    .map(|v| (cosine_similarity(&query_vector, v), &e.record))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use serde_json::Map;

    fn proposal(command: &str, cycle: usize) -> ActionProposal {
        ActionProposal::new(command, Map::new(), cycle)
            .with_reasoning(vec!["step one".into(), "step two".into()])
    }

    fn result(proposal: &ActionProposal, ok: bool) -> ActionResult {
        if ok {
            ActionResult::succeeded(proposal, json!("ok"), 1)
        } else {
            ActionResult::failed(proposal, format!("Failed: {}", proposal.command), "x".into(), 1)
        }
    }

    #[tokio::test]
    async fn test_capture_formats() {
        let memory = InMemoryMemoryManager::new();
        let p = proposal("read_file", 0);
        memory.capture_proposal(&p).await.unwrap();
        memory.capture_result(&result(&p, true)).await.unwrap();

        let records = memory.records().await;
        assert_eq!(records[0].kind, MemoryKind::Plan);
        assert_eq!(records[0].content, "Planned: read_file - step one; step two");
        assert_eq!(records[1].kind, MemoryKind::Result);
        assert_eq!(records[1].content, "Result: Successfully executed read_file");
        assert_eq!(records[1].metadata["success"], json!(true));
    }

    #[tokio::test]
    async fn test_snapshot_windows() {
        let memory = InMemoryMemoryManager::new();
        for i in 0..8 {
            let p = proposal(&format!("tool_{}", i), i);
            memory.capture_proposal(&p).await.unwrap();
            memory.capture_result(&result(&p, i % 2 == 0)).await.unwrap();
        }
        let snapshot = memory.snapshot().await.unwrap();
        assert_eq!(snapshot.short_term.len(), SHORT_TERM_WINDOW);
        assert_eq!(snapshot.short_term.last().unwrap().content, "Result: Successfully executed tool_7");
        // 窗口外只保留失败的结果：tool_3 之后都在窗口内
        let contents: Vec<_> = snapshot.long_term.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["Result: Failed: tool_1"]);
    }

    #[tokio::test]
    async fn test_long_term_newest_failures_first() {
        let memory = InMemoryMemoryManager::new();
        for i in 0..20 {
            let p = proposal(&format!("tool_{}", i), i);
            memory.capture_proposal(&p).await.unwrap();
            memory.capture_result(&result(&p, false)).await.unwrap();
        }
        let snapshot = memory.snapshot().await.unwrap();
        let contents: Vec<_> = snapshot.long_term.iter().map(|r| r.content.as_str()).collect();
        // 窗口内为 tool_15..tool_19，窗口外最近的五次失败按新到旧排列
        assert_eq!(
            contents,
            vec![
                "Result: Failed: tool_14",
                "Result: Failed: tool_13",
                "Result: Failed: tool_12",
                "Result: Failed: tool_11",
                "Result: Failed: tool_10",
            ]
        );
    }

    #[tokio::test]
    async fn test_recall_and_capacity() {
        let memory = InMemoryMemoryManager::new().with_max_records(3);
        for cmd in ["read_file", "write_file", "web_search", "read_file"] {
            memory.capture_proposal(&proposal(cmd, 0)).await.unwrap();
        }
        assert_eq!(memory.len().await, 3);
        let hits = memory.recall("read_file please", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.starts_with("Planned: read_file"));
        assert!(memory.recall("", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_with_and_without_embedder() {
        let plain = InMemoryMemoryManager::new();
        plain.capture_proposal(&proposal("web_search", 0)).await.unwrap();
        assert_eq!(plain.vector_search("web_search", 3).await.unwrap().len(), 1);

        let memory = InMemoryMemoryManager::new().with_embedder(Arc::new(MockProvider::new()));
        memory.capture_proposal(&proposal("web_search", 0)).await.unwrap();
        memory.capture_proposal(&proposal("execute_code", 1)).await.unwrap();
        let hits = memory.vector_search("anything", 1).await.unwrap();
        assert_eq!(hits.len(), 1);

        let failing = InMemoryMemoryManager::new()
            .with_embedder(Arc::new(MockProvider::failing("down", "connection refused")));
        failing.capture_proposal(&proposal("web_search", 0)).await.unwrap();
        assert_eq!(failing.vector_search("web_search", 3).await.unwrap().len(), 1);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
