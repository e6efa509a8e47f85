//! 长期记忆 / 检索器：Planner 在调用 LLM 前用它补充上下文
//!
//! 引擎本身不依赖其形状；ReAct 按当前输入 recall 若干条，作为 System 消息插入。
//! InMemoryLongTerm 按关键词重叠打分，同分时较新的条目优先。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

pub trait LongTermMemory: Send + Sync {
    fn remember(&self, text: &str);

    /// 返回与 query 最相关的至多 k 条
    fn recall(&self, query: &str, k: usize) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopLongTerm;

impl LongTermMemory for NoopLongTerm {
    fn remember(&self, _text: &str) {}

    fn recall(&self, _query: &str, _k: usize) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryLongTerm {
    entries: Arc<RwLock<Vec<(String, HashSet<String>)>>>,
    capacity: usize,
}

fn keywords(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryLongTerm {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LongTermMemory for InMemoryLongTerm {
    fn remember(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push((text.to_string(), keywords(text)));
        let overflow = entries.len().saturating_sub(self.capacity);
        if overflow > 0 {
            entries.drain(..overflow);
        }
    }

    fn recall(&self, query: &str, k: usize) -> Vec<String> {
        let query = keywords(query);
        if query.is_empty() || k == 0 {
            return Vec::new();
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(usize, usize, &String)> = entries
            .iter()
            .enumerate()
            .map(|(i, (text, words))| (query.intersection(words).count(), i, text))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.into_iter().take(k).map(|(_, _, t)| t.clone()).collect()
    }
}
