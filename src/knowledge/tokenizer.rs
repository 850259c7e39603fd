//! 分词模块
//!
//! 中英文混合分词，用于词法回退检索与哈希嵌入。
//! 包含 CJK 字符时使用 jieba 搜索引擎模式，否则按非字母数字字符切分（日志里常见 `key=value`、路径、冒号）。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 有效词：含字母数字，且为多字符或单个 CJK 字
fn keep_token(token: &str) -> bool {
    if !token.chars().any(char::is_alphanumeric) {
        return false;
    }
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => is_cjk(c),
        (Some(_), Some(_)) => true,
        _ => false,
    }
}

fn split_ascii(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
}

pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .flat_map(|s| {
                if contains_cjk(s) {
                    vec![s.to_lowercase()]
                } else {
                    split_ascii(s).collect()
                }
            })
            .filter(|s| keep_token(s))
            .collect()
    } else {
        split_ascii(text).filter(|s| keep_token(s)).collect()
    }
}

/// 分词并返回词集合（用于相似度计算）
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard 相似度，范围 [0, 1]，越大越相似
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f32 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f32;
    let union = set1.union(set2).count() as f32;
    intersection / union
}
