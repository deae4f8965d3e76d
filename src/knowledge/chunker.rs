//! Text Chunking Module
//!
//! 페이지 텍스트를 검색 단위(청크)로 분할합니다.
//! - Fixed: 고정 크기 슬라이딩 윈도우
//! - Recursive: 구분자 우선순위(`\n\n` > `\n` > `. ` > ` `) 기반 재귀 분할
//! - Semantic: 인접 문장 Jaccard 유사도 기반 문장 그룹화
//!
//! 모든 길이와 오프셋은 문자(char) 단위입니다.
//! 청크 오프셋은 분할 과정에서 직접 추적합니다 (전체 텍스트 재검색 없음).

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Semantic 전략 기본 유사도 임계값
pub const DEFAULT_SEMANTIC_THRESHOLD: f64 = 0.85;

/// Recursive 전략 구분자 (우선순위 순)
const RECURSIVE_SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// 문장 경계: 종결 부호 뒤 공백
static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("sentence boundary pattern is valid"));

// ============================================================================
// Chunk Strategy
// ============================================================================

/// 청킹 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// 고정 크기 윈도우
    Fixed,
    /// 구분자 기반 재귀 분할 (기본값)
    #[default]
    Recursive,
    /// 문장 유사도 기반 그룹화
    Semantic,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Recursive => "recursive",
            Self::Semantic => "semantic",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "recursive" => Ok(Self::Recursive),
            "semantic" => Ok(Self::Semantic),
            other => Err(RagError::validation(format!(
                "unknown chunk strategy '{}' (expected fixed, recursive or semantic)",
                other
            ))),
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// 페이지 단위 원문 텍스트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageText {
    /// 페이지 번호 (1부터 시작)
    pub page_number: u32,
    pub text: String,
}

impl PageText {
    pub fn new(page_number: u32, text: impl Into<String>) -> Self {
        Self {
            page_number,
            text: text.into(),
        }
    }
}

/// 청크 (검색 최소 단위)
///
/// 생성 후 불변이며 원본 문서에 대한 소유 관계를 갖지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub text: String,
    /// 문서 내 순서 (0부터 연속)
    pub chunk_index: usize,
    /// 시작 오프셋이 속한 페이지
    pub page_number: Option<u32>,
    pub start_char: usize,
    pub end_char: usize,
}

/// 청킹 설정
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkConfig {
    pub strategy: ChunkStrategy,
    /// 청크 크기 (문자 수)
    pub chunk_size: usize,
    /// 오버랩 크기 (문자 수, Semantic 전략은 사용하지 않음)
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Recursive,
            chunk_size: 512,
            chunk_overlap: 50,
        }
    }
}

impl ChunkConfig {
    pub fn new(strategy: ChunkStrategy, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            strategy,
            chunk_size,
            chunk_overlap,
        }
    }

    /// 크기/오버랩 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::validation("chunk size must be greater than 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::validation(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// 청크 미리보기 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStats {
    pub count: usize,
    pub avg_length: usize,
    pub min_length: usize,
    pub max_length: usize,
    pub total_chars: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let lengths: Vec<usize> = chunks.iter().map(|c| c.text.chars().count()).collect();
        let total_chars: usize = lengths.iter().sum();

        if lengths.is_empty() {
            return Self::default();
        }

        Self {
            count: lengths.len(),
            avg_length: (total_chars as f64 / lengths.len() as f64).round() as usize,
            min_length: lengths.iter().copied().min().unwrap_or(0),
            max_length: lengths.iter().copied().max().unwrap_or(0),
            total_chars,
        }
    }
}

// ============================================================================
// ChunkEngine
// ============================================================================

/// 청킹 엔진
///
/// 페이지들을 `\n`으로 이어붙인 전체 텍스트를 전략에 따라 분할합니다.
/// 결과 청크는 항상 trim되고, 빈 청크는 버려지며, 인덱스는 방출 순서로 다시 매겨집니다.
#[derive(Debug, Clone)]
pub struct ChunkEngine {
    semantic_threshold: f64,
}

impl Default for ChunkEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SEMANTIC_THRESHOLD)
    }
}

impl ChunkEngine {
    pub fn new(semantic_threshold: f64) -> Self {
        Self { semantic_threshold }
    }

    pub fn semantic_threshold(&self) -> f64 {
        self.semantic_threshold
    }

    /// 페이지 목록을 청크로 분할
    pub fn chunk(&self, pages: &[PageText], config: &ChunkConfig) -> Vec<Chunk> {
        let full_text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let layout = PageLayout::new(pages);
        let size = config.chunk_size.max(1);

        match config.strategy {
            ChunkStrategy::Fixed => fixed_chunks(&full_text, &layout, size, config.chunk_overlap),
            ChunkStrategy::Recursive => {
                recursive_chunks(&full_text, &layout, size, config.chunk_overlap)
            }
            ChunkStrategy::Semantic => self.semantic_chunks(&full_text, &layout, size),
        }
    }

    /// 문장 그룹화
    ///
    /// 직전 문장과의 유사도가 임계값 이상이고 그룹 길이가 `2 × size` 이하인 동안 그룹을 키웁니다.
    fn semantic_chunks(&self, text: &str, layout: &PageLayout, size: usize) -> Vec<Chunk> {
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return vec![];
        }

        let limit = size.saturating_mul(2);
        let mut offsets = CharOffsets::new(text);
        let mut emitter = ChunkEmitter::default();

        let mut group_start = 0;
        let mut group_chars = sentences[0].chars;

        for i in 1..sentences.len() {
            let candidate_chars = group_chars + 1 + sentences[i].chars;
            let similarity = jaccard_similarity(
                &text[sentences[i - 1].range.clone()],
                &text[sentences[i].range.clone()],
            );

            if similarity >= self.semantic_threshold && candidate_chars <= limit {
                group_chars = candidate_chars;
                continue;
            }

            emit_sentence_group(text, &sentences[group_start..i], &mut offsets, layout, &mut emitter);
            group_start = i;
            group_chars = sentences[i].chars;
        }

        emit_sentence_group(text, &sentences[group_start..], &mut offsets, layout, &mut emitter);
        emitter.finish()
    }
}

// ============================================================================
// Fixed
// ============================================================================

fn fixed_chunks(text: &str, layout: &PageLayout, size: usize, overlap: usize) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut emitter = ChunkEmitter::default();

    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        emitter.push(&window, start, end, layout.page_at(start));
        start += step;
    }

    emitter.finish()
}

// ============================================================================
// Recursive
// ============================================================================

fn recursive_chunks(text: &str, layout: &PageLayout, size: usize, overlap: usize) -> Vec<Chunk> {
    let mut spans = Vec::new();
    split_spans(text, 0, &RECURSIVE_SEPARATORS, size, &mut spans);

    let mut offsets = CharOffsets::new(text);
    let mut emitter = ChunkEmitter::default();

    for (i, span) in spans.iter().enumerate() {
        let raw = &text[span.clone()];
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }

        let leading = raw.len() - raw.trim_start().len();
        let start_char = offsets.char_at(span.start + leading);
        let end_char = start_char + trimmed.chars().count();

        // 이전 raw 청크의 꼬리를 앞에 붙임 (이미 접두사면 생략)
        let mut body = trimmed.to_string();
        if overlap > 0 && i > 0 {
            let tail = tail_chars(&text[spans[i - 1].clone()], overlap);
            if !tail.is_empty() && !trimmed.starts_with(tail) {
                body = format!("{} {}", tail, trimmed);
            }
        }

        emitter.push(&body, start_char, end_char, layout.page_at(start_char));
    }

    emitter.finish()
}

/// 구분자 우선순위로 텍스트를 분할하여 바이트 구간을 수집
///
/// `base`는 `text`가 전체 텍스트에서 시작하는 바이트 위치입니다.
fn split_spans(
    text: &str,
    base: usize,
    separators: &[&str],
    size: usize,
    out: &mut Vec<Range<usize>>,
) {
    if text.chars().count() <= size {
        out.push(base..base + text.len());
        return;
    }

    let Some((separator, lower)) = separators.split_first() else {
        hard_split(text, base, size, out);
        return;
    };

    let separator_chars = separator.chars().count();
    // (구간, 문자 수)
    let mut current: Option<(Range<usize>, usize)> = None;
    let mut offset = 0;

    for part in text.split(separator) {
        let part_range = base + offset..base + offset + part.len();
        offset += part.len() + separator.len();
        let part_chars = part.chars().count();

        let candidate = match &current {
            Some((range, chars)) if !range.is_empty() => {
                (range.start..part_range.end, chars + separator_chars + part_chars)
            }
            _ => (part_range.clone(), part_chars),
        };

        if candidate.1 <= size {
            current = Some(candidate);
            continue;
        }

        if let Some((range, _)) = current.take() {
            if !range.is_empty() {
                out.push(range);
            }
        }

        if part_chars > size {
            split_spans(part, part_range.start, lower, size, out);
        } else {
            current = Some((part_range, part_chars));
        }
    }

    if let Some((range, _)) = current {
        if !range.is_empty() {
            out.push(range);
        }
    }
}

/// 구분자가 더 없을 때 `size` 문자 단위로 자름
fn hard_split(text: &str, base: usize, size: usize, out: &mut Vec<Range<usize>>) {
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == size {
            out.push(base + start..base + idx);
            start = idx;
            count = 0;
        }
        count += 1;
    }

    if start < text.len() {
        out.push(base + start..base + text.len());
    }
}

/// 문자열 끝의 `n` 문자
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

// ============================================================================
// Semantic
// ============================================================================

/// trim된 문장의 바이트 구간
struct Sentence {
    range: Range<usize>,
    chars: usize,
}

fn split_sentences(text: &str) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut last = 0;

    let mut push = |start: usize, end: usize| {
        let piece = &text[start..end];
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            return;
        }
        let leading = piece.len() - piece.trim_start().len();
        let begin = start + leading;
        sentences.push(Sentence {
            range: begin..begin + trimmed.len(),
            chars: trimmed.chars().count(),
        });
    };

    for boundary in SENTENCE_BOUNDARY.find_iter(text) {
        // 종결 부호는 ASCII 1바이트, 앞 문장에 포함
        push(last, boundary.start() + 1);
        last = boundary.end();
    }
    push(last, text.len());

    sentences
}

fn emit_sentence_group(
    text: &str,
    group: &[Sentence],
    offsets: &mut CharOffsets<'_>,
    layout: &PageLayout,
    emitter: &mut ChunkEmitter,
) {
    let (Some(first), Some(last)) = (group.first(), group.last()) else {
        return;
    };

    let body = group
        .iter()
        .map(|s| &text[s.range.clone()])
        .collect::<Vec<_>>()
        .join(" ");
    let start_char = offsets.char_at(first.range.start);
    let end_char = offsets.char_at(last.range.end);

    emitter.push(&body, start_char, end_char, layout.page_at(start_char));
}

/// 소문자 공백 토큰 집합의 Jaccard 유사도
fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();

    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

// ============================================================================
// Helpers
// ============================================================================

/// 청크 방출기: trim, 빈 청크 제거, 연속 인덱스 부여
#[derive(Default)]
struct ChunkEmitter {
    chunks: Vec<Chunk>,
}

impl ChunkEmitter {
    fn push(&mut self, text: &str, start_char: usize, end_char: usize, page_number: Option<u32>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.chunks.push(Chunk {
            text: text.to_string(),
            chunk_index: self.chunks.len(),
            page_number,
            start_char,
            end_char,
        });
    }

    fn finish(self) -> Vec<Chunk> {
        self.chunks
    }
}

/// 바이트 위치 → 문자 위치 변환 (단조 증가 조회에 최적화)
struct CharOffsets<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharOffsets<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            chars: 0,
        }
    }

    fn char_at(&mut self, byte: usize) -> usize {
        if byte < self.byte {
            self.byte = 0;
            self.chars = 0;
        }
        self.chars += self.text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

/// 페이지 경계 (누적 문자 수, 페이지 구분자 1자 포함)
struct PageLayout {
    bounds: Vec<(u32, usize)>,
}

impl PageLayout {
    fn new(pages: &[PageText]) -> Self {
        let mut cumulative = 0;
        let bounds = pages
            .iter()
            .map(|p| {
                cumulative += p.text.chars().count() + 1;
                (p.page_number, cumulative)
            })
            .collect();
        Self { bounds }
    }

    fn page_at(&self, char_offset: usize) -> Option<u32> {
        self.bounds
            .iter()
            .find(|(_, end)| char_offset < *end)
            .or(self.bounds.last())
            .map(|(page, _)| *page)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pages(count: u32) -> Vec<PageText> {
        (1..=count)
            .map(|n| {
                let text = (0..6)
                    .map(|p| {
                        format!(
                            "Page {} paragraph {} discusses retrieval pipelines, lexical scoring and vector search in detail. It also covers chunking strategy number {}.",
                            n, p, p
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");
                PageText::new(n, text)
            })
            .collect()
    }

    fn chunk_with(strategy: ChunkStrategy, size: usize, overlap: usize, pages: &[PageText]) -> Vec<Chunk> {
        ChunkEngine::default().chunk(pages, &ChunkConfig::new(strategy, size, overlap))
    }

    const ALL: [ChunkStrategy; 3] = [
        ChunkStrategy::Fixed,
        ChunkStrategy::Recursive,
        ChunkStrategy::Semantic,
    ];

    #[test]
    fn test_strategy_parse() {
        assert_eq!("fixed".parse::<ChunkStrategy>().unwrap(), ChunkStrategy::Fixed);
        assert_eq!("Semantic".parse::<ChunkStrategy>().unwrap(), ChunkStrategy::Semantic);
        assert!("sliding".parse::<ChunkStrategy>().is_err());
        assert_eq!(ChunkStrategy::default(), ChunkStrategy::Recursive);
    }

    #[test]
    fn test_config_validate() {
        assert!(ChunkConfig::default().validate().is_ok());
        assert!(ChunkConfig::new(ChunkStrategy::Fixed, 0, 0).validate().is_err());
        assert!(ChunkConfig::new(ChunkStrategy::Fixed, 100, 100).validate().is_err());
    }

    #[test]
    fn test_empty_pages() {
        let pages = vec![PageText::new(1, ""), PageText::new(2, "")];
        for strategy in ALL {
            assert!(chunk_with(strategy, 512, 50, &pages).is_empty(), "{}", strategy);
        }
        for strategy in ALL {
            assert!(chunk_with(strategy, 512, 50, &[]).is_empty(), "{}", strategy);
        }
    }

    #[test]
    fn test_single_word_page() {
        let pages = vec![PageText::new(1, "Hello")];
        for strategy in ALL {
            let chunks = chunk_with(strategy, 512, 50, &pages);
            assert_eq!(chunks.len(), 1, "{}", strategy);
            assert_eq!(chunks[0].text, "Hello");
            assert_eq!(chunks[0].chunk_index, 0);
            assert_eq!(chunks[0].page_number, Some(1));
        }
    }

    #[test]
    fn test_fixed_size_bounds_and_indices() {
        let pages = sample_pages(20);
        let chunks = chunk_with(ChunkStrategy::Fixed, 512, 50, &pages);

        assert!(!chunks.is_empty());
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.text.chars().count() <= 512);
            assert_eq!(chunk.chunk_index, i);
        }
        assert!(chunks[0].text.starts_with("Page 1 paragraph 0"));
        assert!(chunks
            .last()
            .unwrap()
            .text
            .ends_with("chunking strategy number 5."));
    }

    #[test]
    fn test_smaller_size_produces_more_chunks() {
        let pages = sample_pages(20);
        for strategy in [ChunkStrategy::Fixed, ChunkStrategy::Recursive] {
            let large = chunk_with(strategy, 1000, 50, &pages);
            let small = chunk_with(strategy, 200, 50, &pages);
            assert!(small.len() > large.len(), "{}", strategy);
        }
    }

    #[test]
    fn test_all_strategies_cover_text() {
        let pages = sample_pages(20);
        for strategy in ALL {
            let chunks = chunk_with(strategy, 512, 50, &pages);
            assert!(chunks[0].text.contains("Page 1 paragraph 0"), "{}", strategy);
            assert!(
                chunks.last().unwrap().text.contains("number 5."),
                "{}",
                strategy
            );
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.chunk_index, i);
                assert!(!chunk.text.is_empty());
                assert_eq!(chunk.text, chunk.text.trim());
            }
        }
    }

    #[test]
    fn test_fixed_page_numbers() {
        let pages = vec![PageText::new(1, "aaaaaaaaaa"), PageText::new(2, "bbbbbbbbbb")];
        let chunks = chunk_with(ChunkStrategy::Fixed, 5, 0, &pages);

        assert_eq!(chunks.first().unwrap().page_number, Some(1));
        assert_eq!(chunks.last().unwrap().page_number, Some(2));
        assert_eq!(chunks[1].start_char, 5);
    }

    #[test]
    fn test_recursive_offsets_with_repeated_text() {
        let pages = vec![PageText::new(1, "repeat me\n\nrepeat me\n\nrepeat me")];
        let chunks = chunk_with(ChunkStrategy::Recursive, 10, 0, &pages);

        let starts: Vec<usize> = chunks.iter().map(|c| c.start_char).collect();
        assert_eq!(starts, vec![0, 11, 22]);
        for chunk in &chunks {
            assert_eq!(chunk.text, "repeat me");
            assert_eq!(chunk.end_char - chunk.start_char, 9);
        }
    }

    #[test]
    fn test_recursive_overlap_prepends_previous_tail() {
        let pages = vec![PageText::new(1, "one two three four five six seven eight nine ten")];
        let chunks = chunk_with(ChunkStrategy::Recursive, 20, 5, &pages);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "one two three four");
        assert_eq!(chunks[1].text, "four five six seven eight");
        assert_eq!(chunks[2].text, "eight nine ten");
        // 오버랩 적용 후에는 크기 상한이 근사치
        assert!(chunks[1].text.chars().count() > 20);
    }

    #[test]
    fn test_recursive_hard_split_without_separators() {
        let pages = vec![PageText::new(1, "abcdefghij")];
        let chunks = chunk_with(ChunkStrategy::Recursive, 4, 0, &pages);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_semantic_groups_similar_sentences() {
        let pages = vec![PageText::new(
            1,
            "alpha beta gamma. alpha beta gamma. alpha beta gamma. delta epsilon zeta.",
        )];
        let chunks = chunk_with(ChunkStrategy::Semantic, 20, 0, &pages);

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "alpha beta gamma. alpha beta gamma.",
                "alpha beta gamma.",
                "delta epsilon zeta."
            ]
        );
        assert_eq!(chunks[1].start_char, 36);
        assert_eq!(chunks[2].start_char, 54);
    }

    #[test]
    fn test_semantic_page_numbers() {
        let pages = vec![
            PageText::new(3, "First page sentence."),
            PageText::new(4, "Second page sentence."),
        ];
        let chunks = chunk_with(ChunkStrategy::Semantic, 100, 0, &pages);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, Some(3));
        assert_eq!(chunks[1].page_number, Some(4));
    }

    #[test]
    fn test_jaccard_similarity() {
        assert_eq!(jaccard_similarity("a b c", "A B C"), 1.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
        assert!((jaccard_similarity("a b c", "a b d") - 0.5).abs() < 1e-9);
        assert_eq!(jaccard_similarity("", ""), 0.0);
    }

    #[test]
    fn test_tail_chars_unicode() {
        assert_eq!(tail_chars("안녕하세요 세계", 2), "세계");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }

    #[test]
    fn test_chunk_stats() {
        let pages = vec![PageText::new(1, "one two three four five six seven eight nine ten")];
        let chunks = chunk_with(ChunkStrategy::Recursive, 20, 0, &pages);
        let stats = ChunkStats::from_chunks(&chunks);

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_length, 8);
        assert_eq!(stats.max_length, 20);
        assert_eq!(stats.total_chars, 18 + 20 + 8);
        assert_eq!(ChunkStats::from_chunks(&[]), ChunkStats::default());
    }
}
