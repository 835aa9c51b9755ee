//! Byte-level BPE tokenizer matching the training-time tokenizer exactly.
//!
//! Every input byte is first mapped to a printable surrogate codepoint so that
//! arbitrary bytes become mergeable symbols, then ranked merge rules are
//! applied until fixpoint, then surviving symbols are looked up in the
//! vocabulary. Symbols absent from the vocabulary are dropped rather than
//! substituted.
//!
//! # Pipeline
//!
//! ```text
//! text ──pre-tokenize──▶ fragments ──utf-8──▶ bytes ──surrogate map──▶ symbols
//!      ──ranked merges──▶ merged symbols ──vocab lookup──▶ token ids
//! ```

use crate::error::{LyrebirdError, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const CONTRACTIONS: [&str; 7] = ["'s", "'t", "'re", "'ve", "'m", "'ll", "'d"];

/// Byte-level BPE tokenizer.
#[derive(Debug)]
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    vocab_reverse: HashMap<u32, String>,
    /// Merge rank keyed by `"left right"`; symbols never contain a space.
    merge_ranks: HashMap<String, usize>,
    /// Descriptor-supplied splitting pattern, when it is expressible.
    split_pattern: Option<Regex>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
}

impl Tokenizer {
    /// Load a tokenizer descriptor (`tokenizer.json`).
    ///
    /// The vocabulary and merge list are required; the pre-tokenization
    /// pattern is optional and falls back to the built-in splitter when
    /// absent or not expressible.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LyrebirdError::NotFound(format!(
                "tokenizer descriptor {} is missing",
                path.display()
            )),
            _ => LyrebirdError::Io(format!(
                "failed reading tokenizer descriptor {}: {}",
                path.display(),
                e
            )),
        })?;
        let doc: Value = serde_json::from_str(&raw).map_err(|e| {
            LyrebirdError::DataFormat(format!("malformed tokenizer descriptor: {e}"))
        })?;

        let vocab = parse_vocab(&doc)?;
        let merges = parse_merges(&doc)?;

        let split_pattern = find_split_pattern(&doc).and_then(|pattern| {
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    // Patterns using lookaround land here; the built-in
                    // splitter implements the same semantics.
                    debug!("descriptor split pattern not expressible ({e}), using built-in");
                    None
                }
            }
        });

        debug!(
            "loaded tokenizer: {} vocab entries, {} merges",
            vocab.len(),
            merges.len()
        );

        Ok(Self::build(vocab, merges, split_pattern))
    }

    /// Construct from an explicit vocabulary and ranked merge list.
    pub fn from_parts(vocab: HashMap<String, u32>, merges: Vec<(String, String)>) -> Self {
        Self::build(vocab, merges, None)
    }

    fn build(
        vocab: HashMap<String, u32>,
        merges: Vec<(String, String)>,
        split_pattern: Option<Regex>,
    ) -> Self {
        let vocab_reverse = vocab.iter().map(|(s, &id)| (id, s.clone())).collect();
        let merge_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, (a, b))| (format!("{a} {b}"), rank))
            .collect();
        let byte_encoder = byte_unicode_table();
        let byte_decoder = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        Self {
            vocab,
            vocab_reverse,
            merge_ranks,
            split_pattern,
            byte_encoder,
            byte_decoder,
        }
    }

    /// Encode text into token ids.
    ///
    /// Deterministic; empty or whitespace-only input yields an empty or
    /// near-empty sequence.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for fragment in self.pre_tokenize(text) {
            let symbols: Vec<String> = fragment
                .bytes()
                .map(|b| self.byte_encoder[b as usize].to_string())
                .collect();
            for symbol in self.apply_merges(symbols) {
                if let Some(&id) = self.vocab.get(&symbol) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Decode token ids back into text. Diagnostic use only; unknown ids and
    /// unmappable surrogates are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for id in ids {
            let Some(symbol) = self.vocab_reverse.get(id) else {
                continue;
            };
            for c in symbol.chars() {
                if let Some(&b) = self.byte_decoder.get(&c) {
                    bytes.push(b);
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Number of vocabulary entries.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Direct vocabulary lookup for a single symbol.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    fn pre_tokenize(&self, text: &str) -> Vec<String> {
        match &self.split_pattern {
            Some(re) => re.find_iter(text).map(|m| m.as_str().to_string()).collect(),
            None => default_fragments(text),
        }
    }

    /// Repeatedly merge the lowest-ranked adjacent symbol pair until none
    /// applies.
    fn apply_merges(&self, mut parts: Vec<String>) -> Vec<String> {
        while parts.len() >= 2 {
            let mut best_rank = usize::MAX;
            let mut best_pair: Option<(String, String)> = None;
            for window in parts.windows(2) {
                let key = format!("{} {}", window[0], window[1]);
                if let Some(&rank) = self.merge_ranks.get(&key) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_pair = Some((window[0].clone(), window[1].clone()));
                    }
                }
            }
            let Some((a, b)) = best_pair else {
                break;
            };

            let mut merged = Vec::with_capacity(parts.len());
            let mut i = 0;
            while i < parts.len() {
                if i + 1 < parts.len() && parts[i] == a && parts[i + 1] == b {
                    merged.push(format!("{a}{b}"));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut parts[i]));
                    i += 1;
                }
            }
            parts = merged;
        }
        parts
    }
}

/// The byte ↔ surrogate-codepoint table.
///
/// Printable single-byte ranges (`!..=~`, `¡..=¬`, `®..=ÿ`) map to themselves;
/// every other byte value maps to a consecutive synthetic codepoint starting
/// at 256, so every byte is representable as a mergeable symbol.
fn byte_unicode_table() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut printable = [false; 256];
    for range in [0x21..=0x7E_usize, 0xA1..=0xAC, 0xAE..=0xFF] {
        for b in range {
            printable[b] = true;
            table[b] = char::from_u32(b as u32).unwrap_or('\0');
        }
    }
    let mut next = 256u32;
    for (b, slot) in table.iter_mut().enumerate() {
        if !printable[b] {
            *slot = char::from_u32(next).unwrap_or('\0');
            next += 1;
        }
    }
    table
}

/// Built-in pre-tokenization: contractions, optionally space-prefixed letter /
/// number / punctuation runs over Unicode categories, then whitespace, with a
/// trailing whitespace character left attached to the following fragment.
fn default_fragments(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut fragments = Vec::new();
    let mut i = 0;

    let collect = |from: usize, to: usize| -> String { chars[from..to].iter().collect() };

    while i < n {
        let c = chars[i];

        if c == '\'' {
            if let Some(len) = match_contraction(&chars, i) {
                fragments.push(collect(i, i + len));
                i += len;
                continue;
            }
        }

        if c == ' ' && i + 1 < n && !chars[i + 1].is_whitespace() {
            let j = class_run_end(&chars, i + 1);
            fragments.push(collect(i, j));
            i = j;
            continue;
        }

        if !c.is_whitespace() {
            let j = class_run_end(&chars, i);
            fragments.push(collect(i, j));
            i = j;
            continue;
        }

        let mut j = i;
        while j < n && chars[j].is_whitespace() {
            j += 1;
        }
        if j < n && j - i > 1 {
            // Whitespace before a non-space fragment keeps its final character
            // for the fragment's optional leading space.
            fragments.push(collect(i, j - 1));
            i = j - 1;
        } else {
            fragments.push(collect(i, j));
            i = j;
        }
    }

    fragments
}

fn match_contraction(chars: &[char], at: usize) -> Option<usize> {
    for candidate in CONTRACTIONS {
        let len = candidate.chars().count();
        if at + len <= chars.len() && chars[at..at + len].iter().copied().eq(candidate.chars()) {
            return Some(len);
        }
    }
    None
}

/// End of the run of the character class starting at `start` (letters,
/// numbers, or anything else that is not whitespace).
fn class_run_end(chars: &[char], start: usize) -> usize {
    let n = chars.len();
    let mut j = start + 1;
    let first = chars[start];
    if first.is_alphabetic() {
        while j < n && chars[j].is_alphabetic() {
            j += 1;
        }
    } else if first.is_numeric() {
        while j < n && chars[j].is_numeric() {
            j += 1;
        }
    } else {
        while j < n && !chars[j].is_whitespace() && !chars[j].is_alphabetic() && !chars[j].is_numeric()
        {
            j += 1;
        }
    }
    j
}

fn parse_vocab(doc: &Value) -> Result<HashMap<String, u32>> {
    let vocab = doc
        .pointer("/model/vocab")
        .or_else(|| doc.get("vocab"))
        .and_then(Value::as_object)
        .ok_or_else(|| {
            LyrebirdError::DataFormat("tokenizer descriptor has no vocabulary".to_string())
        })?;

    let mut out = HashMap::with_capacity(vocab.len());
    for (token, id) in vocab {
        let id = id.as_u64().ok_or_else(|| {
            LyrebirdError::DataFormat(format!("non-integer id for vocab entry '{token}'"))
        })?;
        out.insert(token.clone(), id as u32);
    }
    Ok(out)
}

fn parse_merges(doc: &Value) -> Result<Vec<(String, String)>> {
    let merges = doc
        .pointer("/model/merges")
        .or_else(|| doc.get("merges"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            LyrebirdError::DataFormat("tokenizer descriptor has no merge list".to_string())
        })?;

    let mut out = Vec::with_capacity(merges.len());
    for entry in merges {
        match entry {
            Value::String(line) => {
                let mut halves = line.splitn(2, ' ');
                match (halves.next(), halves.next()) {
                    (Some(a), Some(b)) => out.push((a.to_string(), b.to_string())),
                    _ => {
                        return Err(LyrebirdError::DataFormat(format!(
                            "malformed merge entry '{line}'"
                        )));
                    }
                }
            }
            Value::Array(pair) if pair.len() == 2 => {
                match (pair[0].as_str(), pair[1].as_str()) {
                    (Some(a), Some(b)) => out.push((a.to_string(), b.to_string())),
                    _ => {
                        return Err(LyrebirdError::DataFormat(
                            "malformed merge pair entry".to_string(),
                        ));
                    }
                }
            }
            other => {
                return Err(LyrebirdError::DataFormat(format!(
                    "unexpected merge entry: {other}"
                )));
            }
        }
    }
    Ok(out)
}

/// Find a `Split` pre-tokenizer regex anywhere under `pre_tokenizer`.
fn find_split_pattern(doc: &Value) -> Option<String> {
    fn walk(v: &Value) -> Option<String> {
        match v {
            Value::Object(map) => {
                if let Some(Value::String(pattern)) = map.get("Regex") {
                    return Some(pattern.clone());
                }
                map.values().find_map(walk)
            }
            Value::Array(items) => items.iter().find_map(walk),
            _ => None,
        }
    }
    walk(doc.get("pre_tokenizer")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer_for(symbols: &[&str], merges: &[(&str, &str)]) -> Tokenizer {
        let vocab = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();
        let merges = merges
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        Tokenizer::from_parts(vocab, merges)
    }

    /// Vocabulary covering every mapped single byte, so encode/decode are
    /// exact inverses with no merges involved.
    fn byte_identity_tokenizer() -> Tokenizer {
        let table = byte_unicode_table();
        let vocab = (0..256u32)
            .map(|b| (table[b as usize].to_string(), b))
            .collect();
        Tokenizer::from_parts(vocab, Vec::new())
    }

    #[test]
    fn byte_table_is_total_and_injective() {
        let table = byte_unicode_table();
        let mut seen = std::collections::HashSet::new();
        for &c in &table {
            assert_ne!(c, '\0');
            assert!(seen.insert(c));
        }
        assert_eq!(table[b'A' as usize], 'A');
        assert_eq!(table[b'~' as usize], '~');
        assert_eq!(table[0x20], '\u{120}');
        assert_eq!(table[0x0A], '\u{10A}');
    }

    #[test]
    fn ranked_merges_apply_lowest_first() {
        let tok = tokenizer_for(
            &["hello"],
            &[("h", "e"), ("l", "l"), ("he", "ll"), ("hell", "o")],
        );
        assert_eq!(tok.encode("hello"), vec![0]);
    }

    #[test]
    fn unknown_symbols_are_dropped() {
        let tok = tokenizer_for(&["a"], &[]);
        assert_eq!(tok.encode("ab"), vec![0]);
        assert_eq!(tok.encode("zzz"), Vec::<u32>::new());
    }

    #[test]
    fn empty_input_encodes_to_nothing() {
        let tok = byte_identity_tokenizer();
        assert_eq!(tok.encode(""), Vec::<u32>::new());
    }

    #[test]
    fn ascii_round_trip() {
        let tok = byte_identity_tokenizer();
        let text = "Hello, world! It's 42 degrees.";
        assert_eq!(tok.decode(&tok.encode(text)), text);
    }

    #[test]
    fn encode_is_deterministic() {
        let tok = byte_identity_tokenizer();
        let text = "same input, same ids";
        assert_eq!(tok.encode(text), tok.encode(text));
    }

    #[test]
    fn default_fragments_split_words_and_punctuation() {
        assert_eq!(
            default_fragments("Hello, world!"),
            vec!["Hello", ",", " world", "!"]
        );
    }

    #[test]
    fn default_fragments_handle_contractions() {
        assert_eq!(default_fragments("it's"), vec!["it", "'s"]);
        assert_eq!(default_fragments("we'll go"), vec!["we", "'ll", " go"]);
    }

    #[test]
    fn default_fragments_attach_single_leading_space() {
        assert_eq!(default_fragments("a  b"), vec!["a", " ", " b"]);
        assert_eq!(default_fragments("abc 123"), vec!["abc", " 123"]);
    }

    #[test]
    fn default_fragments_keep_trailing_whitespace() {
        assert_eq!(default_fragments("hi  "), vec!["hi", "  "]);
        assert_eq!(default_fragments("a\nb"), vec!["a", "\n", "b"]);
    }

    #[test]
    fn descriptor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(
            &path,
            r#"{
                "model": {
                    "vocab": {"hello": 0, "h": 1, "e": 2, "l": 3, "o": 4},
                    "merges": ["h e", "l l", "he ll", "hell o"]
                }
            }"#,
        )
        .unwrap();
        let tok = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tok.vocab_size(), 5);
        assert_eq!(tok.encode("hello"), vec![0]);
    }

    #[test]
    fn descriptor_pair_merges_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(
            &path,
            r#"{"model": {"vocab": {"ab": 0}, "merges": [["a", "b"]]}}"#,
        )
        .unwrap();
        let tok = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tok.encode("ab"), vec![0]);
    }

    #[test]
    fn descriptor_split_pattern_is_used_when_expressible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(
            &path,
            r#"{
                "model": {"vocab": {"a": 0, "b": 1}, "merges": []},
                "pre_tokenizer": {
                    "type": "Sequence",
                    "pretokenizers": [
                        {"type": "Split", "pattern": {"Regex": "[ab]"}, "behavior": "Isolated"}
                    ]
                }
            }"#,
        )
        .unwrap();
        let tok = Tokenizer::from_file(&path).unwrap();
        assert!(tok.split_pattern.is_some());
        assert_eq!(tok.encode("a-b"), vec![0, 1]);
    }

    #[test]
    fn malformed_descriptor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, r#"{"model": {}}"#).unwrap();
        let err = Tokenizer::from_file(&path).unwrap_err();
        assert!(matches!(err, LyrebirdError::DataFormat(_)));
    }
}
