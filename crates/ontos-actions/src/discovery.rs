//! Keyword index for shortlisting actions from free text.
//!
//! Text is tokenised for mixed Chinese/English input: ASCII alphanumeric
//! runs become lowercase words, runs of CJK characters contribute both
//! unigrams and bigrams. A document is an action's name, description and
//! search keywords.

use std::collections::{HashMap, HashSet};

use ontos_protocol::ActionMetadata;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Word(String),
    Unigram(char),
    Bigram(char, char),
}

impl Token {
    fn weight(&self) -> f64 {
        match self {
            Token::Word(_) | Token::Bigram(..) => 2.0,
            Token::Unigram(_) => 1.0,
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut prev_cjk: Option<char> = None;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            word.push(c.to_ascii_lowercase());
            prev_cjk = None;
            continue;
        }
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(&mut word)));
        }
        if is_cjk(c) {
            tokens.push(Token::Unigram(c));
            if let Some(prev) = prev_cjk {
                tokens.push(Token::Bigram(prev, c));
            }
            prev_cjk = Some(c);
        } else {
            prev_cjk = None;
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub action: String,
    pub score: f64,
}

#[derive(Debug, Default, Clone)]
struct Document {
    tokens: HashSet<Token>,
    phrases: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct SemanticIndex {
    documents: HashMap<String, Document>,
}

impl SemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&mut self, action: &ActionMetadata) {
        let mut text = action.name.replace('_', " ");
        text.push(' ');
        text.push_str(&action.description);
        for keyword in &action.search_keywords {
            text.push(' ');
            text.push_str(keyword);
        }
        let document = Document {
            tokens: tokenize(&text).into_iter().collect(),
            phrases: action
                .search_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        };
        self.documents.insert(action.name.clone(), document);
    }

    pub fn remove(&mut self, name: &str) {
        self.documents.remove(name);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Scores every indexed action against `text`, best first. Whole keyword
    /// phrases found verbatim in the text add a bonus proportional to their
    /// length.
    pub fn score_all(&self, text: &str) -> Vec<SearchHit> {
        let query: HashSet<Token> = tokenize(text).into_iter().collect();
        let lowered = text.to_lowercase();
        let mut hits: Vec<SearchHit> = self
            .documents
            .iter()
            .filter_map(|(name, doc)| {
                let overlap: f64 = query
                    .iter()
                    .filter(|t| doc.tokens.contains(t))
                    .map(Token::weight)
                    .sum();
                let phrase_bonus: f64 = doc
                    .phrases
                    .iter()
                    .filter(|p| lowered.contains(p.as_str()))
                    .map(|p| 2.0 + p.chars().count() as f64)
                    .sum();
                let score = overlap + phrase_bonus;
                (score > 0.0).then(|| SearchHit {
                    action: name.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.action.cmp(&b.action)));
        hits
    }

    pub fn search(&self, text: &str, k: usize) -> Vec<SearchHit> {
        let mut hits = self.score_all(text);
        hits.truncate(k);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> SemanticIndex {
        let mut index = SemanticIndex::new();
        index.index(
            &ActionMetadata::new("walkin_checkin", "StayRecord")
                .describe("散客入住 walk-in check in")
                .keywords(["入住", "开房", "check in"]),
        );
        index.index(
            &ActionMetadata::new("checkout", "StayRecord")
                .describe("办理退房 check out")
                .keywords(["退房", "结账", "check out"]),
        );
        index.index(
            &ActionMetadata::new("add_payment", "Bill")
                .describe("收款 record a payment")
                .keywords(["付款", "收款", "押金", "payment"]),
        );
        index
    }

    #[test]
    fn tokenizer_mixes_words_and_cjk_ngrams() {
        let tokens = tokenize("Room 101退房");
        assert!(tokens.contains(&Token::Word("room".into())));
        assert!(tokens.contains(&Token::Word("101".into())));
        assert!(tokens.contains(&Token::Bigram('退', '房')));
        assert!(tokens.contains(&Token::Unigram('退')));
    }

    #[test]
    fn chinese_query_finds_checkout() {
        let hits = index().search("帮201房间退房", 2);
        assert_eq!(hits[0].action, "checkout");
    }

    #[test]
    fn english_query_finds_payment() {
        let hits = index().search("record a payment of 200 for bill B1", 3);
        assert_eq!(hits[0].action, "add_payment");
    }

    #[test]
    fn unrelated_text_scores_nothing() {
        assert!(index().search("xyz", 5).is_empty());
    }
}
