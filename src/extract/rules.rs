//! Rule-based entity model.
//!
//! Mentions are runs of capitalized words; their type comes from suffixes and
//! neighbouring cue words. Relationships come from the phrase between two
//! mentions. Deterministic and dependency-free, so it doubles as the model
//! used in tests.

use async_trait::async_trait;

use crate::extract::{DetectedMention, EntityModel, ExtractionError, RelationshipGuess};
use crate::graph::{EntityType, RelationshipType};

const ORG_SUFFIXES: &[&str] = &[
    "corp", "corporation", "inc", "ltd", "llc", "gmbh", "company", "co", "group", "labs",
    "university", "institute", "foundation", "bank", "agency",
];

const HONORIFICS: &[&str] = &["dr", "mr", "mrs", "ms", "prof", "sir"];

const LOCATION_PREPS: &[&str] = &["in", "near", "from", "across"];

const PERSON_VERBS: &[&str] = &[
    "works", "worked", "said", "says", "met", "meets", "wrote", "writes", "lives", "lived",
    "founded", "joined", "leads", "led", "manages", "managed", "thinks", "asked", "told",
];

/// Capitalized words that do not start a name on their own.
const STOPWORDS: &[&str] = &[
    "a", "after", "all", "also", "an", "and", "at", "before", "but", "by", "each", "every",
    "finally", "for", "from", "he", "her", "here", "his", "however", "i", "if", "in", "it",
    "its", "later", "many", "meanwhile", "my", "near", "next", "of", "on", "or", "our", "she",
    "so", "some", "that", "the", "their", "then", "there", "these", "they", "this", "those",
    "to", "today", "tomorrow", "we", "when", "while", "with", "yesterday", "you", "your",
];

const WORKS_FOR: &[&str] = &[
    "works at", "works for", "worked at", "worked for", "working at", "working for",
    "employed by", "employee of", "joined",
];
const LOCATED_IN: &[&str] = &[
    "located in", "located at", "based in", "headquartered in", "situated in",
];
const PART_OF: &[&str] = &["part of", "member of", "division of", "subsidiary of", "belongs to"];
const IS_A: &[&str] = &["is a", "is an", "are a", "kind of", "type of"];

const RELATED_CONFIDENCE: f32 = 0.4;

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedModel;

impl RuleBasedModel {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`EntityModel::detect_entities`].
    #[must_use]
    pub fn detect(&self, text: &str) -> Vec<DetectedMention> {
        let tokens = tokenize(text);
        let mut mentions = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            if !tokens[i].is_capitalized() {
                i += 1;
                continue;
            }
            let mut end = i;
            while end + 1 < tokens.len()
                && tokens[end + 1].is_capitalized()
                && plain_gap(text, &tokens[end], &tokens[end + 1])
            {
                end += 1;
            }
            if let Some(mention) = classify_run(text, &tokens, i, end) {
                mentions.push(mention);
            }
            i = end + 1;
        }

        mentions
    }

    /// Synchronous core of [`EntityModel::classify_relationship`].
    #[must_use]
    pub fn classify(
        &self,
        source: &DetectedMention,
        target: &DetectedMention,
        between: &str,
    ) -> RelationshipGuess {
        let words: Vec<String> = between
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let has = |phrases: &[&str]| phrases.iter().any(|p| contains_phrase(&words, p));

        let (relationship_type, base) = if has(WORKS_FOR) {
            (RelationshipType::WorksFor, 0.85)
        } else if has(LOCATED_IN) {
            (RelationshipType::LocatedIn, 0.85)
        } else if has(PART_OF) {
            (RelationshipType::PartOf, 0.8)
        } else if has(IS_A) {
            (RelationshipType::IsA, 0.7)
        } else {
            return RelationshipGuess {
                relationship_type: RelationshipType::RelatedTo,
                confidence: RELATED_CONFIDENCE,
            };
        };

        let adjust = type_agreement(&relationship_type, source.entity_type, target.entity_type);
        RelationshipGuess {
            relationship_type,
            confidence: (base + adjust).clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl EntityModel for RuleBasedModel {
    async fn detect_entities(&self, text: &str) -> Result<Vec<DetectedMention>, ExtractionError> {
        Ok(self.detect(text))
    }

    async fn classify_relationship(
        &self,
        source: &DetectedMention,
        target: &DetectedMention,
        between: &str,
    ) -> Result<Option<RelationshipGuess>, ExtractionError> {
        Ok(Some(self.classify(source, target, between)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

impl Token<'_> {
    fn is_capitalized(&self) -> bool {
        self.text.chars().next().is_some_and(char::is_uppercase)
    }

    fn lower(&self) -> String {
        self.text.to_lowercase()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '\'' | '&' | '-')
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = None;

    for (idx, c) in text.char_indices() {
        match (is_word_char(c), start) {
            (true, None) => start = Some(idx),
            (false, Some(s)) => {
                tokens.push(Token {
                    text: &text[s..idx],
                    start: s,
                    end: idx,
                });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            text: &text[s..],
            start: s,
            end: text.len(),
        });
    }

    tokens
}

/// Two tokens separated only by spaces on the same line.
fn plain_gap(text: &str, left: &Token<'_>, right: &Token<'_>) -> bool {
    text[left.end..right.start].chars().all(|c| c == ' ' || c == '\t')
}

fn starts_sentence(text: &str, tokens: &[Token<'_>], index: usize) -> bool {
    let before = match index.checked_sub(1) {
        Some(prev) => &text[tokens[prev].end..tokens[index].start],
        None => return true,
    };
    before.contains(['.', '!', '?', '\n', ':'])
}

fn classify_run(
    text: &str,
    tokens: &[Token<'_>],
    run_start: usize,
    run_end: usize,
) -> Option<DetectedMention> {
    let mut first = run_start;
    let mut honorific = false;
    while first <= run_end {
        let word = tokens[first].lower();
        if HONORIFICS.contains(&word.as_str()) {
            honorific = true;
        } else if !STOPWORDS.contains(&word.as_str()) {
            break;
        }
        first += 1;
    }
    if first > run_end {
        return None;
    }

    let prev = first.checked_sub(1).map(|p| &tokens[p]);
    let prev_word = prev.map(Token::lower);
    let prev_adjacent = prev.is_some_and(|p| plain_gap(text, p, &tokens[first]));
    if let Some(word) = &prev_word
        && HONORIFICS.contains(&word.as_str())
    {
        honorific = true;
    }

    let next = tokens.get(run_end + 1);
    let next_is_verb = next.is_some_and(|n| {
        plain_gap(text, &tokens[run_end], n) && PERSON_VERBS.contains(&n.lower().as_str())
    });

    let last = tokens[run_end].lower();
    let last = last.strip_suffix("'s").unwrap_or(&last);
    let (entity_type, confidence) = if first < run_end && ORG_SUFFIXES.contains(&last) {
        (EntityType::Organization, 0.9)
    } else if honorific {
        (EntityType::Person, 0.9)
    } else if prev_adjacent
        && prev_word
            .as_deref()
            .is_some_and(|w| LOCATION_PREPS.contains(&w))
    {
        (EntityType::Location, 0.8)
    } else if next_is_verb {
        (EntityType::Person, 0.75)
    } else {
        (EntityType::Other, 0.4)
    };

    if entity_type == EntityType::Other
        && first == run_end
        && first == run_start
        && starts_sentence(text, tokens, run_start)
    {
        return None;
    }

    let start = tokens[first].start;
    let mut end = tokens[run_end].end;
    let tail = &text[start..end];
    if tail.ends_with("'s") && tail.len() > 2 {
        end -= 2;
    }

    Some(DetectedMention {
        text: text[start..end].to_string(),
        offset: start,
        entity_type,
        confidence,
    })
}

fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let parts: Vec<&str> = phrase.split(' ').collect();
    words
        .windows(parts.len())
        .any(|window| window.iter().zip(&parts).all(|(w, p)| w == p))
}

/// Confidence adjustment for how well the mention types fit the relation.
fn type_agreement(
    relationship_type: &RelationshipType,
    source: EntityType,
    target: EntityType,
) -> f32 {
    match relationship_type {
        RelationshipType::WorksFor => match (source, target) {
            (EntityType::Person, EntityType::Organization) => 0.1,
            (_, EntityType::Person | EntityType::Location) | (EntityType::Location, _) => -0.2,
            _ => 0.0,
        },
        RelationshipType::LocatedIn => match target {
            EntityType::Location => 0.1,
            EntityType::Person => -0.2,
            _ => 0.0,
        },
        _ => 0.0,
    }
}
