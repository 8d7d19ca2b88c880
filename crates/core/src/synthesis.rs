//! Answer synthesis over retrieved chunks.
//!
//! The extractive strategy needs nothing but the chunks. The generative
//! strategy hands a context-grounded prompt to a [`TextGenerator`] and, if the
//! backend errors, times out or returns nothing, answers extractively and
//! reports the answer as degraded.

use crate::error::GenerationError;
use crate::generation::TextGenerator;
use crate::models::{Answer, RetrievedChunk};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use unicode_segmentation::UnicodeSegmentation;

pub const NO_RELEVANT_DOCUMENTS: &str = "No relevant documents found to answer this question.";
pub const NO_RELEVANT_SENTENCE: &str = "Unable to find relevant information.";
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 6_000;

const SELECTED_SENTENCES: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: Answer,
    /// Why the generative backend was bypassed, when it was.
    pub degraded: Option<String>,
}

pub struct AnswerSynthesizer {
    generator: Option<Arc<dyn TextGenerator>>,
    timeout: Duration,
    max_context_chars: usize,
}

impl AnswerSynthesizer {
    pub fn extractive() -> Self {
        Self {
            generator: None,
            timeout: DEFAULT_GENERATION_TIMEOUT,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }

    pub fn generative(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator: Some(generator),
            ..Self::extractive()
        }
    }

    /// `None` selects the extractive strategy.
    pub fn from_generator(generator: Option<Arc<dyn TextGenerator>>) -> Self {
        match generator {
            Some(generator) => Self::generative(generator),
            None => Self::extractive(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_context_chars(mut self, max_context_chars: usize) -> Self {
        self.max_context_chars = max_context_chars;
        self
    }

    pub fn strategy_name(&self) -> &str {
        self.generator
            .as_ref()
            .map(|generator| generator.name())
            .unwrap_or("extractive")
    }

    pub async fn synthesize(&self, question: &str, retrieved: &[RetrievedChunk]) -> Synthesis {
        let Some(generator) = &self.generator else {
            return Synthesis {
                answer: extractive_answer(question, retrieved),
                degraded: None,
            };
        };

        if retrieved.is_empty() {
            return Synthesis {
                answer: extractive_answer(question, retrieved),
                degraded: None,
            };
        }

        let (prompt, used) = build_prompt(question, retrieved, self.max_context_chars);
        match self.generate(generator.as_ref(), &prompt).await {
            Ok(text) => Synthesis {
                answer: Answer::with_sources(text, &retrieved[..used]),
                degraded: None,
            },
            Err(error) => Synthesis {
                answer: extractive_answer(question, retrieved),
                degraded: Some(error.to_string()),
            },
        }
    }

    async fn generate(
        &self,
        generator: &dyn TextGenerator,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let reply = tokio::time::timeout(self.timeout, generator.generate(prompt))
            .await
            .map_err(|_| GenerationError::Timeout {
                backend: generator.name().to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(GenerationError::EmptyResponse {
                backend: generator.name().to_string(),
            });
        }
        Ok(reply.to_string())
    }
}

/// Picks the sentences sharing the most distinct words with the question.
pub fn extractive_answer(question: &str, retrieved: &[RetrievedChunk]) -> Answer {
    if retrieved.is_empty() {
        return Answer {
            text: NO_RELEVANT_DOCUMENTS.to_string(),
            sources: Vec::new(),
        };
    }

    let tokens = question_tokens(question);

    // (score, chunk rank, sentence position, sentence)
    let mut scored: Vec<(usize, usize, usize, &str)> = Vec::new();
    for (rank, item) in retrieved.iter().enumerate() {
        for (position, sentence) in split_sentences(&item.chunk.text).into_iter().enumerate() {
            let score = sentence_score(sentence, &tokens);
            if score > 0 {
                scored.push((score, rank, position, sentence));
            }
        }
    }

    if scored.is_empty() {
        let first = split_sentences(&retrieved[0].chunk.text)
            .into_iter()
            .next()
            .map(terminated)
            .unwrap_or_else(|| NO_RELEVANT_SENTENCE.to_string());
        return Answer::with_sources(first, retrieved);
    }

    scored.sort_by(|left, right| {
        right
            .0
            .cmp(&left.0)
            .then(left.1.cmp(&right.1))
            .then(left.2.cmp(&right.2))
    });
    scored.truncate(SELECTED_SENTENCES);

    let text = scored
        .iter()
        .map(|(_, _, _, sentence)| terminated(sentence))
        .collect::<Vec<_>>()
        .join(" ");
    let used = scored.iter().map(|(_, rank, _, _)| &retrieved[*rank]);

    Answer::with_sources(text, used)
}

/// Builds the context-grounded prompt. Returns it with the number of leading
/// chunks that fit into `max_context_chars` (at least one).
pub fn build_prompt(
    question: &str,
    retrieved: &[RetrievedChunk],
    max_context_chars: usize,
) -> (String, usize) {
    let mut context = String::new();
    let mut used = 0;

    for (position, item) in retrieved.iter().enumerate() {
        let block = format!(
            "[Source {}: {}, page {}]\n{}\n\n",
            position + 1,
            item.chunk.source,
            item.chunk.page,
            item.chunk.text.trim()
        );
        if used > 0 && context.chars().count() + block.chars().count() > max_context_chars {
            break;
        }
        context.push_str(&block);
        used += 1;
    }

    let prompt = format!(
        "Here are excerpts from documents:\n\n{context}Question:\n{question}\n\nTask:\n\
         - Answer clearly and concisely.\n\
         - Use ONLY the information in the excerpts above; if they do not contain the answer, say so.\n"
    );

    (prompt, used)
}

pub fn question_tokens(question: &str) -> BTreeSet<String> {
    question
        .unicode_words()
        .map(|word| word.to_lowercase())
        .collect()
}

/// Sentences end at `.`, `!` or `?`; runs of terminators stay with their sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let mut end = index + ch.len_utf8();
        while let Some(&(next_index, next)) = chars.peek() {
            if !matches!(next, '.' | '!' | '?') {
                break;
            }
            end = next_index + next.len_utf8();
            chars.next();
        }
        push_sentence(&mut sentences, &text[start..end]);
        start = end;
    }
    push_sentence(&mut sentences, &text[start..]);

    sentences
}

fn push_sentence<'a>(sentences: &mut Vec<&'a str>, candidate: &'a str) {
    let trimmed = candidate.trim();
    if trimmed.chars().any(char::is_alphanumeric) {
        sentences.push(trimmed);
    }
}

fn sentence_score(sentence: &str, tokens: &BTreeSet<String>) -> usize {
    let lowered = sentence.to_lowercase();
    tokens
        .iter()
        .filter(|token| lowered.contains(token.as_str()))
        .count()
}

fn terminated(sentence: &str) -> String {
    if sentence.ends_with(['.', '!', '?']) {
        sentence.to_string()
    } else {
        format!("{sentence}.")
    }
}
