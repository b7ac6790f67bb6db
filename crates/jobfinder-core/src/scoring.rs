//! Scoring engine: veto rules first, then a weighted 0..=100 score.
//!
//! Scoring is a pure function of `(criteria, posting)`; nothing here reads the
//! clock or any shared state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::canonical::normalize_company;
use crate::{Criteria, Posting};

pub const TITLE_WEIGHT: u32 = 40;
pub const TECH_STACK_WEIGHT: u32 = 40;
pub const WHITELIST_BONUS: u32 = 20;

const FUZZY_TOKEN_THRESHOLD: f64 = 0.93;
const FUZZY_MIN_TOKEN_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoReason {
    BlacklistedCompany,
    ExcludedKeyword,
    SalaryBelowFloor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub score: u8,
    pub veto: Option<VetoReason>,
}

impl ScoreOutcome {
    pub fn is_vetoed(&self) -> bool {
        self.veto.is_some()
    }

    fn vetoed(reason: VetoReason) -> Self {
        Self {
            score: 0,
            veto: Some(reason),
        }
    }
}

/// Lower-cased word tokens. `+` and `#` stay inside tokens so `c++` and `c#`
/// survive.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '+' || c == '#'))
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn tokens_match(wanted: &str, candidate: &str) -> bool {
    if wanted == candidate {
        return true;
    }
    wanted.chars().count() >= FUZZY_MIN_TOKEN_LEN
        && candidate.chars().count() >= FUZZY_MIN_TOKEN_LEN
        && jaro_winkler(wanted, candidate) >= FUZZY_TOKEN_THRESHOLD
}

fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty()
        && haystack.len() >= phrase.len()
        && haystack.windows(phrase.len()).any(|w| w == phrase)
}

pub fn score(criteria: &Criteria, posting: &Posting) -> ScoreOutcome {
    let company = normalize_company(&posting.company);
    if criteria
        .company_blacklist
        .iter()
        .any(|c| normalize_company(c) == company)
    {
        return ScoreOutcome::vetoed(VetoReason::BlacklistedCompany);
    }

    let title_tokens = tokenize(&posting.title);
    let description_tokens = posting
        .description
        .as_deref()
        .map(tokenize)
        .unwrap_or_default();

    if criteria.exclude_keywords.iter().any(|kw| {
        let phrase = tokenize(kw);
        contains_phrase(&title_tokens, &phrase) || contains_phrase(&description_tokens, &phrase)
    }) {
        return ScoreOutcome::vetoed(VetoReason::ExcludedKeyword);
    }

    if salary_below_floor(criteria.min_salary, posting.salary_min, posting.salary_max) {
        return ScoreOutcome::vetoed(VetoReason::SalaryBelowFloor);
    }

    let total = title_points(criteria, &title_tokens)
        + tech_stack_points(criteria, posting, &title_tokens, &description_tokens)
        + whitelist_points(criteria, &company);

    ScoreOutcome {
        score: total.min(100) as u8,
        veto: None,
    }
}

/// The floor only vetoes when the known bounds rule the posting out: the
/// maximum is below the floor and the minimum is either unknown or below too.
fn salary_below_floor(floor: i64, salary_min: Option<i64>, salary_max: Option<i64>) -> bool {
    if floor <= 0 {
        return false;
    }
    match salary_max {
        Some(max) if max < floor => salary_min.map_or(true, |min| min < floor),
        _ => false,
    }
}

fn title_points(criteria: &Criteria, title_tokens: &[String]) -> u32 {
    criteria
        .titles
        .iter()
        .map(|wanted| {
            let wanted = tokenize(wanted)
                .into_iter()
                .collect::<BTreeSet<_>>();
            if wanted.is_empty() {
                return 0;
            }
            let hits = wanted
                .iter()
                .filter(|w| title_tokens.iter().any(|t| tokens_match(w, t)))
                .count() as u32;
            hits * TITLE_WEIGHT / wanted.len() as u32
        })
        .max()
        .unwrap_or(0)
}

fn tech_stack_points(
    criteria: &Criteria,
    posting: &Posting,
    title_tokens: &[String],
    description_tokens: &[String],
) -> u32 {
    if criteria.tech_stack.is_empty() {
        return 0;
    }
    let tags = posting
        .tech_tags
        .iter()
        .map(|t| tokenize(t))
        .collect::<Vec<_>>();
    let hits = criteria
        .tech_stack
        .iter()
        .filter(|tech| {
            let phrase = tokenize(tech);
            tags.iter().any(|tag| *tag == phrase)
                || contains_phrase(title_tokens, &phrase)
                || contains_phrase(description_tokens, &phrase)
        })
        .count() as u32;
    hits * TECH_STACK_WEIGHT / criteria.tech_stack.len() as u32
}

fn whitelist_points(criteria: &Criteria, company: &str) -> u32 {
    if criteria
        .company_whitelist
        .iter()
        .any(|c| normalize_company(c) == company)
    {
        WHITELIST_BONUS
    } else {
        0
    }
}
