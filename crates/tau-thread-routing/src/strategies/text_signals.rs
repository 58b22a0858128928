//! Text signal extraction for the metadata and context heuristics.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

pub const DEFAULT_MAX_KEYWORDS: usize = 10;
pub const MIN_KEYWORD_CHARS: usize = 3;

const STREET_ADDRESS_PATTERN: &str = r"(?i)\b\d{1,6}\s+(?:[a-z0-9'\-]+\s+){0,4}?(?:street|st|avenue|ave|road|rd|boulevard|blvd|drive|dr|lane|ln|court|ct|way|place|pl|circle|cir|parkway|pkwy|terrace|ter|highway|hwy|trail|trl)\b\.?";

const KNOWN_CITIES: &[&str] = &[
    "durham",
    "raleigh",
    "chapel hill",
    "cary",
    "apex",
    "morrisville",
    "wake forest",
    "greensboro",
    "winston-salem",
    "charlotte",
    "asheville",
    "wilmington",
    "fayetteville",
    "atlanta",
    "austin",
    "boston",
    "chicago",
    "dallas",
    "denver",
    "houston",
    "los angeles",
    "miami",
    "nashville",
    "new york",
    "philadelphia",
    "phoenix",
    "portland",
    "richmond",
    "san diego",
    "san francisco",
    "seattle",
    "tampa",
    "washington",
];

const STATE_CODES: &[&str] = &[
    "al", "ak", "az", "ar", "ca", "co", "ct", "de", "dc", "fl", "ga", "hi", "id", "il", "in", "ia",
    "ks", "ky", "la", "me", "md", "ma", "mi", "mn", "ms", "mo", "mt", "ne", "nv", "nh", "nj", "nm",
    "ny", "nc", "nd", "oh", "ok", "or", "pa", "ri", "sc", "sd", "tn", "tx", "ut", "vt", "va", "wa",
    "wv", "wi", "wy",
];

/// State codes that are also everyday words; they need a street or city
/// alongside them to count.
const AMBIGUOUS_STATE_CODES: &[&str] = &["hi", "id", "in", "me", "oh", "ok", "or"];

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as",
    "at", "be", "been", "before", "being", "below", "between", "both", "but", "by", "can", "could",
    "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from", "get", "got",
    "had", "has", "have", "having", "he", "her", "here", "him", "his", "how", "i", "if", "in",
    "into", "is", "it", "its", "just", "me", "more", "most", "my", "no", "nor", "not", "now", "of",
    "off", "on", "once", "only", "or", "other", "our", "out", "over", "please", "same", "she",
    "should", "so", "some", "such", "than", "thanks", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "those", "through", "to", "too", "under", "until", "up",
    "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "why", "will",
    "with", "would", "you", "your",
];

fn street_address_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(STREET_ADDRESS_PATTERN).expect("street pattern compiles"))
}

fn city_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        let alternatives = KNOWN_CITIES
            .iter()
            .map(|city| regex::escape(city))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)\b(?:{alternatives})\b")).expect("city pattern compiles")
    })
}

fn state_code_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        let alternatives = STATE_CODES
            .iter()
            .map(|code| code.to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"\b(?:{alternatives})\b")).expect("state pattern compiles")
    })
}

fn stop_words() -> &'static BTreeSet<&'static str> {
    static WORDS: OnceLock<BTreeSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

/// Address-like tokens found in message text, lowercased and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSignals {
    pub street_addresses: Vec<String>,
    pub cities: Vec<String>,
    pub states: Vec<String>,
}

impl AddressSignals {
    /// State codes only match in uppercase.
    pub fn extract(text: &str) -> Self {
        let street_addresses = collect_matches(street_address_regex(), text, |raw| {
            raw.trim_end_matches('.').to_string()
        });
        let cities = collect_matches(city_regex(), text, str::to_string);
        let has_place = !street_addresses.is_empty() || !cities.is_empty();
        let states = collect_matches(state_code_regex(), text, str::to_string)
            .into_iter()
            .filter(|state| has_place || !AMBIGUOUS_STATE_CODES.contains(&state.as_str()))
            .collect();
        Self {
            street_addresses,
            cities,
            states,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.street_addresses.is_empty() && self.cities.is_empty() && self.states.is_empty()
    }

    pub fn keyword_count(&self) -> usize {
        self.street_addresses.len() + self.cities.len() + self.states.len()
    }

    /// True when `field` contains any extracted keyword. State codes only
    /// count as whole words.
    pub fn mentioned_in(&self, field: &str) -> bool {
        let field = field.to_lowercase();
        if field.trim().is_empty() {
            return false;
        }
        self.street_addresses
            .iter()
            .chain(self.cities.iter())
            .any(|keyword| field.contains(keyword.as_str()))
            || self
                .states
                .iter()
                .any(|state| contains_whole_word(&field, state))
    }

    pub fn matches_city(&self, city: &str) -> bool {
        let city = city.trim();
        !city.is_empty() && self.cities.iter().any(|known| known.eq_ignore_ascii_case(city))
    }

    pub fn matches_state(&self, state: &str) -> bool {
        let state = state.trim();
        !state.is_empty() && self.states.iter().any(|known| known.eq_ignore_ascii_case(state))
    }
}

/// Lowercased content keywords in order of first appearance.
///
/// Tokens split on whitespace, lose surrounding punctuation, and are dropped
/// when they are stop words or shorter than [`MIN_KEYWORD_CHARS`].
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = BTreeSet::new();
    let mut keywords = Vec::new();
    for raw in lowered.split_whitespace() {
        if keywords.len() >= max_keywords {
            break;
        }
        let token = raw.trim_matches(|ch: char| !ch.is_alphanumeric());
        if token.chars().count() < MIN_KEYWORD_CHARS || stop_words().contains(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            keywords.push(token.to_string());
        }
    }
    keywords
}

fn collect_matches(regex: &Regex, text: &str, shape: impl Fn(&str) -> String) -> Vec<String> {
    let mut found = Vec::new();
    for capture in regex.find_iter(text) {
        let normalized = shape(&capture.as_str().to_lowercase())
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !normalized.is_empty() && !found.contains(&normalized) {
            found.push(normalized);
        }
    }
    found
}

fn contains_whole_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|ch: char| !ch.is_alphanumeric())
        .any(|token| token == word)
}
