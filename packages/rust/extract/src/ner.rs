//! Capitalized-span entity recogniser.
//!
//! Multi-word runs of capitalized tokens are proposed as entities and typed
//! by gazetteer suffixes and prefixes. Deterministic and model-free.

use graphloom_shared::{EntityType, ExtractionMethod};

use crate::draft::{EntityDraft, StrategyOutput};

/// Lower-case words allowed inside a span ("Bank of England").
const CONNECTORS: &[&str] = &["of", "de", "du", "da", "del", "van", "von", "der", "la", "&"];

/// Capitalized words that open sentences rather than names.
const LEADING_STOPWORDS: &[&str] = &[
    "The", "A", "An", "In", "On", "At", "By", "For", "From", "With", "And", "But", "Or", "Of",
    "To", "This", "That", "These", "Those", "Our", "Their", "His", "Her", "Its", "We", "They",
    "He", "She", "It", "When", "While", "After", "Before", "During", "Since", "If", "As",
];

const EVENT_SUFFIXES: &[&str] = &[
    "Conference", "Summit", "Festival", "Championship", "Championships", "Olympics", "Expo",
    "Awards", "War", "Cup", "Symposium", "Workshop", "Meetup",
];

const ORG_SUFFIXES: &[&str] = &[
    "Inc", "Corp", "Corporation", "Company", "Group", "Bank", "University", "College",
    "Institute", "Foundation", "Association", "Agency", "Ministry", "Department", "Council",
    "Labs", "Laboratories", "Technologies", "Systems", "Partners", "Society", "Committee",
    "Museum", "Hospital", "School", "LLC", "Ltd", "GmbH", "Press", "Records",
];

const LOCATION_PREFIXES: &[&str] = &["Mount", "Lake", "Port", "Fort", "Saint", "Cape", "Isle"];

const LOCATION_SUFFIXES: &[&str] = &[
    "City", "River", "Island", "Islands", "County", "Street", "Avenue", "Road", "Park",
    "Valley", "Bay", "Mountains", "Province", "Republic", "Kingdom", "State", "Beach",
    "Harbor", "Harbour", "Square",
];

/// Drop sentence-opening words from the front of a span.
pub(crate) fn strip_leading_stopwords<'a, 'w>(words: &'a [&'w str]) -> &'a [&'w str] {
    let skip = words
        .iter()
        .take_while(|w| LEADING_STOPWORDS.contains(*w))
        .count();
    &words[skip..]
}

/// Recognise entities in plain text, one line at a time.
pub fn recognise(text: &str, confidence: f64) -> StrategyOutput {
    let mut out = StrategyOutput::default();
    for line in text.lines() {
        let mut span: Vec<&str> = Vec::new();
        for raw in line.split_whitespace() {
            if raw.starts_with(['(', '"', '\u{201c}']) {
                flush(&mut span, confidence, &mut out);
            }
            let word = raw.trim_matches(|c: char| !(c.is_alphanumeric() || c == '&' || c == '-'));
            let capitalized = word.chars().next().is_some_and(char::is_uppercase)
                && word.chars().count() > 1;

            if capitalized || (!span.is_empty() && CONNECTORS.contains(&word)) {
                span.push(word);
            } else {
                flush(&mut span, confidence, &mut out);
            }

            if raw.ends_with([',', '.', ';', ':', '!', '?', ')', '"', '\u{201d}']) {
                flush(&mut span, confidence, &mut out);
            }
        }
        flush(&mut span, confidence, &mut out);
    }
    out
}

fn flush(span: &mut Vec<&str>, confidence: f64, out: &mut StrategyOutput) {
    let mut words: &[&str] = strip_leading_stopwords(span);
    while let Some((last, rest)) = words.split_last() {
        if CONNECTORS.contains(last) {
            words = rest;
        } else {
            break;
        }
    }
    if words.len() >= 2 {
        let entity_type = classify(words);
        out.push_entity(
            EntityDraft::new(words.join(" "), entity_type, ExtractionMethod::Spacy, confidence)
                .with_property("label", ner_label(entity_type)),
        );
    }
    span.clear();
}

/// Type a span by its first and last words.
fn classify(words: &[&str]) -> EntityType {
    let (Some(first), Some(last)) = (words.first(), words.last()) else {
        return EntityType::Concept;
    };
    if EVENT_SUFFIXES.contains(last) {
        EntityType::Event
    } else if ORG_SUFFIXES.contains(last)
        || (ORG_SUFFIXES.contains(first) && words.get(1) == Some(&"of"))
    {
        EntityType::Organization
    } else if LOCATION_PREFIXES.contains(first) || LOCATION_SUFFIXES.contains(last) {
        EntityType::Location
    } else if words.len() <= 3 && words.iter().all(|w| is_name_word(w)) {
        EntityType::Person
    } else {
        EntityType::Concept
    }
}

/// Title-case letters only ("Jane", "Lovelace").
fn is_name_word(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next().is_some_and(char::is_uppercase)
        && chars.all(|c| c.is_lowercase() || c == '\'' || c == '-')
}

fn ner_label(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Person => "PERSON",
        EntityType::Organization => "ORG",
        EntityType::Location => "GPE",
        EntityType::Event => "EVENT",
        _ => "MISC",
    }
}
