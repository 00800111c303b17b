//! Regex detection of dates, honorific-prefixed persons, and legal-suffix
//! organization names.

use chrono::NaiveDate;
use regex::Regex;

use graphloom_shared::{EntityType, ExtractionMethod, PipelineError, Result};

use crate::draft::{EntityDraft, StrategyOutput};
use crate::ner::strip_leading_stopwords;

const MONTHS: &str =
    "January|February|March|April|May|June|July|August|September|October|November|December";

/// Compiled patterns, built once per coordinator.
#[derive(Debug, Clone)]
pub struct PatternSet {
    iso_date: Regex,
    month_first_date: Regex,
    day_first_date: Regex,
    titled_person: Regex,
    legal_org: Regex,
}

impl PatternSet {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| PipelineError::Extraction(format!("bad built-in pattern: {e}")))
        };
        Ok(Self {
            iso_date: compile(r"\b(\d{4})-(\d{2})-(\d{2})\b")?,
            month_first_date: compile(&format!(r"\b({MONTHS})\s+(\d{{1,2}}),?\s+(\d{{4}})\b"))?,
            day_first_date: compile(&format!(r"\b(\d{{1,2}})\s+({MONTHS})\s+(\d{{4}})\b"))?,
            titled_person: compile(
                r"\b(Mr|Mrs|Ms|Miss|Mx|Dr|Prof|Professor|Sir|Dame|Rev|Hon)\.?\s+([A-Z][a-z]+(?:-[A-Z][a-z]+)?(?:\s+[A-Z][a-z]+(?:-[A-Z][a-z]+)?){0,3})",
            )?,
            legal_org: compile(
                r"\b((?:[A-Z][A-Za-z0-9&'-]*\s+){0,4}[A-Z][A-Za-z0-9&'-]*),?\s+(Inc|Incorporated|Corp|Corporation|LLC|Ltd|Limited|GmbH|PLC|plc|LLP|AG|NV|BV|Co)\b",
            )?,
        })
    }

    /// Run every pattern over `text`.
    pub fn extract(&self, text: &str, confidence: f64) -> StrategyOutput {
        let mut out = StrategyOutput::default();
        self.dates(text, confidence, &mut out);
        self.persons(text, confidence, &mut out);
        self.organizations(text, confidence, &mut out);
        out
    }

    fn dates(&self, text: &str, confidence: f64, out: &mut StrategyOutput) {
        let mut push = |date: Option<NaiveDate>, surface: &str| {
            if let Some(date) = date {
                out.push_entity(
                    EntityDraft::new(
                        date.format("%Y-%m-%d").to_string(),
                        EntityType::Date,
                        ExtractionMethod::Pattern,
                        confidence,
                    )
                    .with_property("surface_form", surface),
                );
            }
        };

        for caps in self.iso_date.captures_iter(text) {
            let date = ymd(&caps[1], &caps[2], &caps[3]);
            push(date, &caps[0]);
        }
        for caps in self.month_first_date.captures_iter(text) {
            let date = month_number(&caps[1]).and_then(|m| ymd(&caps[3], &m, &caps[2]));
            push(date, &caps[0]);
        }
        for caps in self.day_first_date.captures_iter(text) {
            let date = month_number(&caps[2]).and_then(|m| ymd(&caps[3], &m, &caps[1]));
            push(date, &caps[0]);
        }
    }

    fn persons(&self, text: &str, confidence: f64, out: &mut StrategyOutput) {
        for caps in self.titled_person.captures_iter(text) {
            out.push_entity(
                EntityDraft::new(&caps[2], EntityType::Person, ExtractionMethod::Pattern, confidence)
                    .with_property("honorific", &caps[1]),
            );
        }
    }

    fn organizations(&self, text: &str, confidence: f64, out: &mut StrategyOutput) {
        for caps in self.legal_org.captures_iter(text) {
            let words: Vec<&str> = caps[1].split_whitespace().collect();
            let words = strip_leading_stopwords(&words);
            if words.is_empty() {
                continue;
            }
            let name = format!("{} {}", words.join(" "), &caps[2]);
            out.push_entity(
                EntityDraft::new(name, EntityType::Organization, ExtractionMethod::Pattern, confidence)
                    .with_property("legal_suffix", &caps[2]),
            );
        }
    }
}

fn month_number(name: &str) -> Option<String> {
    let index = MONTHS.split('|').position(|m| m == name)?;
    Some((index + 1).to_string())
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}
