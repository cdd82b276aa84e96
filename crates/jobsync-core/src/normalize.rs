use thiserror::Error;
use url::Url;

use crate::{NormalizedRecord, RawRecord};

pub const TRUNCATION_MARKER: &str = "...";

const ENTITIES: [(&str, char); 6] = [
    ("&nbsp;", ' '),
    ("&amp;", '&'),
    ("&lt;", '<'),
    ("&gt;", '>'),
    ("&quot;", '"'),
    ("&#39;", '\''),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub max_description_len: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_description_len: 5000,
        }
    }
}

/// Decodes the handful of entities scraped pages commonly leak, then
/// collapses whitespace runs and trims.
pub fn clean_text(input: &str) -> String {
    decode_entities(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match ENTITIES.iter().find(|(entity, _)| tail.starts_with(entity)) {
            Some((entity, ch)) => {
                out.push(*ch);
                rest = &tail[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn truncate_description(text: String, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text;
    }
    if cap <= TRUNCATION_MARKER.len() {
        return text.chars().take(cap).collect();
    }
    let keep = cap - TRUNCATION_MARKER.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn canonical_url(raw: &str) -> String {
    let cleaned = raw.trim();
    match Url::parse(cleaned) {
        Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
            url.set_fragment(None);
            url.to_string()
        }
        _ => cleaned.to_string(),
    }
}

fn required(value: &str, field: &'static str) -> Result<String, ValidationError> {
    let cleaned = clean_text(value);
    if cleaned.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(cleaned)
    }
}

pub fn normalize(raw: &RawRecord, options: &NormalizeOptions) -> Result<NormalizedRecord, ValidationError> {
    let title = required(&raw.title, "title")?;
    let company = required(&raw.company, "company")?;
    let location = required(&raw.location, "location")?;

    Ok(NormalizedRecord {
        title,
        company,
        location,
        description: truncate_description(clean_text(&raw.description), options.max_description_len),
        salary: clean_text(&raw.salary),
        job_type: clean_text(&raw.job_type),
        requirements: clean_text(&raw.requirements),
        benefits: clean_text(&raw.benefits),
        source_url: canonical_url(&raw.source_url),
        source_name: clean_text(&raw.source_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str, company: &str, location: &str) -> RawRecord {
        RawRecord {
            title: title.into(),
            company: company.into(),
            location: location.into(),
            source_url: "https://www.pnet.co.za/jobs/123#apply".into(),
            ..Default::default()
        }
    }

    #[test]
    fn cleans_whitespace_and_entities() {
        let out = normalize(&raw("  Dev   Role ", "Acme&amp;Co", "Cape Town"), &NormalizeOptions::default())
            .unwrap();
        assert_eq!(out.title, "Dev Role");
        assert_eq!(out.company, "Acme&Co");
        assert_eq!(out.location, "Cape Town");
    }

    #[test]
    fn decodes_every_supported_entity_once() {
        assert_eq!(
            clean_text("a&nbsp;b &lt;c&gt; &quot;d&quot; &#39;e&#39;"),
            "a b <c> \"d\" 'e'"
        );
        assert_eq!(clean_text("&amp;lt;"), "&lt;");
        assert_eq!(clean_text("R&D & more"), "R&D & more");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = normalize(&raw("Dev", "  &nbsp; ", "Durban"), &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("company"));
        let err = normalize(&raw("", "Acme", "Durban"), &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("title"));
        let err = normalize(&raw("Dev", "Acme", "\n\t"), &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("location"));
    }

    #[test]
    fn long_descriptions_are_capped_with_marker() {
        let mut input = raw("Dev", "Acme", "London");
        input.description = "é".repeat(30);
        let out = normalize(&input, &NormalizeOptions { max_description_len: 10 }).unwrap();
        assert_eq!(out.description.chars().count(), 10);
        assert!(out.description.ends_with(TRUNCATION_MARKER));

        input.description = "short".into();
        let out = normalize(&input, &NormalizeOptions { max_description_len: 10 }).unwrap();
        assert_eq!(out.description, "short");
    }

    #[test]
    fn tiny_caps_never_exceed_the_limit() {
        let mut input = raw("Dev", "Acme", "London");
        input.description = "abcdef".into();
        for cap in 0..=3 {
            let out = normalize(&input, &NormalizeOptions { max_description_len: cap }).unwrap();
            assert_eq!(out.description, &"abcdef"[..cap]);
        }
        let out = normalize(&input, &NormalizeOptions { max_description_len: 4 }).unwrap();
        assert_eq!(out.description, "a...");
    }

    #[test]
    fn source_url_drops_fragment() {
        let out = normalize(&raw("Dev", "Acme", "London"), &NormalizeOptions::default()).unwrap();
        assert_eq!(out.source_url, "https://www.pnet.co.za/jobs/123");
    }

    #[test]
    fn optional_fields_default_to_empty() {
        let out = normalize(&raw("Dev", "Acme", "London"), &NormalizeOptions::default()).unwrap();
        assert!(out.salary.is_empty());
        assert!(out.benefits.is_empty());
    }
}
