//! Best-effort field extraction from A1111/Forge infotext sidecars.
//!
//! The sidecar format has no escaping guarantees, so this is a tolerant
//! field-by-field extractor rather than a parser for a grammar. One bad field
//! never prevents extraction of the others.

use crate::error::ParseError;
use std::collections::BTreeMap;
use std::str::FromStr;

const NEGATIVE_LABEL: &str = "Negative prompt:";
const SETTINGS_LABEL: &str = "Steps: ";
const TEMPLATE_LABEL: &str = "Template: ";
const NEGATIVE_TEMPLATE_LABEL: &str = "Negative Template: ";

/// Describes how to find one `Key: value` entry in the settings block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub name: &'a str,
    pub open: &'a str,
    pub close: &'a str,
    pub optional: bool,
}

impl<'a> Field<'a> {
    pub const fn required(name: &'a str) -> Self {
        Self {
            name,
            open: ": ",
            close: ",",
            optional: false,
        }
    }

    pub const fn optional(name: &'a str) -> Self {
        Self {
            optional: true,
            ..Self::required(name)
        }
    }

    /// Uses a custom delimiter pair for values that contain commas.
    pub const fn delimited(self, open: &'a str, close: &'a str) -> Self {
        Self {
            open,
            close,
            ..self
        }
    }

    /// `Key: "value, with, commas"`
    pub const fn quoted(self) -> Self {
        self.delimited(": \"", "\"")
    }
}

pub const STEPS: Field<'static> = Field::required("Steps");
pub const SAMPLER: Field<'static> = Field::optional("Sampler");
pub const SCHEDULE_TYPE: Field<'static> = Field::optional("Schedule type");
pub const CFG_SCALE: Field<'static> = Field::required("CFG scale");
pub const SEED: Field<'static> = Field::required("Seed");
pub const SIZE: Field<'static> = Field::required("Size");
pub const MODEL_HASH: Field<'static> = Field::optional("Model hash");
pub const MODEL: Field<'static> = Field::optional("Model");
pub const VAE_HASH: Field<'static> = Field::optional("VAE hash");
pub const VAE: Field<'static> = Field::optional("VAE");
pub const VARIATION_SEED: Field<'static> = Field::optional("Variation seed");
pub const VARIATION_SEED_STRENGTH: Field<'static> = Field::optional("Variation seed strength");
pub const CLIP_SKIP: Field<'static> = Field::optional("Clip skip");
pub const DENOISING_STRENGTH: Field<'static> = Field::optional("Denoising strength");
pub const HIRES_UPSCALE: Field<'static> = Field::optional("Hires upscale");
pub const HIRES_STEPS: Field<'static> = Field::optional("Hires steps");
pub const HIRES_UPSCALER: Field<'static> = Field::optional("Hires upscaler");
pub const FACE_RESTORATION: Field<'static> = Field::optional("Face restoration");
pub const CUTOFF_ENABLED: Field<'static> = Field::optional("Cutoff enabled");
pub const CUTOFF_TARGETS: Field<'static> = Field::optional("Cutoff targets").delimited(": [", "]");
pub const CUTOFF_WEIGHT: Field<'static> = Field::optional("Cutoff weight");
pub const TILED_DIFFUSION: Field<'static> = Field::optional("Tiled Diffusion").delimited(": {", "}");
pub const TILED_VAE: Field<'static> = Field::optional("Tiled VAE").delimited(": {", "}");
pub const LORA_HASHES: Field<'static> = Field::optional("Lora hashes").quoted();

/// A sidecar blob split into its fixed zones.
#[derive(Debug, Clone, Default)]
pub struct SidecarText {
    pub raw: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub settings: String,
    pub template: Option<String>,
    pub negative_template: Option<String>,
}

impl SidecarText {
    /// Splits `{prompt}\nNegative prompt: {neg}\nSteps: …[\nTemplate: …]`.
    ///
    /// The prompt zones are not `key: value` fields: the positive prompt is
    /// everything before the negative label (or the settings line), and the
    /// negative prompt runs up to the settings line.
    pub fn parse(raw: &str) -> Self {
        let text = raw.replace("\r\n", "\n");

        let settings_start = line_start_of(&text, SETTINGS_LABEL);
        let (head, tail) = match settings_start {
            Some(idx) => (&text[..idx], &text[idx..]),
            None => (text.as_str(), ""),
        };

        let (prompt, negative_prompt) = match line_start_of(head, NEGATIVE_LABEL) {
            Some(idx) => (
                head[..idx].trim().to_string(),
                head[idx + NEGATIVE_LABEL.len()..].trim().to_string(),
            ),
            None => (head.trim().to_string(), String::new()),
        };

        let trailer_start = [TEMPLATE_LABEL, NEGATIVE_TEMPLATE_LABEL]
            .iter()
            .filter_map(|label| tail.find(&format!("\n{label}")))
            .min();
        let (settings, trailer) = match trailer_start {
            Some(idx) => (&tail[..idx], &tail[idx + 1..]),
            None => (tail, ""),
        };
        let (template, negative_template) = parse_template_lines(trailer);

        Self {
            raw: raw.to_string(),
            prompt,
            negative_prompt,
            settings: settings.trim().to_string(),
            template,
            negative_template,
        }
    }

    /// Extracts the raw text of a field from the settings block.
    pub fn get(&self, field: &Field<'_>) -> Result<Option<String>, ParseError> {
        match extract_between(&self.settings, field) {
            Some(value) => Ok(Some(value.to_string())),
            None if field.optional => Ok(None),
            None => Err(ParseError::MissingField(field.name.to_string())),
        }
    }

    /// Extracts a field and coerces it with `FromStr`.
    pub fn number<T: FromStr>(&self, field: &Field<'_>) -> Result<Option<T>, ParseError> {
        let Some(value) = self.get(field)? else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|_| not_a_number(field, &value))
    }

    /// Like [`Self::number`] for floats, rejecting NaN and infinities.
    pub fn float(&self, field: &Field<'_>) -> Result<Option<f64>, ParseError> {
        match self.number::<f64>(field)? {
            Some(value) if !value.is_finite() => {
                Err(not_a_number(field, &value.to_string()))
            }
            other => Ok(other),
        }
    }

    pub fn flag(&self, field: &Field<'_>) -> Result<Option<bool>, ParseError> {
        let Some(value) = self.get(field)? else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ParseError::Malformed {
                field: field.name.to_string(),
                reason: format!("expected True/False, got {value:?}"),
            }),
        }
    }

    /// `Size: 512x768`
    pub fn size(&self) -> Result<(u32, u32), ParseError> {
        let value = self.get(&SIZE)?.unwrap_or_default();
        let (width, height) = value.split_once('x').ok_or_else(|| ParseError::Malformed {
            field: SIZE.name.to_string(),
            reason: format!("expected WxH, got {value:?}"),
        })?;
        let width = width
            .trim()
            .parse::<u32>()
            .map_err(|_| not_a_number(&SIZE, width))?;
        let height = height
            .trim()
            .parse::<u32>()
            .map_err(|_| not_a_number(&SIZE, height))?;
        Ok((width, height))
    }

    /// Reads a Python-style list such as `['red hair', 'blue eyes']`.
    ///
    /// Single quotes are normalized to double quotes before JSON parsing; when
    /// that still fails (e.g. an apostrophe inside an item) the list is split
    /// by hand.
    pub fn list(&self, field: &Field<'_>) -> Result<Option<Vec<String>>, ParseError> {
        let Some(inner) = self.get(field)? else {
            return Ok(None);
        };
        let normalized = format!("[{}]", inner.replace('\'', "\""));
        if let Ok(items) = serde_json::from_str::<Vec<String>>(&normalized) {
            return Ok(Some(items));
        }

        let items = inner
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').trim())
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Some(items))
    }

    /// Reads a `Key: {"a": 1, ...}` dictionary field as a JSON object.
    pub fn dict(
        &self,
        field: &Field<'_>,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, ParseError> {
        let Some(inner) = self.get(field)? else {
            return Ok(None);
        };
        let normalized = format!("{{{}}}", inner.replace('\'', "\""));
        serde_json::from_str(&normalized)
            .map(Some)
            .map_err(|error| ParseError::Malformed {
                field: field.name.to_string(),
                reason: error.to_string(),
            })
    }

    /// All `Key: value` pairs of the settings block, keyed by name.
    pub fn pairs(&self) -> BTreeMap<String, String> {
        split_parameter_pairs(&self.settings)
            .into_iter()
            .filter_map(|pair| {
                let (key, value) = pair.split_once(':')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

fn not_a_number(field: &Field<'_>, value: &str) -> ParseError {
    ParseError::NotANumber {
        field: field.name.to_string(),
        value: value.to_string(),
    }
}

/// Index of `label` when it begins a line (or the text).
fn line_start_of(text: &str, label: &str) -> Option<usize> {
    if text.starts_with(label) {
        return Some(0);
    }
    text.find(&format!("\n{label}")).map(|idx| idx + 1)
}

fn parse_template_lines(trailer: &str) -> (Option<String>, Option<String>) {
    let mut template: Option<String> = None;
    let mut negative: Option<String> = None;
    let mut current: Option<&mut Option<String>> = None;

    for line in trailer.lines() {
        if let Some(rest) = line.strip_prefix(NEGATIVE_TEMPLATE_LABEL) {
            negative = Some(rest.trim_end().to_string());
            current = Some(&mut negative);
        } else if let Some(rest) = line.strip_prefix(TEMPLATE_LABEL) {
            template = Some(rest.trim_end().to_string());
            current = Some(&mut template);
        } else if let Some(Some(value)) = current.as_deref_mut() {
            // continuation of a multi-line template
            value.push('\n');
            value.push_str(line.trim_end());
        }
    }

    (template, negative)
}

/// Returns the value between `"<name><open>"` and the next `close`.
///
/// The label only matches at a key boundary (start of block, or after a
/// comma or line break) so `CFG scale` never matches inside `Hires CFG scale`.
fn extract_between<'t>(block: &'t str, field: &Field<'_>) -> Option<&'t str> {
    let label = format!("{}{}", field.name, field.open);
    let mut search_from = 0usize;

    while let Some(found) = block[search_from..].find(&label) {
        let idx = search_from + found;
        let before = block[..idx].trim_end_matches([' ', '\t']);
        let at_boundary = before.is_empty() || before.ends_with(',') || before.ends_with('\n');
        if at_boundary {
            let start = idx + label.len();
            let rest = &block[start..];
            let mut end = rest.find(field.close).unwrap_or(rest.len());
            if let Some(newline) = rest[..end].find('\n') {
                end = newline;
            }
            return Some(rest[..end].trim_matches(|c: char| c.is_whitespace()));
        }
        search_from = idx + label.len();
    }

    None
}

/// Splits parameter pairs on commas that look like true `Key: Value` boundaries.
///
/// We only split when `,` is followed by a key that starts with an uppercase
/// ASCII letter, has a valid key body and a trailing `:`. This keeps values
/// such as `Lora hashes: "a: 111, b: 222"` or `Cutoff targets: ['a', 'b']`
/// in one piece.
fn split_parameter_pairs(block: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut start = 0usize;
    let mut in_quotes = false;
    let mut depth = 0i32;

    for (idx, ch) in block.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '[' | '{' if !in_quotes => depth += 1,
            ']' | '}' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth <= 0 && is_key_boundary_after_comma(block, idx + 1) => {
                let segment = block[start..idx].trim();
                if !segment.is_empty() {
                    pairs.push(segment.to_string());
                }
                start = idx + 1;
            }
            _ => {}
        }
    }

    let tail = block[start..].trim();
    if !tail.is_empty() {
        pairs.push(tail.to_string());
    }

    pairs
}

fn is_key_boundary_after_comma(block: &str, from_idx: usize) -> bool {
    let bytes = block.as_bytes();
    let mut idx = from_idx;

    while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= bytes.len() || !bytes[idx].is_ascii_uppercase() {
        return false;
    }

    let key_start = idx;
    while idx < bytes.len() {
        let b = bytes[idx];
        if b == b':' {
            return idx > key_start;
        }
        if b == b',' || b == b'\n' || b == b'\r' {
            return false;
        }

        let is_valid_key_char = b.is_ascii_alphanumeric()
            || matches!(b, b' ' | b'_' | b'-' | b'/' | b'.' | b'(' | b')');
        if !is_valid_key_char {
            return false;
        }
        idx += 1;
    }

    false
}
