//! JSON repair and response-shape validation.
//!
//! Model output is usually valid JSON, but not always: fences around the
//! object, a sentence of commentary before or after it, or a trailing comma
//! are all common. [`parse_value`] applies a bounded series of repairs and
//! gives up with a `Malformed` error after the last one.
//!
//! The `parse_*` functions then read the expected shape out of the value
//! leniently (key aliases, strings where numbers were expected) so a
//! cosmetically different response does not cost a retry.

use crate::error::StructuringError;
use crate::output::DocumentMetadata;
use crate::structuring::types::{ImageRegion, NormalizedBox, Outline, SectionContent, SectionRef};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Keys under which section markup may arrive, in priority order.
const MARKUP_KEYS: &[&str] = &["xhtml", "html", "content", "section_html"];

/// Parse `text` as JSON, repairing common defects.
///
/// Repairs, in order: trim, strip Markdown fences, extract the outermost
/// object or array, remove trailing commas.
pub fn parse_value(text: &str) -> Result<Value, StructuringError> {
    let trimmed = strip_fences(text.trim());
    if trimmed.is_empty() {
        return Err(StructuringError::malformed("empty response"));
    }

    let first_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let candidate = extract_outermost(trimmed).unwrap_or(trimmed);
    if candidate.len() != trimmed.len() {
        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
            debug!("Recovered JSON by trimming surrounding text");
            return Ok(v);
        }
    }

    let without_commas = remove_trailing_commas(candidate);
    if let Ok(v) = serde_json::from_str::<Value>(&without_commas) {
        debug!("Recovered JSON by removing trailing commas");
        return Ok(v);
    }

    Err(StructuringError::malformed(format!(
        "response is not valid JSON: {first_err}"
    )))
}

/// Strip a leading ```` ``` ```` / ```` ```json ```` fence and its closing fence.
pub fn strip_fences(text: &str) -> &str {
    let s = text.trim_start();
    if !s.starts_with("```") {
        return text;
    }
    match (s.find('\n'), s.rfind("```")) {
        (Some(first_nl), Some(closing)) if closing > first_nl => s[first_nl + 1..closing].trim(),
        // Opening fence with no closing fence (truncated stream).
        (Some(first_nl), _) => s[first_nl + 1..].trim(),
        _ => text,
    }
}

/// Slice from the first `{` or `[` to its matching close bracket.
///
/// Brackets inside string literals are ignored. Returns `None` when the
/// opening bracket is never closed.
pub fn extract_outermost(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let end = scan_balanced(&text[start..])?;
    Some(&text[start..start + end])
}

/// True when `text` (after fence stripping) holds a complete top-level JSON
/// object or array: brackets balance and no string literal is left open.
pub fn is_structurally_complete(text: &str) -> bool {
    let s = strip_fences(text.trim());
    match s.find(['{', '[']) {
        Some(start) => scan_balanced(&s[start..]).is_some(),
        None => false,
    }
}

/// Byte length of the balanced bracket group at the start of `s`.
fn scan_balanced(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop commas that directly precede `}` or `]`, outside string literals.
pub fn remove_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

// ── Shapes ───────────────────────────────────────────────────────────────

/// Parse the outline response: `{"sections": [...]}` or a bare array.
///
/// `order` is reassigned from position so it is strictly increasing.
pub fn parse_outline(text: &str) -> Result<Outline, StructuringError> {
    let value = parse_value(text)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("sections").or_else(|| obj.get("outline")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(StructuringError::malformed(
                    "outline response has no 'sections' array",
                ))
            }
        },
        _ => {
            return Err(StructuringError::malformed(
                "outline response is not an object or array",
            ))
        }
    };

    let mut sections = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(obj) = item else {
            warn!("Skipping outline entry that is not an object: {item}");
            continue;
        };
        let order = sections.len() + 1;
        let kind = str_field(obj, &["type", "kind"])
            .map(|k| k.to_lowercase())
            .unwrap_or_else(|| "section".to_string());
        let numbering = ["numbering", "number"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_to_string));
        let title = str_field(obj, &["title", "name"])
            .map(str::to_string)
            .unwrap_or_else(|| fallback_title(&kind, order));
        sections.push(SectionRef {
            order,
            kind,
            title,
            numbering,
        });
    }
    Ok(Outline { sections })
}

/// Parse a section-content response: `{"xhtml": ..., "images": [...]}`.
///
/// A missing or empty markup field is malformed. Image entries that cannot be
/// read are dropped with a warning; the rest of the section is kept.
pub fn parse_section(text: &str) -> Result<SectionContent, StructuringError> {
    let value = parse_value(text)?;
    let Value::Object(obj) = &value else {
        return Err(StructuringError::malformed(
            "section response is not a JSON object",
        ));
    };
    let markup = str_field(obj, MARKUP_KEYS)
        .ok_or_else(|| StructuringError::malformed("section response has no 'xhtml' field"))?
        .to_string();

    let image_regions = match obj.get("images") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match parse_region(item) {
                Ok(region) => Some(region),
                Err(reason) => {
                    warn!("Dropping image entry {}: {}", i, reason);
                    None
                }
            })
            .collect(),
        Some(other) => {
            warn!("Ignoring 'images' field that is not an array: {other}");
            Vec::new()
        }
    };

    Ok(SectionContent {
        markup,
        image_regions,
    })
}

fn parse_region(item: &Value) -> Result<ImageRegion, String> {
    let Value::Object(obj) = item else {
        return Err("not an object".into());
    };
    let raw = obj
        .get("box_2d")
        .or_else(|| obj.get("bbox"))
        .and_then(Value::as_array)
        .ok_or("missing 'box_2d'")?;
    let coords: Vec<f64> = raw.iter().filter_map(Value::as_f64).collect();
    let box_2d: [f64; 4] = coords
        .try_into()
        .map_err(|_| format!("'box_2d' needs 4 numbers, got {}", raw.len()))?;

    let page_index = obj
        .get("page_index")
        .or_else(|| obj.get("page"))
        .and_then(value_to_index)
        .ok_or("missing or invalid 'page_index'")?;

    Ok(ImageRegion {
        bbox: NormalizedBox::from_box_2d(box_2d),
        page_index,
        label: str_field(obj, &["label", "caption", "alt"]).map(str::to_string),
        filename_hint: str_field(obj, &["filename", "src"]).map(str::to_string),
    })
}

/// Parse the metadata response with the same leniency as the rest.
pub fn parse_metadata(text: &str) -> Result<DocumentMetadata, StructuringError> {
    let value = parse_value(text)?;
    let Value::Object(obj) = &value else {
        return Err(StructuringError::malformed(
            "metadata response is not a JSON object",
        ));
    };
    let owned = |keys: &[&str]| str_field(obj, keys).map(str::to_string);
    Ok(DocumentMetadata {
        title: owned(&["title", "book_title"]).unwrap_or_default(),
        authors: string_list(obj, &["authors", "author"]),
        isbn: ["isbn", "identifier"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_to_string)),
        language: owned(&["language", "lang"]),
        publisher: owned(&["publisher"]),
        date: ["date", "published", "publication_date"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_to_string)),
        description: owned(&["description", "summary"]),
        subjects: string_list(obj, &["subjects", "keywords"]),
    })
}

// ── Field helpers ────────────────────────────────────────────────────────

/// First non-blank string among `keys`.
fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        obj.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

/// A string, or an array of strings, under the first present key.
fn string_list(obj: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match obj.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return vec![s.trim().to_string()],
            Some(Value::Array(items)) if !items.is_empty() => {
                return items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_index(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn fallback_title(kind: &str, order: usize) -> String {
    if kind == "section" {
        return format!("Section {order}");
    }
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => format!("Section {order}"),
    }
}
