//! Post-processing: deterministic cleanup of service-generated section markup.
//!
//! The structuring service is asked for an XHTML body fragment, but what
//! comes back is written for browsers, not for XML parsers. Common quirks:
//!
//! - the fragment wrapped in ` ```html ... ``` ` fences
//! - a full `<html><head>…</head><body>…</body></html>` document
//! - HTML void elements written as `<br>` instead of `<br/>`
//! - HTML named entities such as `&nbsp;` that XML does not define
//! - stray `&` in prose (`R&D`)
//!
//! Every one of these makes the content document unparseable and most
//! readers refuse the whole book. The rules below are cheap, pure
//! `&str → String` passes that fix the markup without touching the text.
//!
//! ## Rule Order
//!
//! Fences come off before the body is located, void elements are closed
//! before `alt` is added so the `<img/>` pattern only has one shape to match,
//! and entities are rewritten last among the structural passes so attribute
//! values added earlier are covered too.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Apply all normalization rules to the raw section markup.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Unwrap a full document to its `<body>` content
/// 4. Drop `<script>` and `<style>` elements
/// 5. Self-close void elements and drop their stray end tags
/// 6. Give every `<img/>` an `alt` attribute
/// 7. Rewrite named entities as numeric character references
/// 8. Strip invisible Unicode (zero-width spaces, BOM, …)
/// 9. Trim trailing whitespace and collapse runs of blank lines
pub fn normalize_markup(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalise_line_endings(&s);
    let s = unwrap_body(&s);
    let s = drop_script_and_style(&s);
    let s = self_close_void_elements(&s);
    let s = ensure_img_alt(&s);
    let s = normalise_entities(&s);
    let s = remove_invisible_chars(&s);
    tidy_whitespace(&s)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Unwrap full documents ────────────────────────────────────────────

static RE_BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body\b[^>]*>(.*?)(?:</body\s*>|\z)").unwrap());
static RE_PROLOGUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<\?xml[^>]*\?>|<!DOCTYPE[^>]*>|<head\b[^>]*>.*?</head\s*>|</?html\b[^>]*>").unwrap()
});

fn unwrap_body(input: &str) -> String {
    if let Some(caps) = RE_BODY.captures(input) {
        return caps[1].to_string();
    }
    RE_PROLOGUE.replace_all(input, "").to_string()
}

// ── Rule 4: Drop script and style ────────────────────────────────────────────

static RE_SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*/>|<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
        .unwrap()
});

fn drop_script_and_style(input: &str) -> String {
    RE_SCRIPT_STYLE.replace_all(input, "").to_string()
}

// ── Rule 5: Self-close void elements ─────────────────────────────────────────

const VOID_ELEMENTS: &str = "area|base|br|col|embed|hr|img|input|link|meta|param|source|track|wbr";

static RE_VOID_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r#"(?i)<({VOID_ELEMENTS})\b((?:[^>"']|"[^"]*"|'[^']*')*?)\s*/?>"#)).unwrap()
});
static RE_VOID_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)</(?:{VOID_ELEMENTS})\s*>")).unwrap());

fn self_close_void_elements(input: &str) -> String {
    let s = RE_VOID_CLOSE.replace_all(input, "");
    RE_VOID_OPEN
        .replace_all(&s, |caps: &Captures<'_>| {
            format!("<{}{}/>", caps[1].to_ascii_lowercase(), &caps[2])
        })
        .to_string()
}

// ── Rule 6: img alt ──────────────────────────────────────────────────────────

static RE_IMG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img\b((?:[^>"']|"[^"]*"|'[^']*')*?)\s*/>"#).unwrap());
static RE_ALT_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\salt\s*=").unwrap());

fn ensure_img_alt(input: &str) -> String {
    RE_IMG
        .replace_all(input, |caps: &Captures<'_>| {
            let attrs = &caps[1];
            if RE_ALT_ATTR.is_match(attrs) {
                caps[0].to_string()
            } else {
                format!("<img{} alt=\"\"/>", attrs)
            }
        })
        .to_string()
}

// ── Rule 7: Entities ─────────────────────────────────────────────────────────
//
// XML knows five named entities. Anything else the model copied from HTML
// becomes a numeric reference; names we do not know are escaped so the
// text survives literally instead of breaking the parse.

static RE_AMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(?:([A-Za-z][A-Za-z0-9]*);|(#[0-9]{1,7};|#[xX][0-9A-Fa-f]{1,6};))?").unwrap());

fn normalise_entities(input: &str) -> String {
    RE_AMP
        .replace_all(input, |caps: &Captures<'_>| {
            if caps.get(2).is_some() {
                return caps[0].to_string();
            }
            match caps.get(1).map(|m| m.as_str()) {
                Some(name @ ("amp" | "lt" | "gt" | "quot" | "apos")) => format!("&{name};"),
                Some(name) => match named_entity(name) {
                    Some(cp) => format!("&#{cp};"),
                    None => format!("&amp;{name};"),
                },
                None => "&amp;".to_string(),
            }
        })
        .to_string()
}

/// Code point for the HTML named entities that show up in practice.
fn named_entity(name: &str) -> Option<u32> {
    let cp = match name {
        "nbsp" => 160,
        "iexcl" => 161,
        "cent" => 162,
        "pound" => 163,
        "yen" => 165,
        "sect" => 167,
        "uml" => 168,
        "copy" => 169,
        "ordf" => 170,
        "laquo" => 171,
        "not" => 172,
        "shy" => 173,
        "reg" => 174,
        "deg" => 176,
        "plusmn" => 177,
        "sup2" => 178,
        "sup3" => 179,
        "micro" => 181,
        "para" => 182,
        "middot" => 183,
        "sup1" => 185,
        "raquo" => 187,
        "frac14" => 188,
        "frac12" => 189,
        "frac34" => 190,
        "iquest" => 191,
        "Auml" => 196,
        "Ccedil" => 199,
        "Eacute" => 201,
        "Ntilde" => 209,
        "Ouml" => 214,
        "times" => 215,
        "Uuml" => 220,
        "szlig" => 223,
        "agrave" => 224,
        "aacute" => 225,
        "acirc" => 226,
        "auml" => 228,
        "ccedil" => 231,
        "egrave" => 232,
        "eacute" => 233,
        "ecirc" => 234,
        "iacute" => 237,
        "ntilde" => 241,
        "oacute" => 243,
        "ocirc" => 244,
        "ouml" => 246,
        "divide" => 247,
        "uacute" => 250,
        "uuml" => 252,
        "Delta" => 916,
        "Sigma" => 931,
        "Omega" => 937,
        "alpha" => 945,
        "beta" => 946,
        "gamma" => 947,
        "delta" => 948,
        "epsilon" => 949,
        "theta" => 952,
        "lambda" => 955,
        "mu" => 956,
        "pi" => 960,
        "sigma" => 963,
        "omega" => 969,
        "ensp" => 8194,
        "emsp" => 8195,
        "thinsp" => 8201,
        "zwnj" => 8204,
        "zwj" => 8205,
        "ndash" => 8211,
        "mdash" => 8212,
        "lsquo" => 8216,
        "rsquo" => 8217,
        "sbquo" => 8218,
        "ldquo" => 8220,
        "rdquo" => 8221,
        "bdquo" => 8222,
        "dagger" => 8224,
        "Dagger" => 8225,
        "bull" => 8226,
        "hellip" => 8230,
        "permil" => 8240,
        "prime" => 8242,
        "Prime" => 8243,
        "lsaquo" => 8249,
        "rsaquo" => 8250,
        "euro" => 8364,
        "trade" => 8482,
        "larr" => 8592,
        "uarr" => 8593,
        "rarr" => 8594,
        "darr" => 8595,
        "harr" => 8596,
        "rArr" => 8658,
        "hArr" => 8660,
        "forall" => 8704,
        "part" => 8706,
        "exist" => 8707,
        "isin" => 8712,
        "sum" => 8721,
        "minus" => 8722,
        "radic" => 8730,
        "infin" => 8734,
        "asymp" => 8776,
        "ne" => 8800,
        "equiv" => 8801,
        "le" => 8804,
        "ge" => 8805,
        _ => return None,
    };
    Some(cp)
}

// ── Rule 8: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{2060}', '\u{0000}'], "")
}

// ── Rule 9: Whitespace ───────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn tidy_whitespace(input: &str) -> String {
    let trimmed = input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    RE_BLANK_LINES
        .replace_all(trimmed.trim_matches('\n'), "\n\n")
        .to_string()
}
