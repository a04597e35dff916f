//! Prompts for the structuring service.
//!
//! The system prompt sets the editorial rules once; each request then carries
//! a short instruction naming the JSON shape it expects back. Keeping the
//! shapes here, next to each other, makes it easy to check them against the
//! parsers in [`crate::structuring::json`].
//!
//! Callers can override the system prompt via
//! [`crate::config::ConversionConfig::system_prompt`].

/// Default system prompt shared by every request.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a careful book editor. You read a whole PDF and restructure it into an e-book.

Rules:
1. Preserve all text of the requested part, in reading order. Do not summarise.
2. Produce XHTML-compatible HTML fragments: <h1> for the section title, <h2>/<h3> for subsections, <p> for paragraphs, <ul>/<ol>/<li> for lists, <table> for tables, <pre><code> for code, <blockquote> for quotations.
3. Close every element. Self-close void elements (<br/>, <hr/>, <img/>).
4. Never include scripts, styles, page numbers, running headers or running footers.
5. Ignore decorative borders, rules and highlight boxes; they are not figures.
6. Answer with JSON only. No Markdown fences, no commentary."#;

/// Section kinds the outline request may use.
pub const SECTION_KINDS: &[&str] = &[
    "title",
    "copyright",
    "dedication",
    "preface",
    "foreword",
    "prologue",
    "introduction",
    "toc",
    "chapter",
    "section",
    "appendix",
    "acknowledgments",
    "epilogue",
    "afterword",
    "notes",
    "glossary",
    "bibliography",
    "index",
];

/// Instruction for the outline request.
pub fn outline_instruction() -> String {
    format!(
        "Analyze this document and return JSON with all logical sections in reading order. \
Return only JSON with shape: {{\"sections\": [{{\"index\": integer starting at 1, \
\"type\": one of {kinds}, \"title\": string, \"numbering\": string or null}}]}}. \
\"numbering\" is the label printed before the title (\"1\", \"2.3\", \"IV\", \"A\"), null when there is none; \
do not repeat it inside \"title\". \
Focus on logical structure, not pages. Do not include the section content.",
        kinds = SECTION_KINDS
            .iter()
            .map(|k| format!("'{k}'"))
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Instruction for one section's content.
pub fn section_instruction(
    order: usize,
    kind: &str,
    title: &str,
    numbering: Option<&str>,
) -> String {
    let numbering = match numbering {
        Some(n) => format!("\"{}\"", n.replace('"', "'")),
        None => "null".to_string(),
    };
    format!(
        "Extract the specified section from the document and return JSON only. \
The JSON object must include:\n\
- \"xhtml\": an HTML fragment with the full text of this section (no scripts, no <html>/<body> wrapper). \
Start with an <h1> heading carrying the numbering and title. Where a figure, chart or photograph appears, \
place <img src=\"FILENAME\" alt=\"CAPTION\"/> at that point.\n\
- \"images\": an array with one object per figure, in the order the <img> tags appear: \
{{\"box_2d\": [ymin, xmin, ymax, xmax] on a 0-1000 scale relative to the page, \
\"page_index\": 0-based page number, \"label\": caption or null, \"filename\": the FILENAME used in src}}. \
Only include real figures; never borders, separators or highlight boxes. Use [] when there are none.\n\
Section to extract: index={order}, type=\"{kind}\", title=\"{title}\", numbering={numbering}.",
        kind = kind.trim(),
        title = title.replace('"', "'"),
    )
}

/// Instruction for the bibliographic metadata request.
pub fn metadata_instruction() -> &'static str {
    "Extract bibliographic metadata for this book and return JSON only. \
Fields: title (string); authors (array of strings); isbn (string, digits/dashes, null if none); \
language (ISO 639-1 like 'en' if known); publisher (string); date (YYYY or YYYY-MM or YYYY-MM-DD); \
description (string summary); subjects (array of strings)."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_instruction_lists_kinds() {
        let s = outline_instruction();
        assert!(s.contains("'chapter'"));
        assert!(s.contains("\"sections\""));
        assert!(s.contains("numbering"));
    }

    #[test]
    fn section_instruction_quotes_context() {
        let s = section_instruction(3, "chapter", "The \"Big\" One", Some("2"));
        assert!(s.contains("index=3"));
        assert!(s.contains("title=\"The 'Big' One\""));
        assert!(s.contains("numbering=\"2\""));
        assert!(s.contains("box_2d"));
    }

    #[test]
    fn section_instruction_null_numbering() {
        let s = section_instruction(1, "preface", "Preface", None);
        assert!(s.ends_with("numbering=null."));
    }
}
