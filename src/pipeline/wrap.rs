//! Soft line wrapping for content documents.
//!
//! Some readers (and most diff tools) choke on the single-line paragraphs the
//! structuring service produces. Prose lines are re-flowed to at most
//! [`WRAP_WIDTH`] characters by breaking at whitespace, which XHTML treats the
//! same as a newline. That holds inside attribute values too: XML
//! normalisation reads a newline in `alt="..."` as a space. `<pre>` blocks
//! are copied byte for byte.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length of a prose line, in characters.
pub const WRAP_WIDTH: usize = 150;

static RE_PRE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<pre\b.*?(?:</pre\s*>|\z)").unwrap());

/// Wrap every prose line of `markup` to `width` characters.
///
/// A `<pre>` element is always moved onto its own line so that text sharing
/// a line with it can still be wrapped. Tokens longer than `width` with no
/// break opportunity are left intact.
pub fn wrap_markup(markup: &str, width: usize) -> String {
    let mut out = String::with_capacity(markup.len() + markup.len() / width.max(1));
    let mut last = 0;
    for m in RE_PRE.find_iter(markup) {
        let prose = &markup[last..m.start()];
        out.push_str(&wrap_prose(prose, width));
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(m.as_str());
        last = m.end();
        if markup[last..].lines().next().is_some_and(|rest| !rest.trim().is_empty()) {
            out.push('\n');
        }
    }
    out.push_str(&wrap_prose(&markup[last..], width));
    out
}

fn wrap_prose(text: &str, width: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        if line.chars().count() <= width {
            out.push_str(line);
        } else {
            out.push_str(&wrap_line(line, width).join("\n"));
        }
        if lines.peek().is_some() {
            out.push('\n');
        }
    }
    out
}

/// A run of text between two break opportunities.
struct Piece<'a> {
    text: &'a str,
    /// Separated from the previous piece by a space in the source.
    spaced: bool,
}

/// Break one over-long line greedily. Continuation lines keep the original
/// indentation unless it would eat most of the width.
fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let line = line.trim_end();
    let content = line.trim_start_matches([' ', '\t']);
    let indent = &line[..line.len() - content.len()];
    let indent = if indent.chars().count() * 2 < width { indent } else { "" };
    let indent_len = indent.chars().count();

    let mut lines = Vec::new();
    let mut current = String::from(indent);
    let mut current_len = indent_len;
    let mut empty = true;

    for piece in pieces(content) {
        if piece.text.is_empty() {
            continue;
        }
        let len = piece.text.chars().count();
        let sep = usize::from(piece.spaced && !empty);
        if !empty && current_len + sep + len > width {
            lines.push(std::mem::replace(&mut current, String::from(indent)));
            current_len = indent_len;
            empty = true;
        }
        if piece.spaced && !empty {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(piece.text);
        current_len += len;
        empty = false;
    }
    if !empty {
        lines.push(current);
    }
    lines
}

/// Split at spaces (inside quoted attribute values too) and between
/// adjacent tags.
fn pieces(s: &str) -> Vec<Piece<'_>> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut spaced = false;
    let mut in_tag = false;
    let mut quote: Option<u8> = None;

    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            } else if b == b' ' {
                out.push(Piece {
                    text: &s[start..i],
                    spaced,
                });
                start = i + 1;
                spaced = true;
            }
            continue;
        }
        match b {
            b'<' => {
                if !in_tag && i > start && bytes[i - 1] == b'>' {
                    out.push(Piece {
                        text: &s[start..i],
                        spaced,
                    });
                    start = i;
                    spaced = false;
                }
                in_tag = true;
            }
            b'>' => in_tag = false,
            b'"' | b'\'' if in_tag => quote = Some(b),
            b' ' => {
                out.push(Piece {
                    text: &s[start..i],
                    spaced,
                });
                start = i + 1;
                spaced = true;
            }
            _ => {}
        }
    }
    out.push(Piece {
        text: &s[start..],
        spaced,
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_line(s: &str) -> usize {
        s.lines().map(|l| l.chars().count()).max().unwrap_or(0)
    }

    #[test]
    fn short_lines_untouched() {
        let s = "<p>short</p>\n\n<p>also short</p>";
        assert_eq!(wrap_markup(s, WRAP_WIDTH), s);
    }

    #[test]
    fn long_paragraph_is_wrapped() {
        let words = "lorem ipsum dolor sit amet ".repeat(30);
        let s = format!("  <p>{}</p>", words.trim());
        let out = wrap_markup(&s, WRAP_WIDTH);
        assert!(max_line(&out) <= WRAP_WIDTH);
        assert!(out.lines().count() > 1);
        assert!(out.lines().all(|l| l.starts_with("  ")));
        // Only whitespace changed.
        let squash = |t: &str| t.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(squash(&out), squash(&s));
    }

    #[test]
    fn long_attribute_values_break_at_their_spaces() {
        let alt = "a quite long caption describing the figure in detail ".repeat(5);
        let alt = alt.trim();
        let s = format!(r#"<p><img src="x.png" alt="{alt}"/> Figure 1.</p>"#);
        let out = wrap_markup(&s, WRAP_WIDTH);
        assert!(max_line(&out) <= WRAP_WIDTH, "{out}");
        // The value reads back identically once newlines normalise to spaces.
        assert_eq!(out.replace('\n', " "), s);
    }

    #[test]
    fn delimiters_inside_quotes_do_not_end_the_tag() {
        let s = format!(r#"<p><img alt="x > y" src="p.png"/> {}</p>"#, "word ".repeat(40).trim());
        let out = wrap_markup(&s, 60);
        assert!(max_line(&out) <= 60, "{out}");
        assert_eq!(out.replace('\n', " "), s);
    }

    #[test]
    fn falls_back_to_tag_boundaries() {
        let cells = "<td>cell</td>".repeat(20);
        let out = wrap_markup(&cells, 50);
        assert!(max_line(&out) <= 50);
        assert_eq!(out.replace('\n', ""), cells);
    }

    #[test]
    fn unbreakable_token_is_kept() {
        let long = "x".repeat(200);
        assert_eq!(wrap_markup(&long, WRAP_WIDTH), long);
    }

    #[test]
    fn pre_blocks_are_verbatim() {
        let code = format!("<pre><code>{}\n    {}</code></pre>", "y = 1; ".repeat(40), "z ".repeat(90));
        let prose = format!("<p>{}</p>", "text ".repeat(50).trim());
        let s = format!("{prose}{code}<p>after</p>");
        let out = wrap_markup(&s, WRAP_WIDTH);
        assert!(out.contains(&code));
        let outside = out.replace(&code, "");
        assert!(max_line(&outside) <= WRAP_WIDTH);
        assert!(out.ends_with("\n<p>after</p>"));
    }

    #[test]
    fn unterminated_pre_runs_to_end() {
        let s = format!("<p>a</p>\n<pre>{}", "q ".repeat(100));
        assert_eq!(wrap_markup(&s, 20), s);
    }
}
