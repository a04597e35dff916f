//! XML text for the package descriptor files and documents.
//!
//! Everything here is plain string formatting with fixed indentation and
//! attribute order, so identical inputs always produce identical bytes.

use crate::epub::{ManifestItem, TocEntry};
use crate::output::DocumentMetadata;
use crate::pipeline::section::Document;

pub const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

pub const STYLESHEET: &str = "body{font-family:serif;line-height:1.5;} h1,h2,h3{font-family:sans-serif;} \
img{max-width:100%; height:auto;} code,pre{font-family:monospace;}\n";

/// Escape the five XML special characters.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn language(metadata: &DocumentMetadata) -> String {
    metadata
        .language
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(escape_xml)
        .unwrap_or_else(|| "en".to_string())
}

/// `OEBPS/content.opf`, OPF 2.0 with an NCX table of contents.
pub fn content_opf(
    metadata: &DocumentMetadata,
    identifier: &str,
    items: &[ManifestItem],
    spine: &[String],
    cover_image_id: Option<&str>,
) -> String {
    let mut opf = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="bookid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
"#,
    );
    opf.push_str(&format!("    <dc:title>{}</dc:title>\n", escape_xml(&metadata.title)));
    for author in &metadata.authors {
        opf.push_str(&format!(
            "    <dc:creator opf:role=\"aut\">{}</dc:creator>\n",
            escape_xml(author)
        ));
    }
    opf.push_str(&format!(
        "    <dc:identifier id=\"bookid\">{}</dc:identifier>\n",
        escape_xml(identifier)
    ));
    opf.push_str(&format!("    <dc:language>{}</dc:language>\n", language(metadata)));
    if let Some(publisher) = &metadata.publisher {
        opf.push_str(&format!("    <dc:publisher>{}</dc:publisher>\n", escape_xml(publisher)));
    }
    if let Some(date) = &metadata.date {
        opf.push_str(&format!("    <dc:date>{}</dc:date>\n", escape_xml(date)));
    }
    if let Some(description) = &metadata.description {
        opf.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            escape_xml(description)
        ));
    }
    for subject in &metadata.subjects {
        opf.push_str(&format!("    <dc:subject>{}</dc:subject>\n", escape_xml(subject)));
    }
    if let Some(id) = cover_image_id {
        opf.push_str(&format!("    <meta name=\"cover\" content=\"{}\"/>\n", id));
    }
    opf.push_str("  </metadata>\n  <manifest>\n");
    for item in items {
        opf.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n",
            item.id,
            escape_xml(&item.href),
            item.media_type
        ));
    }
    opf.push_str("  </manifest>\n  <spine toc=\"ncx\">\n");
    for idref in spine {
        opf.push_str(&format!("    <itemref idref=\"{}\"/>\n", idref));
    }
    opf.push_str("  </spine>\n");
    if cover_image_id.is_some() {
        opf.push_str(
            "  <guide>\n    <reference type=\"cover\" title=\"Cover\" href=\"cover.xhtml\"/>\n  </guide>\n",
        );
    }
    opf.push_str("</package>\n");
    opf
}

/// `OEBPS/toc.ncx`, the EPUB 2 navigation map.
pub fn toc_ncx(identifier: &str, title: &str, toc: &[TocEntry]) -> String {
    let mut ncx = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
"#,
    );
    ncx.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{}\"/>\n",
        escape_xml(identifier)
    ));
    ncx.push_str(
        "    <meta name=\"dtb:depth\" content=\"1\"/>\n    \
<meta name=\"dtb:totalPageCount\" content=\"0\"/>\n    \
<meta name=\"dtb:maxPageNumber\" content=\"0\"/>\n  </head>\n",
    );
    ncx.push_str(&format!(
        "  <docTitle>\n    <text>{}</text>\n  </docTitle>\n  <navMap>\n",
        escape_xml(title)
    ));
    for (i, entry) in toc.iter().enumerate() {
        let n = i + 1;
        ncx.push_str(&format!(
            "    <navPoint id=\"navPoint-{n}\" playOrder=\"{n}\">\n      \
<navLabel>\n        <text>{}</text>\n      </navLabel>\n      \
<content src=\"{}\"/>\n    </navPoint>\n",
            escape_xml(&entry.title),
            escape_xml(&entry.href)
        ));
    }
    ncx.push_str("  </navMap>\n</ncx>\n");
    ncx
}

/// `OEBPS/nav.xhtml`, the EPUB 3 navigation document.
pub fn nav_xhtml(metadata: &DocumentMetadata, toc: &[TocEntry]) -> String {
    let lang = language(metadata);
    let title = escape_xml(&metadata.title);
    let mut nav = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<!DOCTYPE html>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" xml:lang=\"{lang}\" lang=\"{lang}\">\n\
<head>\n  <meta charset=\"utf-8\"/>\n  <title>{title}</title>\n</head>\n\
<body>\n  <nav epub:type=\"toc\" id=\"toc\">\n    <h2>{title}</h2>\n    <ol>\n"
    );
    for entry in toc {
        nav.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            escape_xml(&entry.href),
            escape_xml(&entry.title)
        ));
    }
    nav.push_str("    </ol>\n  </nav>\n</body>\n</html>\n");
    nav
}

/// Doctype for OPF 2.0 content documents.
const XHTML11_DOCTYPE: &str =
    "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.1//EN\" \"http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd\">";
const XHTML_CONTENT_TYPE: &str =
    "<meta http-equiv=\"Content-Type\" content=\"application/xhtml+xml; charset=utf-8\"/>";

/// A section's content document.
pub fn content_xhtml(doc: &Document, metadata: &DocumentMetadata) -> String {
    let lang = language(metadata);
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
{doctype}\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"{lang}\">\n\
<head>\n  {content_type}\n  <title>{}</title>\n  \
<link rel=\"stylesheet\" type=\"text/css\" href=\"styles.css\"/>\n</head>\n\
<body>\n{}\n</body>\n</html>\n",
        escape_xml(&doc.title),
        doc.body,
        doctype = XHTML11_DOCTYPE,
        content_type = XHTML_CONTENT_TYPE,
    )
}

/// `OEBPS/cover.xhtml`, a single full-page image.
pub fn cover_xhtml(image_href: &str, metadata: &DocumentMetadata) -> String {
    let lang = language(metadata);
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
{doctype}\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"{lang}\">\n\
<head>\n  {content_type}\n  <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\"/>\n  \
<title>Cover</title>\n  \
<style type=\"text/css\">body{{margin:0;padding:0;text-align:center;}} img{{max-width:100%;max-height:100%;}}</style>\n\
</head>\n\
<body>\n  <div class=\"cover\"><img src=\"{}\" alt=\"Cover\"/></div>\n</body>\n</html>\n",
        escape_xml(image_href),
        doctype = XHTML11_DOCTYPE,
        content_type = XHTML_CONTENT_TYPE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toc() -> Vec<TocEntry> {
        vec![
            TocEntry {
                title: "Introduction".into(),
                href: "introduction.xhtml".into(),
            },
            TocEntry {
                title: "2 Results & Notes".into(),
                href: "results-notes.xhtml".into(),
            },
        ]
    }

    #[test]
    fn escape() {
        assert_eq!(escape_xml(r#"<a href="x">Tom & Jerry's</a>"#), "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&apos;s&lt;/a&gt;");
    }

    #[test]
    fn ncx_uses_play_order_and_keeps_numbering() {
        let ncx = toc_ncx("urn:uuid:x", "Book", &toc());
        assert!(ncx.contains("playOrder=\"1\""));
        assert!(ncx.contains("playOrder=\"2\""));
        assert!(ncx.contains("<text>2 Results &amp; Notes</text>"));
        assert!(ncx.contains("<content src=\"results-notes.xhtml\"/>"));
    }

    #[test]
    fn nav_lists_entries_in_order() {
        let nav = nav_xhtml(&DocumentMetadata::titled("Book"), &toc());
        let a = nav.find("introduction.xhtml").unwrap();
        let b = nav.find("results-notes.xhtml").unwrap();
        assert!(a < b);
        assert!(nav.contains("epub:type=\"toc\""));
        assert!(nav.contains("xml:lang=\"en\""));
    }

    #[test]
    fn opf_cover_metadata_only_with_cover() {
        let meta = DocumentMetadata {
            title: "T".into(),
            authors: vec!["A. Author".into()],
            language: Some("fr".into()),
            ..Default::default()
        };
        let items = vec![ManifestItem::new("css", "styles.css", "text/css")];
        let spine = vec!["sec01".to_string()];
        let without = content_opf(&meta, "urn:uuid:1", &items, &spine, None);
        assert!(!without.contains("name=\"cover\""));
        assert!(!without.contains("<guide>"));
        assert!(without.contains("<dc:language>fr</dc:language>"));
        assert!(without.contains("<spine toc=\"ncx\">"));

        let with = content_opf(&meta, "urn:uuid:1", &items, &spine, Some("cover-image"));
        assert!(with.contains("<meta name=\"cover\" content=\"cover-image\"/>"));
        assert!(with.contains("<reference type=\"cover\" title=\"Cover\" href=\"cover.xhtml\"/>"));
    }

    #[test]
    fn cover_page_references_image() {
        let xhtml = cover_xhtml("images/cover.jpg", &DocumentMetadata::titled("T"));
        assert!(xhtml.contains("<img src=\"images/cover.jpg\" alt=\"Cover\"/>"));
        assert!(xhtml.contains("name=\"viewport\""));
        assert!(xhtml.contains(XHTML11_DOCTYPE));
        assert!(!xhtml.contains("epub:type"));
    }

    #[test]
    fn content_documents_are_xhtml_1_1() {
        let doc = Document {
            id: "sec01".into(),
            filename: "intro.xhtml".into(),
            numbering: None,
            title: "Intro & Scope".into(),
            body: "<h1>Intro &amp; Scope</h1>".into(),
            image_refs: vec![],
        };
        let xhtml = content_xhtml(&doc, &DocumentMetadata::titled("T"));
        assert!(xhtml.starts_with(&format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{XHTML11_DOCTYPE}\n")));
        assert!(xhtml.contains(XHTML_CONTENT_TYPE));
        assert!(!xhtml.contains("<meta charset"));
        assert!(xhtml.contains("<title>Intro &amp; Scope</title>"));
        assert!(xhtml.contains("xml:lang=\"en\""));
        assert!(!xhtml.contains(" lang="));
    }
}
