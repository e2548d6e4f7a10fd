#![forbid(unsafe_code)]

//! Cheap in-process scans over the generated markup.

use super::{Gate, GateVerdict};
use crate::PipelineError;
use crate::codegen::templates::INDEX_HTML;
use crate::config;
use crate::model::ProjectSnapshot;
use crate::services::call_with_timeout;
use sm_core::model::Severity;
use sm_storage::FindingRow;
use std::sync::Arc;
use std::time::Duration;

fn is_markup(path: &str) -> bool {
    [".tsx", ".jsx", ".html"].iter().any(|ext| path.ends_with(ext))
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

/// Opening tags named exactly `tag`: `(offset, attributes, self_closing)`.
fn open_tags<'c>(content: &'c str, tag: &str) -> Vec<(usize, &'c str, bool)> {
    let needle = format!("<{tag}");
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(found) = content[from..].find(&needle) {
        let start = from + found;
        let after = start + needle.len();
        from = after;
        let boundary = content[after..].chars().next();
        if !boundary.is_some_and(|c| c.is_whitespace() || c == '>' || c == '/') {
            continue;
        }
        let Some(close) = content[after..].find('>') else {
            break;
        };
        let attrs = &content[after..after + close];
        let self_closing = attrs.trim_end().ends_with('/');
        out.push((start, attrs, self_closing));
    }
    out
}

fn inner_text<'c>(content: &'c str, start: usize, tag: &str) -> Option<&'c str> {
    let body_start = start + content[start..].find('>')? + 1;
    let closing = format!("</{tag}>");
    let body_len = content[body_start..].find(&closing)?;
    Some(&content[body_start..body_start + body_len])
}

fn finding(path: &str, content: &str, offset: usize, message: impl Into<String>) -> FindingRow {
    FindingRow {
        severity: Severity::Error,
        location: Some(format!("{path}:{}", line_of(content, offset))),
        message: message.into(),
    }
}

fn missing_file(path: &str) -> FindingRow {
    FindingRow {
        severity: Severity::Error,
        location: Some(path.to_string()),
        message: format!("{path} is missing"),
    }
}

/// Images without `alt`, a document without `lang`, buttons and links without accessible text.
pub struct AccessibilityGate;

impl AccessibilityGate {
    pub fn scan(snapshot: &ProjectSnapshot) -> Vec<FindingRow> {
        let mut findings = Vec::new();
        match snapshot.get(INDEX_HTML) {
            Some(html) => {
                for (offset, attrs, _) in open_tags(html, "html") {
                    if !attrs.contains("lang=") {
                        findings.push(finding(
                            INDEX_HTML,
                            html,
                            offset,
                            "<html> has no lang attribute",
                        ));
                    }
                }
            }
            None => findings.push(missing_file(INDEX_HTML)),
        }

        for (path, content) in snapshot.files.iter().filter(|(p, _)| is_markup(p)) {
            for (offset, attrs, _) in open_tags(content, "img") {
                if !attrs.contains("alt=") {
                    findings.push(finding(path, content, offset, "<img> has no alt text"));
                }
            }
            for tag in ["button", "a"] {
                for (offset, attrs, self_closing) in open_tags(content, tag) {
                    if attrs.contains("aria-label") {
                        continue;
                    }
                    let text = if self_closing {
                        None
                    } else {
                        inner_text(content, offset, tag)
                    };
                    if text.is_none_or(|t| t.trim().is_empty()) {
                        findings.push(finding(
                            path,
                            content,
                            offset,
                            format!("<{tag}> has no accessible text"),
                        ));
                    }
                }
            }
        }
        findings
    }
}

impl Gate for AccessibilityGate {
    fn run(
        &self,
        snapshot: &Arc<ProjectSnapshot>,
        deadline: Duration,
    ) -> Result<GateVerdict, PipelineError> {
        let snapshot = snapshot.clone();
        let scanned =
            call_with_timeout(config::GATE_ACCESSIBILITY, deadline, move || Ok(Self::scan(&snapshot)));
        Ok(match scanned {
            Ok(findings) => GateVerdict::from_findings(findings),
            Err(err) => GateVerdict::from_service_error(&err),
        })
    }
}

/// Document title and description, and exactly one `<h1>` per page.
pub struct SeoGate;

impl SeoGate {
    pub fn scan(snapshot: &ProjectSnapshot) -> Vec<FindingRow> {
        let mut findings = Vec::new();
        match snapshot.get(INDEX_HTML) {
            Some(html) => {
                let title = open_tags(html, "title")
                    .first()
                    .and_then(|(offset, _, _)| inner_text(html, *offset, "title"));
                if title.is_none_or(|t| t.trim().is_empty()) {
                    findings.push(FindingRow {
                        severity: Severity::Error,
                        location: Some(INDEX_HTML.to_string()),
                        message: "document has no title".to_string(),
                    });
                }
                let has_description = open_tags(html, "meta")
                    .iter()
                    .any(|(_, attrs, _)| attrs.contains("name=\"description\""));
                if !has_description {
                    findings.push(FindingRow {
                        severity: Severity::Error,
                        location: Some(INDEX_HTML.to_string()),
                        message: "document has no meta description".to_string(),
                    });
                }
            }
            None => findings.push(missing_file(INDEX_HTML)),
        }

        for (path, content) in snapshot.pages() {
            let headings = open_tags(content, "h1").len();
            if headings != 1 {
                findings.push(FindingRow {
                    severity: Severity::Error,
                    location: Some(path.to_string()),
                    message: format!("page has {headings} <h1> elements, expected 1"),
                });
            }
        }
        findings
    }
}

impl Gate for SeoGate {
    fn run(
        &self,
        snapshot: &Arc<ProjectSnapshot>,
        deadline: Duration,
    ) -> Result<GateVerdict, PipelineError> {
        let snapshot = snapshot.clone();
        let scanned =
            call_with_timeout(config::GATE_SEO, deadline, move || Ok(Self::scan(&snapshot)));
        Ok(match scanned {
            Ok(findings) => GateVerdict::from_findings(findings),
            Err(err) => GateVerdict::from_service_error(&err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(files: &[(&str, &str)]) -> ProjectSnapshot {
        ProjectSnapshot {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect::<BTreeMap<_, _>>(),
            asset_dir: None,
        }
    }

    const GOOD_HTML: &str = "<html lang=\"en\"><head><title>Shop</title>\
        <meta name=\"description\" content=\"x\" /></head></html>";

    #[test]
    fn accessibility_flags_missing_alt_and_empty_controls() {
        let snap = snapshot(&[
            (INDEX_HTML, "<html><body></body></html>"),
            (
                "src/pages/home.tsx",
                "<main>\n<img src=\"a.png\" />\n<button></button>\n<a href=\"/\">Home</a>\n<article>ok</article>\n</main>",
            ),
        ]);
        let findings = AccessibilityGate::scan(&snap);
        let messages: Vec<_> = findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(
            messages,
            [
                "<html> has no lang attribute",
                "<img> has no alt text",
                "<button> has no accessible text",
            ]
        );
        assert_eq!(findings[1].location.as_deref(), Some("src/pages/home.tsx:2"));
    }

    #[test]
    fn accessibility_accepts_labelled_markup() {
        let snap = snapshot(&[
            (INDEX_HTML, GOOD_HTML),
            (
                "src/pages/home.tsx",
                "<img src=\"a\" alt=\"\" /><button aria-label=\"Close\" /><a href=\"/\">{label}</a>",
            ),
        ]);
        assert!(AccessibilityGate::scan(&snap).is_empty());
    }

    #[test]
    fn seo_requires_single_h1_per_page() {
        let snap = snapshot(&[
            (INDEX_HTML, GOOD_HTML),
            ("src/pages/a.tsx", "<main><h1>A</h1></main>"),
            ("src/pages/b.tsx", "<main><h2>B</h2></main>"),
            ("src/pages/c.tsx", "<main><h1>C</h1><h1 className=\"x\">D</h1></main>"),
        ]);
        let findings = SeoGate::scan(&snap);
        let locations: Vec<_> = findings
            .iter()
            .filter_map(|f| f.location.as_deref())
            .collect();
        assert_eq!(locations, ["src/pages/b.tsx", "src/pages/c.tsx"]);

        let bare = snapshot(&[(INDEX_HTML, "<html lang=\"en\"><title> </title></html>")]);
        assert_eq!(SeoGate::scan(&bare).len(), 2);
    }
}
