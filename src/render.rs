//! Textual rendering of a [`PageSnapshot`] for prompts and tool callers.

use serde::{Deserialize, Serialize};

use crate::snapshot::{truncate_chars, PageSnapshot, PageType};

pub const DEFAULT_MAX_ELEMENTS: usize = 50;

const ELEMENT_TEXT_CHARS: usize = 30;
const HREF_CHARS: usize = 50;

/// Render `snapshot` as the LLM sees it. Pure and deterministic; at most
/// `max_elements` element lines are emitted, followed by a single
/// `... and N more elements` line when truncated.
pub fn snapshot_to_text(snapshot: &PageSnapshot, max_elements: usize) -> String {
    let mut lines = vec![
        "=== Page Snapshot ===".to_string(),
        format!("URL: {}", snapshot.url),
        format!("Title: {}", snapshot.title),
        format!("Page Type: {}", snapshot.page_type),
        String::new(),
        "=== Interactive Elements ===".to_string(),
    ];

    for elem in snapshot.elements.iter().take(max_elements) {
        let mut line = format!("[{}] <{}>", elem.index, elem.tag);
        if !elem.text.is_empty() {
            line.push_str(&format!(" '{}'", truncate_chars(&elem.text, ELEMENT_TEXT_CHARS)));
        }
        if let Some(href) = &elem.href {
            line.push_str(&format!(" href='{}'", truncate_chars(href, HREF_CHARS)));
        }
        if let Some(placeholder) = &elem.placeholder {
            line.push_str(&format!(" placeholder='{placeholder}'"));
        }
        if let Some(role) = &elem.role {
            line.push_str(&format!(" role='{role}'"));
        }
        line.push_str(&format!(" | selector: {}", elem.selector));
        if elem.is_clickable {
            line.push_str(" [clickable]");
        }
        if elem.is_editable {
            line.push_str(" [editable]");
        }
        lines.push(line);
    }

    if snapshot.elements.len() > max_elements {
        lines.push(format!(
            "... and {} more elements",
            snapshot.elements.len() - max_elements
        ));
    }

    if !snapshot.forms.is_empty() {
        lines.push(String::new());
        lines.push("=== Forms ===".to_string());
        for form in &snapshot.forms {
            lines.push(format!(
                "Form {}: action={}, method={}, fields={}",
                form.index,
                form.action,
                form.method,
                form.fields.len()
            ));
        }
    }

    lines.join("\n")
}

/// Snapshot shape returned to external tool callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotExport {
    pub url: String,
    pub title: String,
    pub page_type: PageType,
    pub elements_count: usize,
    pub snapshot_text: String,
}

impl SnapshotExport {
    pub fn new(snapshot: &PageSnapshot, max_elements: usize) -> Self {
        Self {
            url: snapshot.url.clone(),
            title: snapshot.title.clone(),
            page_type: snapshot.page_type,
            elements_count: snapshot.elements.len(),
            snapshot_text: snapshot_to_text(snapshot, max_elements),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::driver::{FormDescriptor, FormField};
    use crate::snapshot::{BoundingBox, ElementInfo};

    fn element(index: usize, tag: &str, text: &str) -> ElementInfo {
        ElementInfo {
            index,
            tag: tag.to_string(),
            role: None,
            text: text.to_string(),
            href: None,
            placeholder: None,
            value: None,
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
            selector: format!("{tag}.item{index}"),
            is_clickable: tag == "a",
            is_editable: tag == "input",
            is_visible: true,
            attributes: BTreeMap::new(),
        }
    }

    fn snapshot(elements: Vec<ElementInfo>) -> PageSnapshot {
        PageSnapshot {
            url: "https://library.example.ac.kr/".to_string(),
            title: "Library".to_string(),
            elements,
            forms: vec![],
            page_type: PageType::Unknown,
            summary: String::new(),
        }
    }

    #[test]
    fn element_line_format() {
        let mut link = element(1, "a", "Login to the library portal with your student id");
        link.href = Some("/login".to_string());
        let mut input = element(2, "input", "");
        input.placeholder = Some("검색어를 입력하세요".to_string());
        input.role = Some("searchbox".to_string());

        let text = snapshot_to_text(&snapshot(vec![link, input]), DEFAULT_MAX_ELEMENTS);
        assert!(text.contains(
            "[1] <a> 'Login to the library portal wi' href='/login' | selector: a.item1 [clickable]"
        ));
        assert!(text.contains(
            "[2] <input> placeholder='검색어를 입력하세요' role='searchbox' | selector: input.item2 [editable]"
        ));
        assert!(text.starts_with("=== Page Snapshot ===\nURL: https://library.example.ac.kr/"));
        assert!(!text.contains("more elements"));
        assert!(!text.contains("=== Forms ==="));
    }

    #[test]
    fn truncation_emits_one_more_line() {
        let elements = (1..=8).map(|i| element(i, "a", "x")).collect();
        let text = snapshot_to_text(&snapshot(elements), 5);
        let more: Vec<&str> = text.lines().filter(|l| l.contains("more elements")).collect();
        assert_eq!(more, vec!["... and 3 more elements"]);
        assert!(text.contains("[5] <a>"));
        assert!(!text.contains("[6] <a>"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let snap = snapshot((1..=4).map(|i| element(i, "input", "q")).collect());
        assert_eq!(snapshot_to_text(&snap, 3), snapshot_to_text(&snap, 3));
    }

    #[test]
    fn forms_section() {
        let mut snap = snapshot(vec![]);
        snap.forms.push(FormDescriptor {
            index: 0,
            action: "/search".to_string(),
            method: "get".to_string(),
            fields: vec![FormField { tag: "input".to_string(), ..Default::default() }; 2],
        });
        let text = snapshot_to_text(&snap, 10);
        assert!(text.ends_with("=== Forms ===\nForm 0: action=/search, method=get, fields=2"));
    }

    #[test]
    fn export_counts_all_elements() {
        let snap = snapshot((1..=40).map(|i| element(i, "a", "x")).collect());
        let export = SnapshotExport::new(&snap, 30);
        assert_eq!(export.elements_count, 40);
        assert!(export.snapshot_text.contains("... and 10 more elements"));
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["page_type"], "unknown");
    }
}
