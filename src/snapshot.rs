use serde::{Deserialize, Serialize};

/// Default cap on the number of elements kept per capture.
pub const DEFAULT_ELEMENT_CAP: usize = 60;

const LABEL_MAX_CHARS: usize = 80;
const TEXT_BLOCK_MAX: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementRole {
    Input,
    Button,
    Link,
    Select,
}

impl ElementRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementRole::Input => "input",
            ElementRole::Button => "button",
            ElementRole::Link => "link",
            ElementRole::Select => "select",
        }
    }
}

/// One interactable element in a snapshot. The id is an index stamped onto
/// the live DOM at capture time (`data-ws-id`); it is unique within its
/// snapshot and means nothing once the next capture runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: usize,
    pub role: ElementRole,
    pub label: String,
    pub enabled: bool,
    pub in_viewport: bool,
}

/// Point-in-time structural view of the page. Built fresh every loop
/// iteration; older snapshots survive only inside step history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub elements: Vec<Element>,
    pub text_blocks: Vec<String>,
}

impl PageSnapshot {
    /// Snapshot for a page we could not read: best-known URL, nothing else.
    /// The control loop treats this as "wait and look again", not as fatal.
    pub fn empty(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            elements: Vec::new(),
            text_blocks: Vec::new(),
        }
    }

    pub fn element(&self, id: usize) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn is_blank(&self) -> bool {
        self.elements.is_empty() && self.text_blocks.is_empty()
    }

    /// Compact rendering for the decision prompt: ids, roles and labels only,
    /// never raw markup.
    pub fn render(&self) -> String {
        let mut out = format!("=== Page: {} ===\nURL: {}\n", self.title, self.url);
        if self.elements.is_empty() {
            out.push_str("No interactable elements visible (page may still be loading).\n");
        } else {
            out.push_str("Interactive elements:\n");
            for el in &self.elements {
                out.push_str(&format!("  [{}] {} \"{}\"", el.id, el.role.as_str(), el.label));
                if !el.enabled {
                    out.push_str(" (disabled)");
                }
                if !el.in_viewport {
                    out.push_str(" (off-screen)");
                }
                out.push('\n');
            }
        }
        if !self.text_blocks.is_empty() {
            out.push_str("Page text:\n");
            for text in &self.text_blocks {
                out.push_str("  - ");
                out.push_str(text);
                out.push('\n');
            }
        }
        out
    }
}

/// JavaScript evaluated in the page to harvest the structural capture.
///
/// Stamps `data-ws-id` (a running document-order index) onto each element it
/// reports, so the executor can later resolve an id back to the live node
/// with a plain attribute selector. Read-only apart from that attribute.
pub(crate) const CAPTURE_JS: &str = r#"
(() => {
  const vh = window.innerHeight;
  let id = 0;
  const elements = [];
  const texts = [];
  const seen = new Set();

  function visible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY') return false;
    const s = getComputedStyle(el);
    if (s.display === 'none' || s.visibility === 'hidden' || s.opacity === '0') return false;
    const r = el.getBoundingClientRect();
    return r.width > 0 && r.height > 0;
  }

  for (const el of document.querySelectorAll('input, textarea, select, button, a[href], [role="button"]')) {
    if (el.type === 'hidden' || !visible(el)) continue;
    const tag = el.tagName.toLowerCase();
    const r = el.getBoundingClientRect();
    let label = '';
    if (tag === 'input' || tag === 'textarea') {
      label = el.getAttribute('aria-label') || el.placeholder || el.name || el.type || '';
    } else if (tag === 'select') {
      label = el.getAttribute('aria-label') || el.name || 'select';
    } else {
      label = (el.innerText || el.textContent || el.value || el.getAttribute('aria-label') || '').trim();
    }
    el.setAttribute('data-ws-id', String(id));
    elements.push({
      id: id,
      tag: tag === 'textarea' ? 'input' : tag,
      label: label.replace(/\s+/g, ' ').slice(0, 120),
      enabled: el.disabled !== true,
      in_viewport: r.bottom > 0 && r.top < vh,
      distance: r.top >= vh ? r.top - vh : (r.bottom <= 0 ? -r.bottom : 0)
    });
    id += 1;
  }

  for (const sel of ['h1', 'h2', 'h3', 'article', 'main', 'p']) {
    for (const el of document.querySelectorAll(sel)) {
      const r = el.getBoundingClientRect();
      if (r.width <= 0 || r.height <= 0) continue;
      const t = (el.innerText || '').trim().replace(/\s+/g, ' ');
      if (t.length > 20 && t.length < 500 && !seen.has(t)) {
        seen.add(t);
        texts.push(t.slice(0, 200));
      }
    }
  }

  return JSON.stringify({
    url: window.location.href,
    title: document.title,
    elements: elements,
    texts: texts.slice(0, 20)
  });
})()
"#;

/// Wire shape produced by [`CAPTURE_JS`].
#[derive(Debug, Deserialize)]
pub(crate) struct RawCapture {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<RawElement>,
    #[serde(default)]
    pub texts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawElement {
    pub id: usize,
    pub tag: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub in_viewport: bool,
    #[serde(default)]
    pub distance: f64,
}

fn default_true() -> bool {
    true
}

fn role_for_tag(tag: &str) -> Option<ElementRole> {
    match tag {
        "input" | "textarea" => Some(ElementRole::Input),
        "button" => Some(ElementRole::Button),
        "a" => Some(ElementRole::Link),
        "select" => Some(ElementRole::Select),
        _ => None,
    }
}

/// Build a bounded snapshot from a raw capture. When the capture exceeds
/// `cap`, elements furthest off-screen and unlabeled ones go first; the
/// survivors keep their stamped ids and document order.
pub(crate) fn build_snapshot(raw: RawCapture, cap: usize, include_text: bool) -> PageSnapshot {
    let mut elements: Vec<Element> = raw
        .elements
        .iter()
        .filter_map(|e| {
            let role = role_for_tag(&e.tag)?;
            // Truncate by characters, not bytes; labels can be non-ASCII.
            let label: String = e.label.trim().chars().take(LABEL_MAX_CHARS).collect();
            Some(Element {
                id: e.id,
                role,
                label,
                enabled: e.enabled,
                in_viewport: e.in_viewport,
            })
        })
        .collect();

    if elements.len() > cap {
        let mut ranked: Vec<usize> = (0..elements.len()).collect();
        ranked.sort_by(|&a, &b| {
            let (ea, eb) = (&elements[a], &elements[b]);
            ea.label
                .is_empty()
                .cmp(&eb.label.is_empty())
                .then_with(|| eb.in_viewport.cmp(&ea.in_viewport))
                .then_with(|| {
                    distance_of(&raw.elements, ea.id)
                        .total_cmp(&distance_of(&raw.elements, eb.id))
                })
                .then_with(|| ea.id.cmp(&eb.id))
        });
        ranked.truncate(cap);
        ranked.sort_unstable();
        elements = ranked.into_iter().map(|i| elements[i].clone()).collect();
    }

    let mut text_blocks = if include_text { raw.texts } else { Vec::new() };
    text_blocks.truncate(TEXT_BLOCK_MAX);

    PageSnapshot {
        url: raw.url,
        title: raw.title,
        elements,
        text_blocks,
    }
}

fn distance_of(raw: &[RawElement], id: usize) -> f64 {
    raw.iter()
        .find(|e| e.id == id)
        .map(|e| e.distance)
        .unwrap_or(f64::MAX)
}

pub(crate) fn decode_capture(json: &str, cap: usize, include_text: bool) -> anyhow::Result<PageSnapshot> {
    let raw: RawCapture = serde_json::from_str(json)?;
    Ok(build_snapshot(raw, cap, include_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: usize, tag: &str, label: &str, in_viewport: bool, distance: f64) -> RawElement {
        RawElement {
            id,
            tag: tag.into(),
            label: label.into(),
            enabled: true,
            in_viewport,
            distance,
        }
    }

    #[test]
    fn decodes_capture_json() {
        let json = r#"{
            "url": "https://example.com",
            "title": "Example",
            "elements": [
                {"id": 0, "tag": "input", "label": "Search", "enabled": true, "in_viewport": true, "distance": 0},
                {"id": 1, "tag": "a", "label": "More information", "in_viewport": true}
            ],
            "texts": ["Example Domain is for use in illustrative examples."]
        }"#;
        let snap = decode_capture(json, DEFAULT_ELEMENT_CAP, true).unwrap();
        assert_eq!(snap.url, "https://example.com");
        assert_eq!(snap.elements.len(), 2);
        assert_eq!(snap.elements[0].role, ElementRole::Input);
        assert_eq!(snap.elements[1].role, ElementRole::Link);
        assert_eq!(snap.text_blocks.len(), 1);
        assert!(snap.element(1).is_some());
        assert!(snap.element(9).is_none());
    }

    #[test]
    fn cap_drops_offscreen_and_unlabeled_first() {
        let capture = RawCapture {
            url: "https://example.com".into(),
            title: String::new(),
            elements: vec![
                raw(0, "a", "visible link", true, 0.0),
                raw(1, "a", "far below", false, 2000.0),
                raw(2, "button", "", true, 0.0),
                raw(3, "a", "just below fold", false, 50.0),
                raw(4, "input", "query", true, 0.0),
            ],
            texts: vec![],
        };
        let snap = build_snapshot(capture, 3, false);
        let ids: Vec<usize> = snap.elements.iter().map(|e| e.id).collect();
        // Labeled in-viewport elements win, then the nearest off-screen one.
        assert_eq!(ids, vec![0, 3, 4]);
    }

    #[test]
    fn long_multibyte_label_truncates_on_character_boundary() {
        let capture = RawCapture {
            url: "https://example.com".into(),
            title: String::new(),
            elements: vec![
                raw(0, "a", &"天".repeat(30), true, 0.0),
                raw(1, "a", &"気".repeat(200), true, 0.0),
            ],
            texts: vec![],
        };
        let snap = build_snapshot(capture, DEFAULT_ELEMENT_CAP, false);
        assert_eq!(snap.elements[0].label.chars().count(), 30);
        assert_eq!(snap.elements[1].label.chars().count(), 80);
        assert_eq!(snap.elements[1].label, "気".repeat(80));
    }

    #[test]
    fn fast_mode_skips_text_blocks() {
        let capture = RawCapture {
            url: "u".into(),
            title: "t".into(),
            elements: vec![],
            texts: vec!["some paragraph long enough to keep".into()],
        };
        let snap = build_snapshot(capture, 10, false);
        assert!(snap.text_blocks.is_empty());
    }

    #[test]
    fn render_lists_ids_and_flags() {
        let snap = PageSnapshot {
            url: "https://example.com".into(),
            title: "Example".into(),
            elements: vec![
                Element {
                    id: 2,
                    role: ElementRole::Button,
                    label: "Go".into(),
                    enabled: false,
                    in_viewport: true,
                },
                Element {
                    id: 7,
                    role: ElementRole::Link,
                    label: "Next page".into(),
                    enabled: true,
                    in_viewport: false,
                },
            ],
            text_blocks: vec!["intro paragraph".into()],
        };
        let rendered = snap.render();
        assert!(rendered.contains("[2] button \"Go\" (disabled)"));
        assert!(rendered.contains("[7] link \"Next page\" (off-screen)"));
        assert!(rendered.contains("intro paragraph"));
    }

    #[test]
    fn empty_snapshot_keeps_best_known_url() {
        let snap = PageSnapshot::empty("https://example.com/loading");
        assert_eq!(snap.url, "https://example.com/loading");
        assert!(snap.is_blank());
        assert!(snap.render().contains("No interactable elements"));
    }
}
