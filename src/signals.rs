//! Signal extraction from pointer-down/click pairs.
//!
//! The extractor never looks at the event target alone: it hit-tests the full
//! element stack at the event coordinates so transparent or overlapping layers
//! are visible to the scorer. Element snapshots come from a [`HitTestSurface`]
//! and may be partial (detached nodes have no rect or style); extraction
//! degrades to absent fields instead of failing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::scoring::{ClickContext, ElementHint, InputModality, Rect, Viewport, OVERLAY_COVERAGE};

/// Cap applied to text and attribute lengths.
pub const NAME_LENGTH_CAP: u32 = 80;

/// Stable identifier of a DOM node within one page.
pub type NodeId = u64;

/// Computed style values as reported by the platform.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComputedStyle {
    /// Opacity as a CSS string.
    pub opacity: Option<String>,
    /// display.
    pub display: Option<String>,
    /// visibility.
    pub visibility: Option<String>,
    /// pointer-events.
    pub pointer_events: Option<String>,
    /// position.
    pub position: Option<String>,
    /// z-index as a CSS string (`auto` or an integer).
    pub z_index: Option<String>,
    /// cursor.
    pub cursor: Option<String>,
}

/// Raw element snapshot supplied by the hit-test surface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DomElement {
    /// Node identity, used to detect retargeting.
    pub node_id: NodeId,
    /// Tag name.
    pub tag: String,
    /// Attributes by lower-case name.
    pub attributes: BTreeMap<String, String>,
    /// Text content, if readable.
    pub text_content: Option<String>,
    /// Bounding rectangle; `None` once the node is detached.
    pub rect: Option<Rect>,
    /// Computed style; `None` once the node is detached.
    pub style: Option<ComputedStyle>,
}

impl DomElement {
    /// Element with a tag and no attributes.
    pub fn new(node_id: NodeId, tag: impl Into<String>) -> Self {
        Self {
            node_id,
            tag: tag.into().to_uppercase(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_lowercase(), value.into());
        self
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    /// Builder-style rect setter.
    pub fn with_rect(mut self, w: f64, h: f64) -> Self {
        self.rect = Some(Rect::new(w, h));
        self
    }

    /// Builder-style style setter.
    pub fn with_style(mut self, style: ComputedStyle) -> Self {
        self.style = Some(style);
        self
    }

    /// Attribute value, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn has_non_empty_attr(&self, name: &str) -> bool {
        self.attr(name).is_some_and(|v| !v.is_empty())
    }

    /// Cheap interactivity test used on raw snapshots.
    pub fn is_interactive(&self) -> bool {
        if self.tag == "A" || self.tag == "BUTTON" {
            return true;
        }
        let role = self.attr("role").unwrap_or("").to_lowercase();
        if role == "button" || role == "link" {
            return true;
        }
        self.has_non_empty_attr("onclick")
    }
}

/// Read-only view of the live document.
pub trait HitTestSurface: Send + Sync {
    /// Current viewport size.
    fn viewport(&self) -> Viewport;

    /// All elements at a point, topmost first.
    fn elements_from_point(&self, x: f64, y: f64) -> Vec<DomElement>;

    /// Nearest ancestor-or-self anchor with an href.
    fn closest_anchor(&self, node: NodeId) -> Option<DomElement>;

    /// Document base URL used to resolve relative destinations.
    fn base_url(&self) -> Option<Url>;
}

/// Coordinates and buttons of a pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PointerEventData {
    /// Client x.
    pub x: f64,
    /// Client y.
    pub y: f64,
    /// Button index (0 primary, 1 middle).
    pub button: i16,
    /// Ctrl held.
    pub ctrl: bool,
    /// Shift held.
    pub shift: bool,
    /// Alt held.
    pub alt: bool,
    /// Meta held.
    pub meta: bool,
}

impl PointerEventData {
    /// Primary-button event at a point.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }

    /// Middle click or ctrl/meta modifier.
    pub fn new_tab_intent(&self) -> bool {
        self.button == 1 || self.ctrl || self.meta
    }
}

/// Click event as delivered by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClickEvent {
    /// Pointer data of the click.
    pub pointer: PointerEventData,
    /// Click count; zero for keyboard-synthesized clicks.
    pub detail: u32,
}

impl ClickEvent {
    /// Mouse click at a point.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            pointer: PointerEventData::at(x, y),
            detail: 1,
        }
    }

    /// Modality implied by the event.
    pub fn modality(&self) -> InputModality {
        if self.detail == 0 {
            InputModality::Keyboard
        } else {
            InputModality::Pointer
        }
    }
}

/// Hit-test result recorded at pointer-down.
#[derive(Debug, Clone, PartialEq)]
pub struct DownCapture {
    /// Capture time.
    pub ts: u64,
    /// Pointer data.
    pub pointer: PointerEventData,
    /// Element stack, topmost first.
    pub stack: Vec<DomElement>,
}

impl DownCapture {
    /// Topmost element.
    pub fn top(&self) -> Option<&DomElement> {
        self.stack.first()
    }
}

/// Hit-test result recorded at click.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickCapture {
    /// Capture time.
    pub ts: u64,
    /// The click event.
    pub event: ClickEvent,
    /// Element stack, topmost first.
    pub stack: Vec<DomElement>,
}

impl ClickCapture {
    /// Topmost element.
    pub fn top(&self) -> Option<&DomElement> {
        self.stack.first()
    }
}

/// Resolved destination of an href or form action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Destination {
    /// Absolute URL, or empty when unparsable.
    pub href: String,
    /// Lower-case host, or `None` when unparsable or hostless.
    pub host: Option<String>,
}

impl Destination {
    /// Whether resolution failed.
    pub fn is_empty(&self) -> bool {
        self.href.is_empty()
    }
}

/// Resolve a raw href against the document base.
///
/// Malformed input yields an empty href with no host.
pub fn resolve_destination(base: Option<&Url>, raw: &str) -> Destination {
    let raw = raw.trim();
    if raw.is_empty() {
        return Destination::default();
    }
    let parsed = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    };
    match parsed {
        Ok(url) => Destination {
            host: url.host_str().map(str::to_lowercase),
            href: url.into(),
        },
        Err(_) => Destination::default(),
    }
}

/// Record a pointer-down.
pub fn capture_pointer_down(
    surface: &dyn HitTestSurface,
    pointer: PointerEventData,
    now_ms: u64,
) -> DownCapture {
    DownCapture {
        ts: now_ms,
        pointer,
        stack: surface.elements_from_point(pointer.x, pointer.y),
    }
}

/// Record a click.
pub fn capture_click(surface: &dyn HitTestSurface, event: ClickEvent, now_ms: u64) -> ClickCapture {
    ClickCapture {
        ts: now_ms,
        event,
        stack: surface.elements_from_point(event.pointer.x, event.pointer.y),
    }
}

fn capped_text_length(text: Option<&str>) -> u32 {
    let Some(text) = text else {
        return 0;
    };
    let count = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .take(NAME_LENGTH_CAP as usize)
        .count();
    u32::try_from(count).unwrap_or(NAME_LENGTH_CAP)
}

fn capped_attr_length(el: &DomElement, name: &str) -> u32 {
    let len = el.attr(name).map(|v| v.chars().count()).unwrap_or(0);
    u32::try_from(len).unwrap_or(u32::MAX).min(NAME_LENGTH_CAP)
}

fn parse_z_index(raw: Option<&str>) -> Option<i32> {
    let raw = raw?.trim();
    if raw.eq_ignore_ascii_case("auto") {
        return None;
    }
    raw.parse().ok()
}

/// Build an [`ElementHint`] from a raw snapshot.
pub fn element_hint(el: &DomElement, want_rect: bool, want_style: bool) -> ElementHint {
    let mut hint = ElementHint {
        tag: el.tag.to_uppercase(),
        role: el.attr("role").map(str::to_string),
        has_on_click: el.has_non_empty_attr("onclick"),
        text_length: capped_text_length(el.text_content.as_deref()),
        aria_label_length: capped_attr_length(el, "aria-label"),
        title_length: capped_attr_length(el, "title"),
        target_blank: hint_target_blank(el),
        ..Default::default()
    };

    if want_rect {
        hint.rect = el.rect;
    }

    if want_style {
        if let Some(style) = &el.style {
            hint.opacity = style.opacity.as_deref().and_then(|o| o.trim().parse().ok());
            hint.display = style.display.clone();
            hint.visibility = style.visibility.clone();
            hint.pointer_events = style.pointer_events.clone();
            hint.position = style.position.clone();
            hint.z_index = parse_z_index(style.z_index.as_deref());
            hint.cursor = style.cursor.clone();
        }
    }

    hint
}

fn hint_target_blank(el: &DomElement) -> bool {
    el.tag == "A" && el.attr("target") == Some("_blank")
}

fn first_underlying_candidate<'a>(
    stack: &'a [DomElement],
    top: &DomElement,
) -> Option<&'a DomElement> {
    stack
        .iter()
        .filter(|el| el.node_id != top.node_id)
        .find(|el| el.is_interactive())
}

fn detect_legit_modal_backdrop(top: &DomElement, stack: &[DomElement], viewport: &Viewport) -> bool {
    let Some(rect) = top.rect else {
        return false;
    };
    if viewport.area() <= 0.0 || rect.area() / viewport.area() < OVERLAY_COVERAGE {
        return false;
    }
    if top.is_interactive() {
        return false;
    }
    stack
        .iter()
        .filter(|el| el.node_id != top.node_id)
        .any(|el| {
            el.attr("role").is_some_and(|r| r.eq_ignore_ascii_case("dialog"))
                || el.attr("aria-modal").is_some_and(|m| m.eq_ignore_ascii_case("true"))
        })
}

/// Assemble the scorer input from a click and the preceding pointer-down.
pub fn build_click_context(
    viewport: Viewport,
    down: Option<&DownCapture>,
    click: &ClickCapture,
) -> ClickContext {
    let down_top = down.and_then(DownCapture::top);
    let click_top = click.top();

    let retargeted = match (down_top, click_top) {
        (Some(d), Some(c)) => d.node_id != c.node_id,
        _ => false,
    };

    let explicit_new_tab_intent = match down {
        Some(d) => d.pointer.new_tab_intent(),
        None => click.event.pointer.new_tab_intent(),
    };

    let Some(top_el) = click_top.or(down_top) else {
        return ClickContext {
            viewport,
            input: click.event.modality(),
            top: ElementHint::new("HTML"),
            retargeted,
            explicit_new_tab_intent,
            ..Default::default()
        };
    };

    let underlying = first_underlying_candidate(&click.stack, top_el)
        .map(|el| element_hint(el, true, false));

    ClickContext {
        viewport,
        input: click.event.modality(),
        top: element_hint(top_el, true, true),
        underlying,
        retargeted,
        explicit_new_tab_intent,
        is_legit_modal_backdrop: detect_legit_modal_backdrop(top_el, &click.stack, &viewport),
    }
}

/// Anchor resolved for a click, with its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorTarget {
    /// Snapshot of the anchor.
    pub hint: ElementHint,
    /// Resolved destination.
    pub destination: Destination,
}

impl AnchorTarget {
    /// Anchor that will open a new browsing context.
    pub fn opens_new_tab(&self) -> bool {
        self.hint.target_blank && !self.destination.is_empty()
    }
}

/// Find the anchor a click lands on, if any.
pub fn resolve_anchor(surface: &dyn HitTestSurface, click: &ClickCapture) -> Option<AnchorTarget> {
    let top = click.top()?;
    let anchor = surface.closest_anchor(top.node_id)?;
    let href = anchor.attr("href").unwrap_or("");
    let base = surface.base_url();
    Some(AnchorTarget {
        hint: element_hint(&anchor, true, true),
        destination: resolve_destination(base.as_ref(), href),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSurface {
        stack: Vec<DomElement>,
        anchor: Option<DomElement>,
    }

    impl HitTestSurface for StaticSurface {
        fn viewport(&self) -> Viewport {
            Rect::new(1000.0, 800.0)
        }

        fn elements_from_point(&self, _x: f64, _y: f64) -> Vec<DomElement> {
            self.stack.clone()
        }

        fn closest_anchor(&self, _node: NodeId) -> Option<DomElement> {
            self.anchor.clone()
        }

        fn base_url(&self) -> Option<Url> {
            Url::parse("https://news.example/articles/1").ok()
        }
    }

    fn link() -> DomElement {
        DomElement::new(2, "a")
            .with_attr("href", "/next")
            .with_text("Read more")
            .with_rect(120.0, 20.0)
    }

    #[test]
    fn test_resolve_relative_destination() {
        let base = Url::parse("https://news.example/articles/1").unwrap();
        let dest = resolve_destination(Some(&base), "/next?page=2");
        assert_eq!(dest.href, "https://news.example/next?page=2");
        assert_eq!(dest.host.as_deref(), Some("news.example"));
    }

    #[test]
    fn test_malformed_destination_degrades() {
        let dest = resolve_destination(None, "http://[::1");
        assert!(dest.is_empty());
        assert_eq!(dest.host, None);
        assert_eq!(resolve_destination(None, "   "), Destination::default());
    }

    #[test]
    fn test_element_hint_caps_and_parses_style() {
        let el = DomElement::new(1, "div")
            .with_text(" a  b\n".repeat(100))
            .with_attr("aria-label", "x".repeat(200))
            .with_attr("onclick", "go()")
            .with_style(ComputedStyle {
                opacity: Some("0.01".into()),
                z_index: Some("auto".into()),
                position: Some("fixed".into()),
                ..Default::default()
            });
        let hint = element_hint(&el, true, true);
        assert_eq!(hint.text_length, NAME_LENGTH_CAP);
        assert_eq!(hint.aria_label_length, NAME_LENGTH_CAP);
        assert!(hint.has_on_click);
        assert_eq!(hint.opacity, Some(0.01));
        assert_eq!(hint.z_index, None);
        assert_eq!(hint.rect, None);
    }

    #[test]
    fn test_detached_element_degrades_to_absent_fields() {
        let hint = element_hint(&DomElement::new(9, "span"), true, true);
        assert_eq!(hint.rect, None);
        assert_eq!(hint.opacity, None);
        assert_eq!(hint.cursor, None);
    }

    #[test]
    fn test_context_sees_through_overlay() {
        let overlay = DomElement::new(1, "div").with_rect(1000.0, 800.0);
        let surface = StaticSurface {
            stack: vec![overlay, link()],
            anchor: None,
        };
        let down = capture_pointer_down(&surface, PointerEventData::at(10.0, 10.0), 0);
        let click = capture_click(&surface, ClickEvent::at(10.0, 10.0), 5);
        let ctx = build_click_context(surface.viewport(), Some(&down), &click);

        assert!(!ctx.retargeted);
        assert_eq!(ctx.top.tag, "DIV");
        let under = ctx.underlying.expect("link beneath overlay");
        assert_eq!(under.tag, "A");
        assert_eq!(under.text_length, 8);
    }

    #[test]
    fn test_retargeting_detected() {
        let surface = StaticSurface {
            stack: vec![link()],
            anchor: None,
        };
        let down = DownCapture {
            ts: 0,
            pointer: PointerEventData {
                ctrl: true,
                ..PointerEventData::at(1.0, 1.0)
            },
            stack: vec![DomElement::new(77, "div")],
        };
        let click = capture_click(&surface, ClickEvent::at(1.0, 1.0), 3);
        let ctx = build_click_context(surface.viewport(), Some(&down), &click);
        assert!(ctx.retargeted);
        assert!(ctx.explicit_new_tab_intent);
    }

    #[test]
    fn test_modal_backdrop_detection() {
        let backdrop = DomElement::new(1, "div").with_rect(1000.0, 800.0);
        let dialog = DomElement::new(2, "div").with_attr("aria-modal", "true");
        let surface = StaticSurface {
            stack: vec![backdrop, dialog],
            anchor: None,
        };
        let click = capture_click(&surface, ClickEvent::at(5.0, 5.0), 0);
        let ctx = build_click_context(surface.viewport(), None, &click);
        assert!(ctx.is_legit_modal_backdrop);
    }

    #[test]
    fn test_empty_stack_yields_document_context() {
        let surface = StaticSurface {
            stack: Vec::new(),
            anchor: None,
        };
        let click = capture_click(&surface, ClickEvent::at(5.0, 5.0), 0);
        let ctx = build_click_context(surface.viewport(), None, &click);
        assert_eq!(ctx.top.tag, "HTML");
        assert!(ctx.underlying.is_none());
    }

    #[test]
    fn test_keyboard_click_modality() {
        let event = ClickEvent {
            detail: 0,
            ..ClickEvent::at(0.0, 0.0)
        };
        assert_eq!(event.modality(), InputModality::Keyboard);
        assert_eq!(ClickEvent::at(0.0, 0.0).modality(), InputModality::Pointer);
    }

    #[test]
    fn test_resolve_blank_anchor() {
        let anchor = link().with_attr("target", "_blank");
        let surface = StaticSurface {
            stack: vec![anchor.clone()],
            anchor: Some(anchor),
        };
        let click = capture_click(&surface, ClickEvent::at(5.0, 5.0), 0);
        let target = resolve_anchor(&surface, &click).expect("anchor");
        assert!(target.opens_new_tab());
        assert_eq!(target.destination.href, "https://news.example/next");
    }
}
