//! Deceptiveness scoring for click gestures.
//!
//! [`score`] is a pure additive point system over a [`ClickContext`]. Each rule
//! fires at most once and contributes a [`ReasonCode`]; the total is clamped at
//! zero after all rules have run. Thresholds and the blank-anchor escape hatch
//! are mode policy and live beside the scorer, not inside it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RelayConfig;

/// Fraction of the viewport above which an element counts as an overlay.
pub const OVERLAY_COVERAGE: f64 = 0.35;
/// Opacity below which an element is treated as not rendered.
pub const INVISIBLE_OPACITY: f64 = 0.08;
/// Opacity below which a pointer cursor offers no visible affordance.
pub const NO_AFFORDANCE_OPACITY: f64 = 0.2;
/// z-index at which a positioned element is treated as a stacking overlay.
pub const HIGH_Z_INDEX: i32 = 9999;

/// Width and height of a bounding rectangle, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Width.
    pub w: f64,
    /// Height.
    pub h: f64,
}

impl Rect {
    /// Create a rectangle, clamping negative extents to zero.
    pub fn new(w: f64, h: f64) -> Self {
        Self {
            w: w.max(0.0),
            h: h.max(0.0),
        }
    }

    /// Area in square pixels.
    pub fn area(&self) -> f64 {
        self.w * self.h
    }
}

/// Viewport dimensions.
pub type Viewport = Rect;

/// Snapshot of the properties of one element that matter for scoring.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementHint {
    /// Upper-case tag name.
    pub tag: String,
    /// ARIA role attribute.
    pub role: Option<String>,
    /// Whether an inline click handler attribute is present.
    pub has_on_click: bool,
    /// Computed cursor.
    pub cursor: Option<String>,
    /// Non-whitespace text length, capped.
    pub text_length: u32,
    /// aria-label length, capped.
    pub aria_label_length: u32,
    /// title length, capped.
    pub title_length: u32,
    /// Anchor with `target="_blank"`.
    pub target_blank: bool,
    /// Bounding rectangle, absent for detached elements.
    pub rect: Option<Rect>,
    /// Computed opacity.
    pub opacity: Option<f64>,
    /// Computed visibility.
    pub visibility: Option<String>,
    /// Computed display.
    pub display: Option<String>,
    /// Computed pointer-events.
    pub pointer_events: Option<String>,
    /// Computed position.
    pub position: Option<String>,
    /// Computed z-index (`auto` reads as absent).
    pub z_index: Option<i32>,
}

impl ElementHint {
    /// Hint with only a tag name.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_uppercase(),
            ..Default::default()
        }
    }

    /// Combined accessible-name length (text, aria-label, title).
    pub fn name_length(&self) -> u32 {
        self.text_length + self.aria_label_length + self.title_length
    }

    /// Whether the element has any accessible name.
    pub fn has_name(&self) -> bool {
        self.name_length() > 0
    }

    /// Anchor or button tag, link/button role, or inline click handler.
    pub fn is_interactive(&self) -> bool {
        if self.tag == "A" || self.tag == "BUTTON" {
            return true;
        }
        let role = self.role.as_deref().unwrap_or("").to_lowercase();
        if role == "link" || role == "button" {
            return true;
        }
        self.has_on_click
    }

    /// Fraction of the viewport covered by this element.
    pub fn coverage_ratio(&self, viewport: &Viewport) -> Option<f64> {
        let rect = self.rect?;
        if viewport.w <= 0.0 || viewport.h <= 0.0 {
            return None;
        }
        Some(rect.area() / viewport.area())
    }

    /// Whether the element is actually rendered to the user.
    pub fn is_visible(&self) -> bool {
        if let Some(rect) = self.rect {
            if rect.w <= 0.0 || rect.h <= 0.0 {
                return false;
            }
        }
        if lower(&self.display) == "none" {
            return false;
        }
        let visibility = lower(&self.visibility);
        if visibility == "hidden" || visibility == "collapse" {
            return false;
        }
        self.opacity.unwrap_or(1.0) >= INVISIBLE_OPACITY
    }

    /// Whether the element still receives pointer events.
    pub fn receives_pointer_events(&self) -> bool {
        self.pointer_events
            .as_deref()
            .map(|p| !p.eq_ignore_ascii_case("none"))
            .unwrap_or(true)
    }
}

fn lower(value: &Option<String>) -> String {
    value.as_deref().unwrap_or("").to_lowercase()
}

/// How the click was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    /// Mouse, pen or touch.
    #[default]
    Pointer,
    /// Enter/Space activation.
    Keyboard,
}

/// Everything the scorer knows about one click.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClickContext {
    /// Viewport size.
    pub viewport: Viewport,
    /// Input modality.
    pub input: InputModality,
    /// Topmost element at the click point.
    pub top: ElementHint,
    /// First interactive element beneath the top one.
    pub underlying: Option<ElementHint>,
    /// Pointer-down and click hit different top elements.
    pub retargeted: bool,
    /// Middle click or ctrl/meta modifier.
    pub explicit_new_tab_intent: bool,
    /// Large non-interactive overlay belonging to a dialog.
    pub is_legit_modal_backdrop: bool,
}

/// Why a click scored the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Interactive top element without an accessible name.
    NoAccessibleName,
    /// Interactive top element covering a large share of the viewport.
    OverlayLargeInteractive,
    /// A named control sits under an element that is not one.
    IntentMismatchUnderInteractive,
    /// Pointer-down and click hit different elements.
    RetargetedTargetMismatch,
    /// Interactive element positioned above everything else.
    OverlayHighZindex,
    /// Pointer cursor over a nearly transparent, unnamed control.
    CursorPointerNoAffordance,
    /// Element is not rendered yet still catches clicks.
    InvisibleButClickable,
    /// Activated from the keyboard.
    KeyboardActivation,
    /// Backdrop of a real modal dialog.
    LegitModalBackdrop,
}

impl ReasonCode {
    /// Wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::NoAccessibleName => "no_accessible_name",
            ReasonCode::OverlayLargeInteractive => "overlay_large_interactive",
            ReasonCode::IntentMismatchUnderInteractive => "intent_mismatch_under_interactive",
            ReasonCode::RetargetedTargetMismatch => "retargeted_target_mismatch",
            ReasonCode::OverlayHighZindex => "overlay_high_zindex",
            ReasonCode::CursorPointerNoAffordance => "cursor_pointer_no_affordance",
            ReasonCode::InvisibleButClickable => "invisible_but_clickable",
            ReasonCode::KeyboardActivation => "keyboard_activation",
            ReasonCode::LegitModalBackdrop => "legit_modal_backdrop",
        }
    }

    /// Reasons that rule out the blank-anchor escape hatch by default.
    pub fn default_risky() -> [ReasonCode; 5] {
        [
            ReasonCode::RetargetedTargetMismatch,
            ReasonCode::InvisibleButClickable,
            ReasonCode::OverlayLargeInteractive,
            ReasonCode::OverlayHighZindex,
            ReasonCode::CursorPointerNoAffordance,
        ]
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score and the reasons behind it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Deceptiveness score, never negative.
    pub cds: u32,
    /// Reasons in rule-evaluation order.
    pub reason_codes: Vec<ReasonCode>,
}

impl ScoreResult {
    /// Whether a reason fired.
    pub fn has(&self, reason: ReasonCode) -> bool {
        self.reason_codes.contains(&reason)
    }

    /// Whether any of the given reasons fired.
    pub fn has_any(&self, reasons: &[ReasonCode]) -> bool {
        reasons.iter().any(|r| self.has(*r))
    }
}

/// Score a click.
pub fn score(ctx: &ClickContext) -> ScoreResult {
    let mut reasons = Vec::new();
    let mut cds: i64 = 0;
    let mut add = |points: i64, reason: ReasonCode| {
        cds += points;
        reasons.push(reason);
    };

    let top = &ctx.top;
    let top_interactive = top.is_interactive();
    let top_named = top.has_name();

    if top_interactive && !top_named {
        add(15, ReasonCode::NoAccessibleName);
    }

    let coverage = top.coverage_ratio(&ctx.viewport);
    if top_interactive && coverage.is_some_and(|r| r > OVERLAY_COVERAGE) {
        add(30, ReasonCode::OverlayLargeInteractive);
    }

    if let Some(under) = &ctx.underlying {
        let top_intentful = top_interactive && top_named;
        if under.is_interactive() && under.has_name() && !top_intentful {
            add(35, ReasonCode::IntentMismatchUnderInteractive);
        }
    }

    if ctx.retargeted {
        add(20, ReasonCode::RetargetedTargetMismatch);
    }

    let position = lower(&top.position);
    if top_interactive
        && (position == "fixed" || position == "absolute")
        && top.z_index.unwrap_or(0) >= HIGH_Z_INDEX
    {
        add(15, ReasonCode::OverlayHighZindex);
    }

    if top_interactive
        && lower(&top.cursor) == "pointer"
        && !top_named
        && top.opacity.unwrap_or(1.0) < NO_AFFORDANCE_OPACITY
    {
        add(10, ReasonCode::CursorPointerNoAffordance);
    }

    if !top.is_visible() && top.receives_pointer_events() {
        add(25, ReasonCode::InvisibleButClickable);
    }

    if ctx.input == InputModality::Keyboard {
        add(-10, ReasonCode::KeyboardActivation);
    }

    if ctx.is_legit_modal_backdrop {
        add(-20, ReasonCode::LegitModalBackdrop);
    }

    ScoreResult {
        cds: u32::try_from(cds.max(0)).unwrap_or(u32::MAX),
        reason_codes: reasons,
    }
}

/// Whether a score meets the blocking threshold of the given threshold.
pub fn meets_threshold(result: &ScoreResult, threshold: Option<u32>) -> bool {
    threshold.is_some_and(|t| result.cds >= t)
}

/// Permissive-mode escape hatch for `target="_blank"` anchors that look like
/// ordinary links: below the lenient threshold, rendered, interactive (the
/// anchor or the element actually hit), not retargeted, and free of risky
/// reasons.
pub fn is_legit_blank_anchor(
    anchor: &ElementHint,
    ctx: &ClickContext,
    result: &ScoreResult,
    config: &RelayConfig,
) -> bool {
    result.cds < config.lenient_threshold
        && anchor.is_visible()
        && (anchor.is_interactive() || ctx.top.is_interactive())
        && !ctx.retargeted
        && !result.has_any(&config.risky_reasons)
}
