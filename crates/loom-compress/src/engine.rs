//! Budgeted assembly of render elements.
//!
//! Each element starts at [`CompressionLevel::Full`] (which for remote
//! bundles already means tiered partial compression). While the assembly is
//! over budget, the lowest-priority element that can still shrink moves up
//! one level. Priority is the hinted importance, then recency. Elements
//! marked `preserve_verbatim` never move.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, instrument, warn};

use loom_types::CompressionHint;

use crate::config::CompressionConfig;
use crate::element::{ConversationMessage, ElementBody, ElementKind, RenderElement};
use crate::summary::{summarize_messages, summarize_text, truncate_chars};
use crate::tier::{compress_conversation, render_parts, Tier};

/// Importance assumed for elements without a hint.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

const SEPARATOR: &str = "\n\n";

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompressionLevel {
    #[default]
    Full,
    Trimmed,
    Summary,
    Reference,
}

impl CompressionLevel {
    pub fn next(self) -> Option<Self> {
        match self {
            CompressionLevel::Full => Some(CompressionLevel::Trimmed),
            CompressionLevel::Trimmed => Some(CompressionLevel::Summary),
            CompressionLevel::Summary => Some(CompressionLevel::Reference),
            CompressionLevel::Reference => None,
        }
    }
}

/// What to assemble for, and under which constraints.
#[derive(Clone, Debug, Default)]
pub struct CompressionRequest {
    /// Bytes of rendered text.
    pub budget: usize,
    /// Topics the reader currently cares about.
    pub focus: Vec<String>,
    /// Unix millis used to age remote spans.
    pub now: u64,
    /// Hints by element ID, overriding the element's own.
    pub hints: HashMap<String, CompressionHint>,
}

impl CompressionRequest {
    pub fn new(budget: usize) -> Self {
        Self { budget, now: loom_types::now_millis(), ..Default::default() }
    }

    pub fn focus(mut self, topic: impl Into<String>) -> Self {
        self.focus.push(topic.into());
        self
    }

    pub fn hint(mut self, element_id: impl Into<String>, hint: CompressionHint) -> Self {
        self.hints.insert(element_id.into(), hint);
        self
    }

    pub fn at(mut self, now: u64) -> Self {
        self.now = now;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressedElement {
    pub id: String,
    pub kind: ElementKind,
    pub level: CompressionLevel,
    /// Set for span-backed elements.
    pub tier: Option<Tier>,
    pub text: String,
}

/// The assembly could not be brought under budget.
///
/// Not an error: the assembly is still usable, it is just larger than asked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub budget: usize,
    pub size: usize,
    /// Elements that could not shrink because they are preserved verbatim.
    pub verbatim: Vec<String>,
}

impl BudgetWarning {
    pub const fn code(&self) -> &'static str {
        "BUDGET_EXCEEDED"
    }
}

impl fmt::Display for BudgetWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes against a budget of {} ({} verbatim elements)",
            self.code(),
            self.size,
            self.budget,
            self.verbatim.len()
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressedAssembly {
    pub elements: Vec<CompressedElement>,
    pub size: usize,
    pub budget: usize,
    pub warning: Option<BudgetWarning>,
}

impl CompressedAssembly {
    pub fn render(&self) -> String {
        self.elements.iter().map(|e| e.text.as_str()).collect::<Vec<_>>().join(SEPARATOR)
    }

    pub fn get(&self, id: &str) -> Option<&CompressedElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn within_budget(&self) -> bool {
        self.size <= self.budget
    }
}

struct Slot {
    element: RenderElement,
    hint: Option<CompressionHint>,
    tier: Option<Tier>,
    level: CompressionLevel,
    text: String,
}

impl Slot {
    fn verbatim(&self) -> bool {
        self.hint.as_ref().is_some_and(|h| h.preserve_verbatim)
    }

    fn importance(&self) -> Option<f32> {
        self.hint.as_ref().and_then(|h| h.importance)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CompressionEngine {
    config: CompressionConfig,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Fit `elements` into `request.budget`, preserving their order.
    #[instrument(name = "loom.compress", skip_all, fields(elements = elements.len(), budget = request.budget))]
    pub fn compress(&self, elements: Vec<RenderElement>, request: &CompressionRequest) -> CompressedAssembly {
        let mut slots: Vec<Slot> = elements
            .into_iter()
            .map(|element| {
                let hint = request.hints.get(&element.id).cloned().or_else(|| element.hint.clone());
                let tier = element.span.as_ref().map(|s| Tier::of_span(s, request.now, &self.config));
                let mut slot = Slot { element, hint, tier, level: CompressionLevel::Full, text: String::new() };
                slot.text = self.render(&slot, &request.focus);
                slot
            })
            .collect();
        let priority = effective_importance(&slots);

        let mut size = assembled_size(&slots);
        let mut rounds = 0usize;
        while size > request.budget {
            let candidate = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.verbatim() && s.level != CompressionLevel::Reference)
                .min_by(|(a, sa), (b, sb)| {
                    priority[*a]
                        .total_cmp(&priority[*b])
                        .then(sa.element.timestamp.cmp(&sb.element.timestamp))
                        .then(a.cmp(b))
                })
                .map(|(i, _)| i);
            let Some(i) = candidate else { break };

            let slot = &mut slots[i];
            let Some(next) = slot.level.next() else { break };
            slot.level = next;
            let text = self.render(slot, &request.focus);
            size = size - slot.text.len() + text.len();
            slot.text = text;
            rounds += 1;
            debug!(element = %slot.element.id, level = %next, size, "raised compression level");
        }

        let warning = (size > request.budget).then(|| BudgetWarning {
            budget: request.budget,
            size,
            verbatim: slots.iter().filter(|s| s.verbatim()).map(|s| s.element.id.clone()).collect(),
        });
        match &warning {
            Some(w) => warn!(%w, rounds, "assembly over budget"),
            None => debug!(size, rounds, "assembly within budget"),
        }

        CompressedAssembly {
            elements: slots
                .into_iter()
                .map(|s| CompressedElement {
                    id: s.element.id,
                    kind: s.element.kind,
                    level: s.level,
                    tier: s.tier,
                    text: s.text,
                })
                .collect(),
            size,
            budget: request.budget,
            warning,
        }
    }

    fn render(&self, slot: &Slot, focus: &[String]) -> String {
        let config = &self.config;
        let element = &slot.element;
        let suggested = slot.hint.as_ref().and_then(|h| h.suggested_summary.as_deref());
        match (&element.body, slot.level) {
            (ElementBody::Text(text), CompressionLevel::Full) => text.clone(),
            (ElementBody::Text(text), CompressionLevel::Trimmed) => truncate_chars(text, config.trimmed_chars),
            (ElementBody::Text(text), CompressionLevel::Summary) => match suggested {
                Some(s) => truncate_chars(s, config.summary_chars),
                None => summarize_text(text, config.summary_chars),
            },
            (ElementBody::Conversation(messages), _) if slot.verbatim() => {
                messages.iter().map(ConversationMessage::render_line).collect::<Vec<_>>().join("\n")
            }
            (ElementBody::Conversation(messages), CompressionLevel::Full | CompressionLevel::Trimmed) => {
                let escalation = u8::from(slot.level == CompressionLevel::Trimmed);
                let tier = slot.tier.unwrap_or(Tier::Recent);
                render_parts(&compress_conversation(messages, tier, focus, config, escalation))
            }
            (ElementBody::Conversation(messages), CompressionLevel::Summary) => match suggested {
                Some(s) => truncate_chars(s, config.summary_chars),
                None => summarize_messages(messages, config.summary_chars),
            },
            (_, CompressionLevel::Reference) => format!("[{} {} omitted]", element.kind, element.id),
        }
    }
}

fn assembled_size(slots: &[Slot]) -> usize {
    let text: usize = slots.iter().map(|s| s.text.len()).sum();
    text + SEPARATOR.len() * slots.len().saturating_sub(1)
}

/// Hinted importance, raised to the highest importance among the elements a
/// slot names as related, so related elements shrink together.
fn effective_importance(slots: &[Slot]) -> Vec<f32> {
    let own: HashMap<&str, f32> = slots
        .iter()
        .map(|s| (s.element.id.as_str(), s.importance().unwrap_or(DEFAULT_IMPORTANCE)))
        .collect();
    slots
        .iter()
        .map(|s| {
            let base = own.get(s.element.id.as_str()).copied().unwrap_or(DEFAULT_IMPORTANCE);
            s.hint
                .iter()
                .flat_map(|h| h.related_elements.iter())
                .filter_map(|id| own.get(id.as_str()).copied())
                .fold(base, f32::max)
        })
        .collect()
}
