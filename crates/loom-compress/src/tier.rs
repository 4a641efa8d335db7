//! Age tiers and partial compression of conversation bodies.
//!
//! Remote bundles are classified by how long ago their span ended. Each tier
//! decides, thread by thread, how much of the conversation to keep:
//!
//! | tier         | high relevance | medium              | low          |
//! |--------------|----------------|---------------------|--------------|
//! | `recent`     | whole          | whole               | whole        |
//! | `mid_term`   | whole          | boundary + summary  | summary      |
//! | `historical` | one summary for the bundle, plus a few key messages      |
//!
//! Every cut happens between exchanges, never inside one.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::config::CompressionConfig;
use crate::element::{ConversationMessage, SpanBacking};
use crate::relevance;
use crate::summary::summarize_messages;
use crate::thread::{split_threads, Exchange, Thread};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Recent,
    MidTerm,
    Historical,
}

impl Tier {
    pub fn for_age(age_ms: u64, config: &CompressionConfig) -> Self {
        if age_ms <= config.recent_window_ms {
            Tier::Recent
        } else if age_ms <= config.mid_term_window_ms {
            Tier::MidTerm
        } else {
            Tier::Historical
        }
    }

    /// Tier of a span-backed element at `now`. Active spans are recent.
    pub fn of_span(span: &SpanBacking, now: u64, config: &CompressionConfig) -> Self {
        match span.ended_at {
            None => Tier::Recent,
            Some(ended) => Self::for_age(now.saturating_sub(ended), config),
        }
    }
}

/// How much of one thread survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadMode {
    Whole,
    /// First and last exchange, with the middle summarized.
    Boundary,
    SummaryOnly,
}

impl ThreadMode {
    fn escalate(self, steps: u8) -> Self {
        (0..steps).fold(self, |mode, _| match mode {
            ThreadMode::Whole => ThreadMode::Boundary,
            _ => ThreadMode::SummaryOnly,
        })
    }
}

/// One piece of a partially compressed conversation.
#[derive(Clone, Debug, PartialEq)]
pub enum BundlePart {
    Message(ConversationMessage),
    Summary { elided: usize, text: String },
}

impl BundlePart {
    pub fn render(&self) -> String {
        match self {
            BundlePart::Message(msg) => msg.render_line(),
            BundlePart::Summary { text, .. } => text.clone(),
        }
    }
}

pub fn render_parts(parts: &[BundlePart]) -> String {
    parts.iter().map(BundlePart::render).collect::<Vec<_>>().join("\n")
}

/// Mode for one thread of a mid-term bundle, by relevance to `focus`.
pub fn mid_term_mode(thread: &Thread, focus: &[String], config: &CompressionConfig) -> ThreadMode {
    let score = relevance::score(&thread.text(), focus);
    if score >= config.high_relevance {
        ThreadMode::Whole
    } else if score >= config.medium_relevance {
        ThreadMode::Boundary
    } else {
        ThreadMode::SummaryOnly
    }
}

fn keep_exchange(out: &mut Vec<BundlePart>, exchange: &Exchange) {
    out.extend(exchange.messages.iter().cloned().map(BundlePart::Message));
}

fn summarize_exchanges<'a>(
    out: &mut Vec<BundlePart>,
    exchanges: impl IntoIterator<Item = &'a Exchange>,
    config: &CompressionConfig,
) {
    let elided: Vec<&ConversationMessage> = exchanges.into_iter().flat_map(|e| e.messages.iter()).collect();
    if elided.is_empty() {
        return;
    }
    out.push(BundlePart::Summary {
        elided: elided.len(),
        text: summarize_messages(elided, config.summary_chars),
    });
}

pub fn compress_thread(thread: &Thread, mode: ThreadMode, config: &CompressionConfig) -> Vec<BundlePart> {
    let mut out = Vec::new();
    match (mode, thread.exchanges.as_slice()) {
        (ThreadMode::SummaryOnly, all) => summarize_exchanges(&mut out, all, config),
        (ThreadMode::Boundary, [first, middle @ .., last]) if !middle.is_empty() => {
            keep_exchange(&mut out, first);
            summarize_exchanges(&mut out, middle, config);
            keep_exchange(&mut out, last);
        }
        (_, all) => all.iter().for_each(|e| keep_exchange(&mut out, e)),
    }
    out
}

/// Partially compress a conversation body.
///
/// `escalation` pushes every thread that many steps further than its tier
/// would on its own; the engine uses it for the `trimmed` level.
pub fn compress_conversation(
    messages: &[ConversationMessage],
    tier: Tier,
    focus: &[String],
    config: &CompressionConfig,
    escalation: u8,
) -> Vec<BundlePart> {
    let threads = split_threads(messages);
    match tier {
        Tier::Historical => historical(&threads, focus, config, escalation),
        Tier::Recent | Tier::MidTerm => threads
            .iter()
            .flat_map(|thread| {
                let base = match tier {
                    Tier::MidTerm => mid_term_mode(thread, focus, config),
                    _ => ThreadMode::Whole,
                };
                compress_thread(thread, base.escalate(escalation), config)
            })
            .collect(),
    }
}

/// A bundle summary, preceded by at most `historical_key_messages` messages
/// taken as whole exchanges from the most relevant threads.
fn historical(threads: &[Thread], focus: &[String], config: &CompressionConfig, escalation: u8) -> Vec<BundlePart> {
    let budget = if escalation == 0 { config.historical_key_messages } else { 0 };

    let mut ranked: Vec<(usize, f32)> = threads
        .iter()
        .enumerate()
        .map(|(i, t)| (i, relevance::score(&t.text(), focus)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut kept: Vec<(usize, usize)> = Vec::new();
    let mut kept_messages = 0;
    for (t, _) in ranked {
        for (x, exchange) in threads[t].exchanges.iter().enumerate() {
            if kept_messages + exchange.len() <= budget {
                kept_messages += exchange.len();
                kept.push((t, x));
            }
        }
    }
    kept.sort_unstable();

    let mut out = Vec::new();
    for &(t, x) in &kept {
        keep_exchange(&mut out, &threads[t].exchanges[x]);
    }
    let kept = &kept;
    let elided = threads.iter().enumerate().flat_map(move |(t, thread)| {
        thread
            .exchanges
            .iter()
            .enumerate()
            .filter(move |(x, _)| !kept.contains(&(t, *x)))
            .map(|(_, e)| e)
    });
    summarize_exchanges(&mut out, elided, config);
    out
}
