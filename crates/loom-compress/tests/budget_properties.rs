//! Whole-engine properties over randomized element sets.

use std::collections::HashSet;

use rand::{Rng, SeedableRng, rngs::StdRng};

use loom_compress::{
    CompressionEngine, CompressionLevel, CompressionRequest, ConversationMessage, ElementKind, RenderElement,
};
use loom_types::{CompressionHint, MessageRole, SpanId};

const HOUR: u64 = 60 * 60 * 1000;
const NOW: u64 = 10_000 * HOUR;

fn random_conversation(rng: &mut StdRng, id: &str) -> (RenderElement, Vec<ConversationMessage>) {
    let mut messages: Vec<ConversationMessage> = Vec::new();
    for i in 0..rng.gen_range(2..30u64) {
        let open: Vec<_> = messages.iter().filter(|m| m.role == MessageRole::Request).map(|m| m.event_id).collect();
        let topic = ["merges", "forks", "lunch", "billing"][rng.gen_range(0..4)];
        let msg = if !open.is_empty() && rng.gen_bool(0.6) {
            ConversationMessage::new(MessageRole::Response, format!("{id} reply {i} on {topic}"), NOW - 100 * HOUR + i)
                .replying_to(open[rng.gen_range(0..open.len())])
        } else {
            ConversationMessage::new(MessageRole::Request, format!("{id} asking {i} about {topic}"), NOW - 100 * HOUR + i)
        };
        messages.push(msg);
    }
    let ended = NOW - rng.gen_range(0..72) * HOUR;
    let element = RenderElement::conversation(id, ElementKind::RemoteBundle, messages.clone())
        .backed_by(SpanId::new(), Some(ended));
    (element, messages)
}

#[test]
fn verbatim_elements_always_survive_whole() {
    let engine = CompressionEngine::default();
    for seed in [1u64, 2, 3, 5, 8, 13] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut elements = Vec::new();
        let mut pinned = Vec::new();
        for i in 0..12 {
            let id = format!("e{i}");
            let len = rng.gen_range(10..400);
            let mut element = RenderElement::text(&id, ElementKind::Object, "y".repeat(len), i);
            if rng.gen_bool(0.25) {
                element = element.with_hint(CompressionHint::verbatim());
                pinned.push((id, len));
            }
            elements.push(element);
        }
        // An old, off-focus bundle would collapse to a summary unless pinned.
        let old_bundle: Vec<ConversationMessage> = (0..6u64)
            .flat_map(|i| {
                let ask = ConversationMessage::new(MessageRole::Request, format!("question {i} lunch"), i * 2);
                let answer = ConversationMessage::new(MessageRole::Response, format!("answer {i} lunch"), i * 2 + 1)
                    .replying_to(ask.event_id);
                [ask, answer]
            })
            .collect();
        elements.push(
            RenderElement::conversation("pinned-bundle", ElementKind::RemoteBundle, old_bundle.clone())
                .backed_by(SpanId::new(), Some(NOW - 500 * HOUR))
                .with_hint(CompressionHint::verbatim()),
        );

        let budget = rng.gen_range(0..2000);
        let request = CompressionRequest::new(budget).at(NOW).focus("merges");
        let assembly = engine.compress(elements, &request);

        for (id, len) in &pinned {
            let kept = assembly.get(id).map(|e| (e.level, e.text.len()));
            assert_eq!(kept, Some((CompressionLevel::Full, *len)), "seed {seed}: {id}");
        }
        let bundle = assembly.get("pinned-bundle").unwrap();
        assert_eq!(bundle.level, CompressionLevel::Full);
        let lines: Vec<String> = old_bundle.iter().map(ConversationMessage::render_line).collect();
        assert_eq!(bundle.text, lines.join("\n"), "seed {seed}: pinned bundle was cut");
        assert_eq!(assembly.render().len(), assembly.size);
        assert_eq!(assembly.warning.is_some(), assembly.size > budget);
    }
}

#[test]
fn no_response_is_kept_without_its_request() {
    let engine = CompressionEngine::default();
    for seed in [11u64, 22, 33, 44] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut all = Vec::new();
        let mut elements = Vec::new();
        for i in 0..4 {
            let (element, messages) = random_conversation(&mut rng, &format!("bundle{i}"));
            elements.push(element);
            all.extend(messages);
        }
        for budget in [usize::MAX, 4000, 1500, 300] {
            let request = CompressionRequest::new(budget).at(NOW).focus("merges");
            let assembly = engine.compress(elements.clone(), &request);
            let rendered = assembly.render();
            let lines: HashSet<&str> = rendered.lines().collect();

            for msg in all.iter().filter(|m| m.role == MessageRole::Response) {
                let Some(request_id) = msg.in_reply_to else { continue };
                if !lines.contains(msg.render_line().as_str()) {
                    continue;
                }
                let request = all.iter().find(|m| m.event_id == request_id);
                if let Some(request) = request {
                    assert!(
                        lines.contains(request.render_line().as_str()),
                        "seed {seed} budget {budget}: response kept without request"
                    );
                }
            }
        }
    }
}
