//! Conversational thread detection.
//!
//! A thread is a set of messages connected through `in_reply_to`, in the
//! order they were written. Inside a thread, an *exchange* is an opening
//! message (a request or a note) plus every response chained to it. Partial
//! compression keeps or drops whole exchanges, so a kept response always has
//! its request beside it.

use std::collections::HashMap;

use loom_types::{EventId, MessageRole};

use crate::element::ConversationMessage;

/// An opening message and the responses chained to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Exchange {
    pub messages: Vec<ConversationMessage>,
}

impl Exchange {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Causally linked messages.
#[derive(Clone, Debug, PartialEq)]
pub struct Thread {
    pub exchanges: Vec<Exchange>,
}

impl Thread {
    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.exchanges.iter().flat_map(|e| e.messages.iter())
    }

    pub fn len(&self) -> usize {
        self.exchanges.iter().map(Exchange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_id(&self) -> Option<EventId> {
        self.messages().next().map(|m| m.event_id)
    }

    /// All message text, newline separated. Input to relevance scoring.
    pub fn text(&self) -> String {
        self.messages().map(|m| m.text.as_str()).collect::<Vec<_>>().join("\n")
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Split `messages` into threads, ordered by each thread's first message.
///
/// Replies to messages outside `messages` start their own thread.
pub fn split_threads(messages: &[ConversationMessage]) -> Vec<Thread> {
    let index: HashMap<EventId, usize> = messages.iter().enumerate().map(|(i, m)| (m.event_id, i)).collect();
    let mut parent: Vec<usize> = (0..messages.len()).collect();
    for (i, msg) in messages.iter().enumerate() {
        if let Some(&j) = msg.in_reply_to.as_ref().and_then(|r| index.get(r)) {
            let (a, b) = (find(&mut parent, i), find(&mut parent, j));
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
        }
    }

    let mut order: Vec<usize> = Vec::new();
    let mut members: HashMap<usize, Vec<&ConversationMessage>> = HashMap::new();
    for (i, msg) in messages.iter().enumerate() {
        let root = find(&mut parent, i);
        members
            .entry(root)
            .or_insert_with(|| {
                order.push(root);
                Vec::new()
            })
            .push(msg);
    }

    order
        .into_iter()
        .filter_map(|root| members.remove(&root))
        .map(|msgs| Thread { exchanges: exchanges(msgs) })
        .collect()
}

fn exchanges(messages: Vec<&ConversationMessage>) -> Vec<Exchange> {
    let mut out: Vec<Exchange> = Vec::new();
    let mut owner: HashMap<EventId, usize> = HashMap::new();
    // Responses seen before the message they answer, keyed by that message.
    let mut early: HashMap<EventId, usize> = HashMap::new();
    for msg in messages {
        let reply_to = match msg.role {
            MessageRole::Response => msg.in_reply_to,
            _ => None,
        };
        let joins = reply_to.and_then(|r| owner.get(&r).or_else(|| early.get(&r)).copied());
        let answered = early.remove(&msg.event_id);
        let slot = match (joins, answered) {
            (Some(into), Some(from)) if into != from => {
                let moved = std::mem::take(&mut out[from].messages);
                for m in &moved {
                    owner.insert(m.event_id, into);
                }
                early.values_mut().filter(|s| **s == from).for_each(|s| *s = into);
                out[into].messages.extend(moved);
                into
            }
            (Some(slot), _) | (None, Some(slot)) => slot,
            (None, None) => {
                out.push(Exchange { messages: Vec::new() });
                out.len() - 1
            }
        };
        if let Some(r) = reply_to.filter(|r| !owner.contains_key(r)) {
            early.entry(r).or_insert(slot);
        }
        owner.insert(msg.event_id, slot);

        // A late message goes in front of the responses already waiting on it.
        let exchange = &mut out[slot].messages;
        let at = exchange
            .iter()
            .position(|m| m.in_reply_to == Some(msg.event_id))
            .unwrap_or(exchange.len());
        exchange.insert(at, msg.clone());
    }
    out.retain(|e| !e.is_empty());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str, ts: u64) -> ConversationMessage {
        ConversationMessage::new(MessageRole::Request, text, ts)
    }

    fn resp(to: &ConversationMessage, text: &str, ts: u64) -> ConversationMessage {
        ConversationMessage::new(MessageRole::Response, text, ts).replying_to(to.event_id)
    }

    #[test]
    fn test_interleaved_threads_separate() {
        let a = req("a?", 1);
        let b = req("b?", 2);
        let a1 = resp(&a, "a!", 3);
        let b1 = resp(&b, "b!", 4);
        let threads = split_threads(&[a.clone(), b.clone(), a1.clone(), b1.clone()]);

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].first_id(), Some(a.event_id));
        assert_eq!(threads[0].exchanges.len(), 1);
        assert_eq!(threads[0].exchanges[0].messages, vec![a, a1]);
        assert_eq!(threads[1].exchanges[0].messages, vec![b, b1]);
    }

    #[test]
    fn test_follow_up_opens_new_exchange_in_same_thread() {
        let q1 = req("first", 1);
        let r1 = resp(&q1, "answer", 2);
        let q2 = req("follow up", 3).replying_to(r1.event_id);
        let r2 = resp(&q2, "second answer", 4);
        let threads = split_threads(&[q1, r1, q2, r2]);

        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].exchanges.len(), 2);
        assert_eq!(threads[0].len(), 4);
    }

    #[test]
    fn test_reply_ahead_of_its_request_joins_it() {
        let q = req("skewed clock?", 5);
        let early = resp(&q, "answered first", 4);
        let also = resp(&q, "second answer", 6);
        let threads = split_threads(&[early.clone(), q.clone(), also.clone()]);

        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].exchanges.len(), 1);
        assert_eq!(threads[0].exchanges[0].messages, vec![q, early, also]);
    }

    #[test]
    fn test_orphan_reply_stands_alone() {
        let outside = req("not in bundle", 0);
        let orphan = resp(&outside, "dangling", 1);
        let note = ConversationMessage::new(MessageRole::Note, "fyi", 2);
        let threads = split_threads(&[orphan, note]);
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|t| t.exchanges.len() == 1));
    }
}
