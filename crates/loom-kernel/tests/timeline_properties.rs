//! Whole-space behavior of the kernel: forks, merges, concurrent writers,
//! and externalization, driven through the public `Space` API.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::task::JoinSet;

use loom_kernel::{
    ExternalMessage, ExternalSink, ForkOptions, LoomConfig, MemoryStore, MergeStrategy, Space,
    StateProjector,
};
use loom_types::{BranchId, EventKind, PrincipalId, SpaceId, TimelineContext};

fn new_space() -> (Arc<Space>, TimelineContext) {
    let space = Space::open(SpaceId::new(), Arc::new(MemoryStore::new()), &LoomConfig::default()).unwrap();
    let root = space.open_root(Some("primary".into()), PrincipalId::system()).unwrap();
    (Arc::new(space), root)
}

fn history_len(space: &Space, ctx: &TimelineContext, object: &str) -> usize {
    let state = space.read_state(&object.into(), ctx, PrincipalId::system()).unwrap();
    state.value["history"].as_array().map(|h| h.len()).unwrap_or(0)
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn fork_then_append_leaves_parent_untouched() {
    let (space, root) = new_space();
    let author = PrincipalId::new();

    let a = space.submit_event("doc:obj".into(), json!({"step": "A"}), &root, author).unwrap();
    let primary_head = a.updated_context.last_event_id;
    let f1 = space
        .fork(&a.updated_context, ForkOptions::new(author).label("f1").reason("explore"))
        .unwrap();

    // Identical at the fork instant.
    let on_primary = space.read_state(&"doc:obj".into(), &a.updated_context, author).unwrap();
    let on_fork = space.read_state(&"doc:obj".into(), &f1, author).unwrap();
    assert_eq!(on_primary, on_fork);

    let b = space.submit_event("doc:obj".into(), json!({"step": "B"}), &f1, author).unwrap();

    let primary_state = space.read_state(&"doc:obj".into(), &a.updated_context, author).unwrap();
    assert_eq!(primary_state, on_primary);
    assert_eq!(primary_state.value["history"], json!([{"kind": "action", "payload": {"step": "A"}}]));

    let fork_state = space.read_state(&"doc:obj".into(), &b.updated_context, author).unwrap();
    assert_eq!(
        fork_state.value["history"],
        json!([
            {"kind": "action", "payload": {"step": "A"}},
            {"kind": "action", "payload": {"step": "B"}},
        ])
    );

    // B hangs off the fork event, which hangs off A.
    let b_event = space.log().get(b.event_id).unwrap();
    let fork_event = space.log().get(b_event.parent_id.unwrap()).unwrap();
    assert_eq!(fork_event.kind, EventKind::TimelineFork);
    assert_eq!(fork_event.parent_id, Some(a.event_id));
    assert!(space.log().is_ancestor(a.event_id, b.event_id).unwrap());
    assert_eq!(space.log().head(root.branch_id), Some(primary_head));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_have_one_winner() {
    let (space, root) = new_space();
    let mut set = JoinSet::new();
    for n in 0..8 {
        let space = space.clone();
        set.spawn_blocking(move || space.submit_event("doc:race".into(), json!({"n": n}), &root, PrincipalId::new()));
    }

    let mut wins = 0;
    let mut stale = 0;
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => {
                assert_eq!(e.code(), Some("STALE_PARENT"));
                stale += 1;
            }
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(stale, 7);
    assert_eq!(history_len(&space, &space.context_for(root.branch_id).unwrap(), "doc:race"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retrying_writers_all_land_once() {
    let (space, root) = new_space();
    let mut set = JoinSet::new();
    for n in 0..6 {
        let space = space.clone();
        set.spawn_blocking(move || {
            let author = PrincipalId::new();
            let mut ctx = root;
            loop {
                match space.submit_event("doc:count".into(), json!({"n": n}), &ctx, author) {
                    Ok(out) => return out.event_id,
                    Err(e) if e.code() == Some("STALE_PARENT") => {
                        ctx = space.context_for(root.branch_id).unwrap();
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
    }
    let mut ids = HashSet::new();
    while let Some(joined) = set.join_next().await {
        assert!(ids.insert(joined.unwrap()));
    }
    let ctx = space.context_for(root.branch_id).unwrap();
    assert_eq!(history_len(&space, &ctx, "doc:count"), 6);
}

struct CountingSink(Mutex<Vec<ExternalMessage>>);

#[async_trait]
impl ExternalSink for CountingSink {
    async fn propagate(&self, message: ExternalMessage) {
        self.0.lock().push(message);
    }
}

#[tokio::test]
async fn non_primary_changes_never_reach_the_sink() {
    let (space, root) = new_space();
    let sink = Arc::new(CountingSink(Mutex::new(Vec::new())));
    let forwarder = space.hub().attach_sink(">", sink.clone());
    let author = PrincipalId::new();

    let fork = space.fork(&root, ForkOptions::new(author)).unwrap();
    let mut fork_ctx = fork;
    for n in 0..5 {
        fork_ctx = space.submit_event("doc:x".into(), json!({"n": n}), &fork_ctx, author).unwrap().updated_context;
    }
    let primary = space.submit_event("doc:x".into(), json!({"n": "p"}), &root, author).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while sink.0.lock().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let received = sink.0.lock().clone();
    assert!(received.iter().all(|m| m.timeline_context.is_primary));
    assert!(received.iter().all(|m| m.timeline_context.branch_id != fork.branch_id));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].timeline_context.last_event_id, primary.event_id);
    forwarder.abort();
}

#[test]
fn merged_fork_state_reaches_primary() {
    let (space, root) = new_space();
    let author = PrincipalId::new();
    let fork = space.fork(&root, ForkOptions::new(author)).unwrap();
    let fork = space.submit_event("doc:x".into(), json!({"n": 1}), &fork, author).unwrap().updated_context;
    space.submit_event("doc:x".into(), json!({"n": 2}), &fork, author).unwrap();

    let merged = space
        .merge(fork.branch_id, root.branch_id, MergeStrategy::Append, PrincipalId::system())
        .unwrap();
    assert_eq!(history_len(&space, &merged.updated_context, "doc:x"), 2);
    let merge_event = space.log().get(merged.event_id).unwrap();
    assert_eq!(merge_event.kind, EventKind::TimelineMerge);
    assert_eq!(merge_event.merge_parents, vec![space.log().head(fork.branch_id).unwrap()]);
}

// ============================================================================
// Randomised interleavings
// ============================================================================

/// Random append / fork / merge sequences over a handful of branches, with
/// every merge strategy in play.
/// After every run: each branch's chain terminates at the space root, every
/// event's parents exist, and a cold projector agrees with the warm one.
#[test]
fn random_interleavings_keep_the_dag_sound() {
    for seed in [7_u64, 42, 1337, 9001, 31337, 65_521] {
        let mut rng = StdRng::seed_from_u64(seed);
        let (space, root) = new_space();
        let author = PrincipalId::new();
        let mut live: Vec<BranchId> = vec![root.branch_id];

        for step in 0..120 {
            let branch = live[rng.gen_range(0..live.len())];
            let Ok(ctx) = space.context_for(branch) else { continue };
            match rng.gen_range(0..10) {
                0 if live.len() < 6 => {
                    let child = space.fork(&ctx, ForkOptions::new(author)).unwrap();
                    live.push(child.branch_id);
                }
                1 if live.len() > 1 => {
                    let source = live[rng.gen_range(0..live.len())];
                    if source == branch {
                        continue;
                    }
                    let strategy = match rng.gen_range(0..3) {
                        0 => MergeStrategy::Append,
                        1 => MergeStrategy::Interleave,
                        _ => {
                            let object = format!("doc:{}", rng.gen_range(0..4));
                            MergeStrategy::Edit { resolution: json!({"objects": {object: {"resolved": step}}}) }
                        }
                    };
                    // Rejections are legal outcomes; corruption is not.
                    let _ = space.merge(source, branch, strategy, author);
                }
                _ => {
                    let object = format!("doc:{}", rng.gen_range(0..4));
                    let out = space.submit_event(object.as_str().into(), json!({"step": step}), &ctx, author);
                    if let Err(e) = out {
                        assert_eq!(e.code(), Some("NO_PRIMARY"), "seed {seed} step {step}: {e}");
                    }
                }
            }
        }

        let log = space.log();
        let cold = StateProjector::default();
        for branch in &live {
            let head = log.head(*branch).unwrap();
            let chain: Vec<_> = log.ancestors(head).unwrap().collect();
            assert_eq!(chain.first().unwrap().kind, EventKind::BranchRoot, "seed {seed}");
            for event in &chain {
                assert!(event.parents().all(|p| log.contains(p)));
                if event.kind != EventKind::TimelineMerge {
                    assert!(event.merge_parents.is_empty());
                }
            }
            for n in 0..4 {
                let object = format!("doc:{n}");
                let warm = space.projector().state_of(log, &object.as_str().into(), *branch).unwrap();
                let fresh = cold.state_of(log, &object.as_str().into(), *branch).unwrap();
                assert_eq!(warm, fresh, "seed {seed} branch {branch} object {object}");
            }
        }
    }
}
