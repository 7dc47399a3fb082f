//! High concurrency tests for the claim protocol
//!
//! Many users search at once against the same store. Whatever order their
//! poll loops interleave in, nobody may end up in two chats and every chat
//! must hold two different users.

mod fixtures;

use chat_roulette::session::SESSION_COLLECTION;
use chat_roulette::types::ChatSession;
use chat_roulette::PairingOutcome;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use fixtures::{create_test_system, create_test_system_with, fast_config, interest};

/// Run `users` searches to completion and return their outcomes
async fn run_searches(
    matchmaker: &chat_roulette::Matchmaker,
    users: usize,
    interests: &[&str],
    timeout: Duration,
) -> Vec<(String, PairingOutcome)> {
    let mut handles = Vec::with_capacity(users);
    for i in 0..users {
        let user = format!("user-{:03}", i);
        let handle = matchmaker
            .start_searching(&user, interest(interests[i % interests.len()]))
            .await
            .unwrap();
        handles.push(handle);
    }

    // Unmatched users are cancelled once the timeout expires
    let tokens: Vec<_> = handles.iter().map(|h| h.cancel_token()).collect();
    let deadline = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tokens.iter().for_each(|t| t.cancel());
    });

    let outcomes = join_all(handles.into_iter().map(|handle| async move {
        let user = handle.user_id().to_string();
        (user, handle.wait().await)
    }))
    .await;

    deadline.abort();
    outcomes
}

fn assert_at_most_once(outcomes: &[(String, PairingOutcome)]) -> HashMap<String, Vec<String>> {
    let mut chats: HashMap<String, Vec<String>> = HashMap::new();
    for (user, outcome) in outcomes {
        if let PairingOutcome::Matched(found) = outcome {
            assert_eq!(&found.user_id, user);
            assert_ne!(&found.partner_id, user, "{} was paired with itself", user);
            chats.entry(found.chat_id.clone()).or_default().push(user.clone());
        }
    }

    let mut seen = HashSet::new();
    for (chat_id, members) in &chats {
        assert_eq!(members.len(), 2, "chat {} has members {:?}", chat_id, members);
        assert_ne!(members[0], members[1]);
        for member in members {
            assert!(seen.insert(member.clone()), "{} is in two chats", member);
        }
    }
    chats
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_even_crowd_everyone_paired_exactly_once() {
    let (store, matchmaker) = create_test_system();
    let start = Instant::now();

    let outcomes = run_searches(&matchmaker, 20, &["music"], Duration::from_secs(10)).await;
    let chats = assert_at_most_once(&outcomes);

    let matched = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, PairingOutcome::Matched(_)))
        .count();
    assert_eq!(matched, 20, "every user should find a partner");
    assert_eq!(chats.len(), 10);

    // Every stored session is one that both participants were told about
    let sessions: Vec<ChatSession> = store
        .documents(SESSION_COLLECTION)
        .into_iter()
        .map(|doc| {
            let mut session: ChatSession = serde_json::from_value(doc.data).unwrap();
            session.id = doc.id;
            session
        })
        .collect();
    assert_eq!(sessions.len(), 10);
    for session in &sessions {
        let members = chats.get(&session.id).unwrap();
        for participant in session.participants() {
            assert!(members.contains(participant));
        }
    }

    println!(
        "✅ 20 concurrent users paired into 10 chats in {:?}",
        start.elapsed()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_odd_crowd_leaves_one_user_waiting() {
    let (store, matchmaker) = create_test_system();

    let outcomes = run_searches(&matchmaker, 9, &["music"], Duration::from_secs(3)).await;
    let chats = assert_at_most_once(&outcomes);

    assert_eq!(chats.len(), 4);
    let cancelled = outcomes
        .iter()
        .filter(|(_, o)| *o == PairingOutcome::Cancelled)
        .count();
    assert_eq!(cancelled, 1);
    assert_eq!(store.document_count(SESSION_COLLECTION), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pairing_survives_store_latency_and_failures() {
    let mut config = fast_config();
    config.pairing.poll_jitter_ms = 15;
    let (store, matchmaker) = create_test_system_with(config);
    store.set_latency(Duration::from_millis(3));
    store.fail_next(5);

    let outcomes = run_searches(
        &matchmaker,
        16,
        &["music", "chess"],
        Duration::from_secs(10),
    )
    .await;
    let chats = assert_at_most_once(&outcomes);

    assert_eq!(chats.len(), 8);
    assert_eq!(store.document_count(SESSION_COLLECTION), 8);
    assert!(matchmaker.connection_status().connected);
}
