mod common;

use std::time::{Duration, Instant};

use common::{setup, FakeIndex, Script, ScriptedProcessor, DLQ, VISIBILITY};
use sluice::{
    classify::ErrorCategory,
    dlq::{DeadLetterRecord, ATTR_ATTEMPT_COUNT, ATTR_ERROR_CATEGORY},
    error::Error,
    pipeline::BUDGET_EXHAUSTED,
    queue::Queue,
};

#[tokio::test(start_paused = true)]
async fn test_not_found_is_dead_lettered_then_deleted() {
    let harness = setup(
        ScriptedProcessor::default().on("gone", Script::Fail(|| Error::not_found("object docs/a.pdf"))),
        FakeIndex::default(),
    );
    let id = harness.enqueue("a.pdf", "gone");

    let batch = harness.receive().await;
    let result = harness.run_batch(batch).await;

    assert_eq!(result.fatal, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(harness.queue.deleted(), vec![id.clone()]);
    assert_eq!(harness.processor.calls(), 1, "fatal errors are not retried");

    let sent = harness.queue.sent_to(DLQ);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attributes[ATTR_ATTEMPT_COUNT], "1");
    assert_eq!(sent[0].attributes[ATTR_ERROR_CATEGORY], "fatal");

    let record: DeadLetterRecord = serde_json::from_str(&sent[0].body).unwrap();
    assert_eq!(record.original_message_id, id);
    assert_eq!(record.attempt_count, 1);
    assert!(record.failure_reason.contains("not found"), "{}", record.failure_reason);
}

#[tokio::test(start_paused = true)]
async fn test_index_timeout_leaves_message_alone() {
    let harness = setup(
        ScriptedProcessor::default(),
        FakeIndex::default().stall_on("slow"),
    );
    harness.enqueue("a.txt", "slow");

    let batch = harness.receive().await;
    let result = harness.run_batch(batch).await;

    assert_eq!(result.recoverable, 1);
    assert_eq!(result.deleted, 0);
    assert!(harness.queue.deleted().is_empty());
    assert!(harness.queue.sent().is_empty());
    assert_eq!(harness.queue.in_flight_len(), 1);

    // One attempt plus two inline retries.
    assert_eq!(harness.index.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_batch_of_ten() {
    let harness = setup(
        ScriptedProcessor::default()
            .on("corrupt", Script::Fail(|| Error::corruption("truncated xref table"))),
        FakeIndex::default(),
    );
    for i in 0..8 {
        harness.enqueue(&format!("ok-{i}.txt"), &format!("document {i}"));
    }
    harness.enqueue("bad-1.pdf", "corrupt");
    harness.enqueue("bad-2.pdf", "corrupt");

    let batch = harness.receive().await;
    assert_eq!(batch.len(), 10);
    let result = harness.run_batch(batch).await;

    assert_eq!(result.succeeded, 8);
    assert_eq!(result.fatal, 2);
    assert_eq!(result.recoverable, 0);
    assert_eq!(result.deleted, 10);
    assert_eq!(harness.queue.deleted().len(), 10);
    assert_eq!(harness.queue.sent_to(DLQ).len(), 2);
    assert_eq!(harness.index.indexed().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_each_category_gets_exactly_its_disposition() {
    let harness = setup(
        ScriptedProcessor::default()
            .on("fatal", Script::Fail(|| Error::access_denied("docs/secret.txt")))
            .on("flaky", Script::Fail(|| Error::transport(eyre::eyre!("connection reset")))),
        FakeIndex::default(),
    );
    let ok = harness.enqueue("ok.txt", "fine");
    let fatal = harness.enqueue("secret.txt", "fatal");
    let flaky = harness.enqueue("flaky.txt", "flaky");

    let batch = harness.receive().await;
    harness.run_batch(batch).await;

    let deleted = harness.queue.deleted();
    assert_eq!(deleted.iter().filter(|id| **id == ok).count(), 1);
    assert_eq!(deleted.iter().filter(|id| **id == fatal).count(), 1);
    assert!(!deleted.contains(&flaky));

    let dead: Vec<DeadLetterRecord> = harness
        .queue
        .sent_to(DLQ)
        .iter()
        .map(|sent| serde_json::from_str(&sent.body).unwrap())
        .collect();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message_id, fatal);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_message_does_not_affect_siblings() {
    let harness = setup(
        ScriptedProcessor::default().on("boom", Script::Panic),
        FakeIndex::default(),
    );
    for i in 0..5 {
        harness.enqueue(&format!("{i}.txt"), &format!("document {i}"));
    }
    let crashed = harness.enqueue("boom.txt", "boom");

    let batch = harness.receive().await;
    let results = harness.dispatch(batch).await;
    assert_eq!(results.len(), 6);

    for (message, outcome) in &results {
        if message.id() == crashed {
            assert_eq!(outcome.category(), Some(ErrorCategory::Unknown));
        } else {
            assert!(outcome.is_success(), "{}: {outcome:?}", message.id());
        }
    }

    let result = harness.reduce(results, Instant::now()).await;
    assert_eq!(result.succeeded, 5);
    assert_eq!(result.recoverable, 1);
    assert!(!harness.queue.deleted().contains(&crashed));
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_failure_is_fail_safe() {
    let harness = setup(
        ScriptedProcessor::default().on("bad", Script::Fail(|| Error::validation("bad header"))),
        FakeIndex::default(),
    );
    harness.queue.fail_sends(true);
    let id = harness.enqueue("a.txt", "bad");

    let batch = harness.receive().await;
    let result = harness.run_batch(batch).await;

    assert_eq!(result.dead_letter_failures, 1);
    assert!(harness.queue.deleted().is_empty());

    // Redelivered once visible again, and dead-lettered once sends recover.
    harness.queue.fail_sends(false);
    tokio::time::advance(VISIBILITY).await;

    let batch = harness.receive().await;
    assert_eq!(batch[0].id(), id);
    assert_eq!(batch[0].receive_count(), 2);
    harness.run_batch(batch).await;

    assert_eq!(harness.queue.deleted(), vec![id]);
    assert_eq!(harness.queue.sent_to(DLQ).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_escalates_once_budget_is_spent() {
    let harness = setup(
        ScriptedProcessor::default(),
        FakeIndex::default().stall_on("slow"),
    );
    let id = harness.enqueue("a.txt", "slow");

    for delivery in 1..=2 {
        let batch = harness.receive().await;
        assert_eq!(batch[0].receive_count(), delivery);
        let result = harness.run_batch(batch).await;
        assert_eq!(result.recoverable, 1, "delivery {delivery}");
        harness.queue.expire_in_flight();
    }

    let batch = harness.receive().await;
    let result = harness.run_batch(batch).await;
    assert_eq!(result.fatal, 1);
    assert_eq!(harness.queue.deleted(), vec![id]);

    let sent = harness.queue.sent_to(DLQ);
    let record: DeadLetterRecord = serde_json::from_str(&sent[0].body).unwrap();
    assert_eq!(record.attempt_count, 3);
    assert!(record.failure_reason.starts_with(BUDGET_EXHAUSTED));
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_content_never_downloads() {
    let harness = setup(ScriptedProcessor::default(), FakeIndex::default());
    harness.enqueue("setup.exe", "MZ");

    let batch = harness.receive().await;
    let result = harness.run_batch(batch).await;

    assert_eq!(result.fatal, 1);
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.queue.sent_to(DLQ).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_body_is_dead_lettered() {
    let harness = setup(ScriptedProcessor::default(), FakeIndex::default());
    harness.queue.push("this is not json");

    let batch = harness
        .queue
        .receive(10, Duration::ZERO, VISIBILITY)
        .await
        .unwrap();
    let result = harness.run_batch(batch).await;

    assert_eq!(result.fatal, 1);
    assert_eq!(result.deleted, 1);

    let record: DeadLetterRecord =
        serde_json::from_str(&harness.queue.sent_to(DLQ)[0].body).unwrap();
    assert_eq!(record.original_body, "this is not json");
    assert!(record.key.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disk_full_is_never_dead_lettered() {
    let harness = setup(
        ScriptedProcessor::default()
            .on("full", Script::Fail(|| Error::exhausted("No space left on device"))),
        FakeIndex::default(),
    );
    let id = harness.enqueue("a.txt", "full");

    // Past the attempt budget of three.
    for delivery in 1..=4 {
        let batch = harness.receive().await;
        assert_eq!(batch[0].id(), id);
        assert_eq!(batch[0].receive_count(), delivery);

        let result = harness.run_batch(batch).await;
        assert_eq!(result.recoverable, 1, "delivery {delivery}");
        assert_eq!(result.resource_exhausted, 1, "delivery {delivery}");
        assert_eq!(result.fatal, 0, "delivery {delivery}");
        harness.queue.expire_in_flight();
    }

    assert!(harness.queue.deleted().is_empty());
    assert!(harness.queue.sent().is_empty());
    assert_eq!(harness.processor.calls(), 4, "exhaustion is not retried inline");
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_visibility_is_never_used() {
    let harness = setup(
        ScriptedProcessor::default().on("slow", Script::Sleep(Duration::from_secs(8))),
        FakeIndex::default(),
    );
    let ids: Vec<String> = (0..8)
        .map(|i| harness.enqueue(&format!("{i}.txt"), "slow"))
        .collect();

    let visibility = Duration::from_secs(5);
    let batch = harness
        .queue
        .receive(10, Duration::ZERO, visibility)
        .await
        .unwrap();
    assert_eq!(batch.len(), 8);

    // Four workers: the first four are cut off before the deadline, the rest
    // never start because their receipts lapse while waiting for a permit.
    let result = harness.run_batch(batch).await;
    assert_eq!(result.recoverable, 8);
    assert_eq!(result.succeeded, 0);
    assert_eq!(result.deleted, 0);
    assert_eq!(result.delete_failures, 0);
    assert_eq!(harness.processor.calls(), 4);
    assert!(harness.index.indexed().is_empty());

    // A competing consumer polls after the timeout and gets every message.
    tokio::time::advance(Duration::from_secs(3)).await;
    let redelivered = harness
        .queue
        .receive(10, Duration::ZERO, visibility)
        .await
        .unwrap();
    let mut redelivered_ids: Vec<String> = redelivered.iter().map(|m| m.id().to_owned()).collect();
    redelivered_ids.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(redelivered_ids, expected);
    assert!(redelivered.iter().all(|m| m.receive_count() == 2));

    assert!(harness.queue.deleted().is_empty());
    assert_eq!(harness.processor.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_outcomes_past_deadline_are_not_acted_on() {
    let harness = setup(
        ScriptedProcessor::default()
            .on("fatal", Script::Fail(|| Error::access_denied("docs/secret.txt"))),
        FakeIndex::default(),
    );
    harness.enqueue("ok.txt", "fine");
    harness.enqueue("secret.txt", "fatal");

    let batch = harness
        .queue
        .receive(10, Duration::ZERO, Duration::from_secs(5))
        .await
        .unwrap();
    let results = harness.dispatch(batch).await;
    assert!(results[0].1.is_success());
    assert_eq!(results[1].1.category(), Some(ErrorCategory::Fatal));

    tokio::time::advance(Duration::from_secs(10)).await;
    let result = harness.reduce(results, Instant::now()).await;

    assert_eq!(result.succeeded, 1);
    assert_eq!(result.fatal, 1);
    assert_eq!(result.stale_receipts, 2);
    assert_eq!(result.deleted, 0);
    assert_eq!(result.dead_lettered, 0);
    assert!(harness.queue.deleted().is_empty());
    assert!(harness.queue.sent().is_empty());
}
