//! Retry, backoff, classification, and dead-letter behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use runner_core::testing::MockTask;
use runner_core::{EnqueueOptions, ExecutionOutcome, TaskDescriptor};

use common::{platform, sleep_ms};

fn flaky(task: Arc<MockTask>, max_retries: u32) -> TaskDescriptor {
    TaskDescriptor::builder()
        .job_type("flaky")
        .display_name("Flaky")
        .max_retries(max_retries)
        .retry_backoff_base(Duration::from_millis(20))
        .retry_backoff_max(Duration::from_millis(100))
        .task(task)
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_with_exponential_backoff_then_succeeds() {
    let task = Arc::new(MockTask::new().fail_first(2));
    let p = platform(vec![flaky(task.clone(), 2)]);
    p.start().await.unwrap();

    p.enqueue("flaky", None, EnqueueOptions::default()).unwrap();
    sleep_ms(500).await;
    p.stop(Duration::from_secs(1)).await;

    let times = task.execution_times();
    assert_eq!(times.len(), 3);
    let first_gap = (times[1] - times[0]).num_milliseconds();
    let second_gap = (times[2] - times[1]).num_milliseconds();
    assert!(first_gap >= 20, "first retry after {first_gap}ms");
    assert!(second_gap >= 40, "second retry after {second_gap}ms");

    let snapshot = p.metrics();
    let t = snapshot.for_type("flaky").unwrap();
    assert_eq!(t.failures_total, 2);
    assert_eq!(t.successes_total, 1);
    assert_eq!(t.dead_lettered_total, 0);
    assert_eq!(p.dead_letter().depth(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_land_in_dead_letter() {
    let task = Arc::new(MockTask::new().fail_first(u32::MAX));
    let p = platform(vec![flaky(task.clone(), 1)]);
    p.start().await.unwrap();

    p.enqueue("flaky", None, EnqueueOptions::default()).unwrap();
    sleep_ms(300).await;
    p.stop(Duration::from_secs(1)).await;

    assert_eq!(task.execution_count(), 2);
    let entries = p.dead_letter().peek();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].invocation.attempt, 2);
    assert_eq!(entries[0].invocation.job_type, "flaky");

    let snapshot = p.metrics();
    let t = snapshot.for_type("flaky").unwrap();
    assert_eq!(t.dead_lettered_total, 1);
    assert_eq!(t.failures_total, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_max_retries_dead_letters_after_one_attempt() {
    let task = Arc::new(MockTask::new().fail_first(u32::MAX));
    let p = platform(vec![flaky(task.clone(), 0)]);
    p.start().await.unwrap();

    p.enqueue("flaky", None, EnqueueOptions::default()).unwrap();
    sleep_ms(200).await;
    p.stop(Duration::from_secs(1)).await;

    assert_eq!(task.execution_count(), 1);
    let entries = p.dead_letter().peek();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].invocation.attempt, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_errors_skip_retries_entirely() {
    let task = Arc::new(MockTask::new().fail_first(u32::MAX).with_terminal_errors());
    let p = platform(vec![flaky(task.clone(), 3)]);
    p.start().await.unwrap();

    p.enqueue("flaky", None, EnqueueOptions::default()).unwrap();
    sleep_ms(200).await;
    p.stop(Duration::from_secs(1)).await;

    assert_eq!(task.execution_count(), 1);
    assert_eq!(p.dead_letter().depth(), 1);

    let records = p.recent_records(16);
    assert!(records
        .iter()
        .any(|r| r.outcome == ExecutionOutcome::FailedTerminal));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_task_is_dead_lettered_and_worker_survives() {
    let panicking = Arc::new(MockTask::new().panic_on_execute());
    let healthy = Arc::new(MockTask::new());
    let bad = TaskDescriptor::builder()
        .job_type("bad")
        .display_name("Bad")
        .max_retries(0)
        .task(panicking)
        .build();
    let good = TaskDescriptor::builder()
        .job_type("good")
        .display_name("Good")
        .task(healthy.clone())
        .build();

    let p = platform(vec![bad, good]);
    p.start().await.unwrap();

    p.enqueue("bad", None, EnqueueOptions::default()).unwrap();
    sleep_ms(100).await;

    // The pool keeps serving other work after the panic.
    p.enqueue("good", None, EnqueueOptions::default()).unwrap();
    sleep_ms(100).await;
    p.stop(Duration::from_secs(1)).await;

    assert_eq!(healthy.execution_count(), 1);
    assert_eq!(p.dead_letter().depth(), 1);
    let entries = p.dead_letter().peek();
    assert!(entries[0].error.contains("panic"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_of_idempotent_task_retries_then_dead_letters() {
    let task = Arc::new(MockTask::new().with_delay(Duration::from_secs(10)));
    let descriptor = TaskDescriptor::builder()
        .job_type("slow")
        .display_name("Slow")
        .timeout(Duration::from_millis(40))
        .max_retries(1)
        .retry_backoff_base(Duration::from_millis(10))
        .retry_backoff_max(Duration::from_millis(20))
        .task(task.clone())
        .build();

    let p = platform(vec![descriptor]);
    p.start().await.unwrap();

    p.enqueue("slow", None, EnqueueOptions::default()).unwrap();
    sleep_ms(400).await;
    p.stop(Duration::from_secs(1)).await;

    assert_eq!(task.execution_count(), 2);
    let snapshot = p.metrics();
    let t = snapshot.for_type("slow").unwrap();
    assert_eq!(t.timed_out_total, 2);
    assert_eq!(t.dead_lettered_total, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_of_non_idempotent_task_is_terminal() {
    let task = Arc::new(MockTask::new().with_delay(Duration::from_secs(10)));
    let descriptor = TaskDescriptor::builder()
        .job_type("transfer")
        .display_name("Transfer")
        .timeout(Duration::from_millis(40))
        .max_retries(3)
        .idempotent(false)
        .task(task.clone())
        .build();

    let p = platform(vec![descriptor]);
    p.start().await.unwrap();

    p.enqueue("transfer", None, EnqueueOptions::default())
        .unwrap();
    sleep_ms(300).await;
    p.stop(Duration::from_secs(1)).await;

    // No retry: a repeat could double-commit side effects.
    assert_eq!(task.execution_count(), 1);
    let snapshot = p.metrics();
    let t = snapshot.for_type("transfer").unwrap();
    assert_eq!(t.timed_out_total, 1);
    assert_eq!(t.dead_lettered_total, 1);
}
