//! Schedules a flaky job, feeds its result through a queue, and shows
//! cancellation of a second job before it fires.
//!
//! Run with `RUST_LOG=tether=debug cargo run --example scheduled_retry`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tether::{Context, LockFreeQueue, ScheduledTask, TaskError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (ctx, cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(10));
    let results = Arc::new(LockFreeQueue::new());

    let calls = Arc::new(AtomicU32::new(0));
    let flaky = {
        let (calls, results) = (Arc::clone(&calls), Arc::clone(&results));
        ScheduledTask::after(
            &ctx,
            Duration::from_millis(200),
            move |_ctx: &Context| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    return Err(format!("upstream unavailable (call {attempt})"));
                }
                results.enqueue(attempt);
                Ok(attempt)
            },
            3,
        )
    };

    let doomed = ScheduledTask::after(
        &ctx,
        Duration::from_secs(5),
        |_ctx: &Context| -> Result<(), TaskError> { unreachable!("cancelled before firing") },
        0,
    );

    let flaky_future = flaky.schedule().ok_or("flaky job was already scheduled")?;
    let doomed_future = doomed.schedule().ok_or("doomed job was already scheduled")?;
    doomed.cancel();

    println!("flaky job succeeded on call {}", flaky_future.wait_async().await?);
    println!("queued result: {:?}", results.poll_async(Duration::from_secs(1)).await);

    match doomed_future.wait_async().await {
        Err(err) if err.is_cancelled() => println!("doomed job: {err}"),
        other => println!("doomed job finished unexpectedly: {other:?}"),
    }

    cancel.cancel();
    Ok(())
}
