//! Push-mode retry flow against the in-memory queue

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use relayq::{HandlerError, HandlerFn, MemQueue, Message, QueueOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_retry_hint_schedules_redeliveries() {
    // The handler always fails with an explicit 300ms retry hint. With a
    // retry limit of 2 the message is attempted three times: two
    // hint-delayed retries, then a terminal delete.
    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let attempts_in_handler = attempts.clone();
    let handler = Arc::new(HandlerFn::new(move |_msg: &Message| {
        let attempts = attempts_in_handler.clone();
        async move {
            attempts.lock().push(Instant::now());
            Err(HandlerError::retry_after(
                Duration::from_millis(300),
                "calm down",
            ))
        }
    }));

    let mut opt = QueueOptions::new("hinted", handler);
    opt.min_workers = 1;
    opt.retry_limit = 2;
    opt.min_backoff = Duration::from_millis(1);
    let q = MemQueue::new(opt).unwrap();

    let added_at = Instant::now();
    q.add(Message::new(vec![])).await.unwrap();
    q.close().await.unwrap();

    let attempts = attempts.lock();
    assert_eq!(attempts.len(), 3);
    // First attempt is immediate, the rest follow the hint.
    assert!(attempts[0] - added_at < Duration::from_millis(150));
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(300));
    assert!(attempts[2] - attempts[1] >= Duration::from_millis(300));

    let stats = q.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.fails, 1);
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.deleting, 0);
}

#[tokio::test]
async fn test_close_waits_for_scheduled_redeliveries() {
    let handler = Arc::new(HandlerFn::new(|msg: &Message| {
        let reserved = msg.reserved_count;
        async move {
            if reserved == 0 {
                Err(HandlerError::msg("first try fails"))
            } else {
                Ok(())
            }
        }
    }));

    let mut opt = QueueOptions::new("close-wait", handler);
    opt.min_workers = 1;
    opt.retry_limit = 3;
    opt.min_backoff = Duration::from_millis(50);
    let q = MemQueue::new(opt).unwrap();

    q.add(Message::new(vec![])).await.unwrap();
    q.close().await.unwrap();

    // The redelivery happened before close returned.
    let stats = q.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.in_flight, 0);
}
