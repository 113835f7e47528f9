//! Connection Manager Tests
//!
//! Drives the lifecycle state machine with synthetic events and checks the
//! actions it requests.

use okx_feed_client::manager::Backoff;
use okx_feed_client::stats::Series;
use okx_feed_client::{
    Action, ConnectionManager, ConnectionState, Event, RetryPolicy, StatsAggregator, TimerKind,
};
use proptest::prelude::*;
use std::time::{Duration, Instant};

const SUBSCRIBE: &str = r#"{"op":"subscribe","args":[{"channel":"books","instId":"BTC-USDT"}]}"#;

fn manager_with(policy: RetryPolicy) -> ConnectionManager {
    ConnectionManager::new(
        policy,
        SUBSCRIBE.to_string(),
        Duration::from_secs(1),
        StatsAggregator::new().unwrap(),
    )
}

fn manager() -> ConnectionManager {
    manager_with(RetryPolicy::default())
}

fn reconnect_delay(actions: &[Action]) -> Option<Duration> {
    actions.iter().find_map(|action| match action {
        Action::Schedule { timer: TimerKind::Reconnect, delay } => Some(*delay),
        _ => None,
    })
}

/// Bring a fresh manager to `Established` at `at`.
fn establish(manager: &mut ConnectionManager, at: Instant) -> Vec<Action> {
    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    manager.handle_event(Event::Established { at })
}

#[test]
fn test_reconnect_timer_issues_connect() {
    let mut manager = manager();
    let actions = manager.handle_event(Event::TimerFired(TimerKind::Reconnect));

    assert_eq!(actions, vec![Action::Connect]);
    assert_eq!(manager.state(), ConnectionState::Connecting);
}

#[test]
fn test_duplicate_connect_is_guarded() {
    let mut manager = manager();
    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));

    let actions = manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    assert!(actions.is_empty());
    assert_eq!(manager.state(), ConnectionState::Connecting);
}

#[test]
fn test_established_subscribes_and_arms_summary() {
    let mut manager = manager();
    let actions = establish(&mut manager, Instant::now());

    assert_eq!(manager.state(), ConnectionState::Established);
    assert_eq!(
        actions,
        vec![
            Action::Schedule { timer: TimerKind::Summary, delay: Duration::from_secs(1) },
            Action::Send(SUBSCRIBE.to_string()),
        ]
    );
}

#[test]
fn test_established_resets_attempts_and_stats() {
    let mut manager = manager();
    let t0 = Instant::now();
    establish(&mut manager, t0);
    manager.handle_event(Event::Message { payload: b"abc".to_vec(), at: t0 + Duration::from_millis(5) });
    manager.handle_event(Event::Closed { reason: None });
    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    manager.handle_event(Event::ConnectFailed("refused".into()));
    assert_eq!(manager.attempt_count(), 2);
    assert!(!manager.stats().range(Series::Latency).is_empty());

    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    manager.handle_event(Event::Established { at: Instant::now() });

    assert_eq!(manager.attempt_count(), 0);
    assert!(manager.stats().range(Series::Latency).is_empty());
    assert!(manager.stats().range(Series::PriceProxy).is_empty());
}

#[test]
fn test_retry_budget_exhausted_after_ten_failures() {
    let mut manager = manager();

    for attempt in 1..=10u32 {
        manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
        let actions = manager.handle_event(Event::ConnectFailed("dns".into()));
        assert!(reconnect_delay(&actions).is_some(), "retry {} not scheduled", attempt);
        assert_eq!(manager.attempt_count(), attempt);
    }
    assert!(manager.is_exhausted());

    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    let actions = manager.handle_event(Event::ConnectFailed("dns".into()));
    assert!(actions.is_empty());
    assert_eq!(manager.attempt_count(), 10);
    assert_eq!(manager.state(), ConnectionState::PendingRetry);
}

#[test]
fn test_exponential_backoff_grows() {
    let mut manager = manager();

    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    let first = reconnect_delay(&manager.handle_event(Event::ConnectFailed("a".into()))).unwrap();
    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    let second = reconnect_delay(&manager.handle_event(Event::ConnectFailed("b".into()))).unwrap();

    assert_eq!(first, Duration::from_secs(2));
    assert_eq!(second, Duration::from_secs(4));
    assert!(second > first);
}

#[test]
fn test_fixed_backoff_is_constant() {
    let mut manager = manager_with(RetryPolicy { backoff: Backoff::Fixed, ..Default::default() });

    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    let first = reconnect_delay(&manager.handle_event(Event::ConnectFailed("a".into()))).unwrap();
    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    let second = reconnect_delay(&manager.handle_event(Event::ConnectFailed("b".into()))).unwrap();

    assert_eq!(first, Duration::from_secs(1));
    assert_eq!(second, first);
}

#[test]
fn test_close_reconnects_after_base_interval() {
    let mut manager = manager();
    establish(&mut manager, Instant::now());

    let actions = manager.handle_event(Event::Closed { reason: Some("1006 abnormal".into()) });
    assert_eq!(manager.state(), ConnectionState::PendingRetry);
    assert_eq!(reconnect_delay(&actions), Some(Duration::from_secs(1)));
}

#[test]
fn test_zero_length_message_is_ignored() {
    let mut manager = manager();
    let t0 = Instant::now();
    establish(&mut manager, t0);

    let actions = manager.handle_event(Event::Message { payload: Vec::new(), at: t0 + Duration::from_millis(3) });
    assert!(actions.is_empty());
    assert_eq!(manager.state(), ConnectionState::Established);
    assert!(manager.stats().range(Series::Latency).is_empty());
    assert!(manager.stats().range(Series::PriceProxy).is_empty());
}

#[test]
fn test_latency_measured_since_previous_message() {
    let mut manager = manager();
    let t0 = Instant::now();
    establish(&mut manager, t0);

    manager.handle_event(Event::Message { payload: b"first".to_vec(), at: t0 + Duration::from_micros(500) });
    manager.handle_event(Event::Message { payload: b"second!".to_vec(), at: t0 + Duration::from_micros(800) });

    let latency = manager.stats().range(Series::Latency);
    assert_eq!(latency.samples(), 2);
    assert_eq!(latency.lowest(), 300);
    assert_eq!(latency.highest(), 500);

    let price = manager.stats().range(Series::PriceProxy);
    assert_eq!(price.lowest(), 5);
    assert_eq!(price.highest(), 7);
}

#[test]
fn test_message_outside_established_is_dropped() {
    let mut manager = manager();
    manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
    manager.handle_event(Event::Message { payload: b"late".to_vec(), at: Instant::now() });

    assert!(manager.stats().range(Series::PriceProxy).is_empty());
}

#[test]
fn test_summary_timer_reports_and_rearms() {
    let mut manager = manager();
    let t0 = Instant::now();
    establish(&mut manager, t0);
    manager.handle_event(Event::Message { payload: b"x".to_vec(), at: t0 + Duration::from_micros(100) });

    let actions = manager.handle_event(Event::TimerFired(TimerKind::Summary));
    assert_eq!(actions.len(), 2);
    match &actions[0] {
        Action::Report(summary) => {
            assert_eq!(summary.latency.unwrap().count, 1);
            assert_eq!(summary.price.unwrap().max, 1);
        }
        other => panic!("expected report, got {:?}", other),
    }
    assert_eq!(
        actions[1],
        Action::Schedule { timer: TimerKind::Summary, delay: Duration::from_secs(1) }
    );
}

#[test]
fn test_empty_summary_only_rearms() {
    let mut manager = manager();
    let actions = manager.handle_event(Event::TimerFired(TimerKind::Summary));
    assert_eq!(
        actions,
        vec![Action::Schedule { timer: TimerKind::Summary, delay: Duration::from_secs(1) }]
    );
}

proptest! {
    /// Any run of consecutive failures schedules exactly min(n, max_attempts) retries.
    #[test]
    fn prop_failures_never_exceed_budget(max_attempts in 0u32..15, failures in 0u32..30) {
        let mut manager = manager_with(RetryPolicy { max_attempts, ..Default::default() });
        let mut scheduled = 0u32;

        for _ in 0..failures {
            manager.handle_event(Event::TimerFired(TimerKind::Reconnect));
            if reconnect_delay(&manager.handle_event(Event::ConnectFailed("x".into()))).is_some() {
                scheduled += 1;
            }
        }

        prop_assert_eq!(scheduled, failures.min(max_attempts));
        prop_assert!(manager.attempt_count() <= max_attempts);
    }

    /// Exponential delays are non-decreasing in the attempt number.
    #[test]
    fn prop_exponential_delay_monotonic(attempt in 1u32..40) {
        let policy = RetryPolicy::default();
        prop_assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
    }
}
