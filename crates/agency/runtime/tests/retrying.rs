mod common;

use agency_runtime::{
    ProtocolFailure, ReplierFactory, RequesterFactory, RequesterTimeouts, RetryPolicy,
    RetryStatus, RetryingProtocol,
};
use agency_types::SessionId;
use common::*;
use serde_json::json;

fn client() -> Harness {
    let mut h = Harness::new();
    h.start("client").register_factory(
        RequesterFactory::new("ask", || Ask).with_timeouts(RequesterTimeouts { timeout: 5.0 }),
    );
    h
}

fn status(h: &mut Harness, session: &SessionId) -> RetryStatus {
    h.agent("client")
        .protocol_as::<RetryingProtocol>(session)
        .unwrap()
        .get_status()
}

#[test]
fn test_retry_doubles_delay_until_exhausted() {
    let mut h = client();
    let policy = RetryPolicy {
        max_retries: Some(3),
        initial_delay: 1.0,
        max_delay: None,
    };
    let mut handle = h
        .agent("client")
        .retrying("ask", vec![to("nobody")], json!(1), policy)
        .unwrap();
    let session = handle.session_id.clone();
    assert_eq!(handle.protocol_id, "retried-ask");

    let first = status(&mut h, &session);
    assert_eq!(first.attempt, 1);
    assert!(first.running_now);

    // Attempt fails after 5s, then waits 1, 2 and 4 seconds between tries.
    h.advance(5.0);
    let waiting = status(&mut h, &session);
    assert!(!waiting.running_now);
    assert_eq!(waiting.delay, 2.0);

    for wait in [1.0, 2.0, 4.0] {
        h.advance(wait);
        assert!(status(&mut h, &session).running_now);
        if wait < 4.0 {
            h.advance(5.0);
        }
    }

    let last = status(&mut h, &session);
    assert_eq!(last.attempt, 4);
    assert_eq!(last.delay, 8.0);
    assert!(handle.try_result().is_none());

    h.advance(5.0);
    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::InitiatorFailed {
            state: "closed".to_string()
        }))
    );
    assert!(h.agent("client").live_sessions().is_empty());
}

#[test]
fn test_retry_succeeds_once_replier_appears() {
    let mut h = client();
    let mut handle = h
        .agent("client")
        .retrying("ask", vec![to("server")], json!("ping"), RetryPolicy::default())
        .unwrap();

    h.advance(5.0);
    assert!(handle.try_result().is_none());

    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();
    h.advance(1.0);

    assert_eq!(handle.try_result(), Some(Ok(json!({"echo": "ping"}))));
}

#[test]
fn test_retried_prefix_uses_default_policy() {
    let mut h = client();
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();

    let mut handle = h
        .agent("client")
        .initiate_protocol("retried-ask", vec![to("server")], json!({"args": "x"}))
        .unwrap();
    h.run();

    assert_eq!(handle.try_result(), Some(Ok(json!({"echo": "x"}))));
}

#[test]
fn test_give_up_while_waiting() {
    let mut h = client();
    let mut handle = h
        .agent("client")
        .retrying("ask", vec![to("nobody")], json!(1), RetryPolicy::default())
        .unwrap();
    let session = handle.session_id.clone();

    h.advance(5.0);
    assert!(!status(&mut h, &session).running_now);

    h.agent("client").give_up(&session).unwrap();

    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::GaveUp { attempts: 1 }))
    );
    assert_eq!(h.agency.scheduler().pending(), 0);
}

#[test]
fn test_give_up_while_running_expires_attempt() {
    let mut h = client();
    let mut handle = h
        .agent("client")
        .retrying("ask", vec![to("nobody")], json!(1), RetryPolicy::default())
        .unwrap();
    let session = handle.session_id.clone();

    h.agent("client").give_up(&session).unwrap();

    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::InitiatorFailed {
            state: "closed".to_string()
        }))
    );
    assert!(h.agent("client").live_sessions().is_empty());
}
