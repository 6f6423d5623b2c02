mod common;

use agency_runtime::{
    AgencyError, ProtocolFailure, ReplierFactory, RequesterFactory, RequesterTimeouts,
};
use agency_types::{AgentId, Message, PayloadKind, ProtocolType, Recipient, SessionId};
use common::*;
use serde_json::{json, Value};

fn ask_with_timeout(timeout: f64) -> RequesterFactory {
    RequesterFactory::new("ask", || Ask).with_timeouts(RequesterTimeouts { timeout })
}

#[test]
fn test_request_gets_reply() {
    let mut h = Harness::new();
    h.start("client").register_factory(ask_with_timeout(5.0));
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();

    let mut handle = h
        .agent("client")
        .initiate_protocol("ask", vec![to("server")], json!({"q": 1}))
        .unwrap();
    h.run();

    assert_eq!(handle.try_result(), Some(Ok(json!({"echo": {"q": 1}}))));
    assert_eq!(h.agency.scheduler().pending(), 0);

    // The requester's deadline passing later changes nothing.
    h.advance(30.0);
    assert_eq!(handle.try_result(), None);
    assert!(h.agent("client").live_sessions().is_empty());
    assert!(h.agent("server").live_sessions().is_empty());
}

#[test]
fn test_request_without_reply_closes() {
    let mut h = Harness::new();
    h.start("client").register_factory(ask_with_timeout(5.0));
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Silent), false, None)
        .unwrap();

    let mut handle = h
        .agent("client")
        .initiate_protocol("ask", vec![to("server")], Value::Null)
        .unwrap();
    h.run();
    assert_eq!(h.agent("server").live_sessions().len(), 1);

    h.advance(4.0);
    assert!(handle.try_result().is_none());

    h.advance(1.0);
    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::InitiatorFailed {
            state: "closed".to_string()
        }))
    );
    // The replier expires together with the request.
    assert!(h.agent("server").live_sessions().is_empty());
}

#[test]
fn test_expired_message_is_dropped() {
    let mut h = Harness::new();
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();

    let mut msg = Message::request(json!(1)).with_protocol_id("ask");
    msg.sender_id = Some(SessionId::from("remote"));
    msg.reply_to = Some(to("client"));
    msg.expiration_time = Some(START - 1.0);

    let server = h.agent("server");
    assert!(!server.on_message(msg).unwrap());
    assert!(server.live_sessions().is_empty());
}

#[test]
fn test_message_without_interest_is_refused() {
    let mut h = Harness::new();
    h.start("server");

    let msg = Message::request(json!(1)).with_protocol_id("nobody-listens");
    assert!(!h.agent("server").on_message(msg).unwrap());

    // Right protocol, wrong opening message.
    h.agent("server")
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();
    let msg = Message::response(json!(1)).with_protocol_id("ask");
    assert!(!h.agent("server").on_message(msg).unwrap());
}

#[test]
fn test_duplicate_interest_is_rejected() {
    let mut h = Harness::new();
    let server = h.start("server");
    server
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();
    let err = server
        .register_interest(ReplierFactory::new("ask", || Silent), true, None)
        .unwrap_err();
    assert!(matches!(
        err,
        AgencyError::DuplicateInterest {
            protocol_type: ProtocolType::Request,
            ..
        }
    ));

    assert!(server.revoke_interest(ProtocolType::Request, "ask"));
    assert!(server.interest(ProtocolType::Request, "ask").is_none());
}

#[test]
fn test_unknown_protocol_cannot_start() {
    let mut h = Harness::new();
    let err = h
        .start("client")
        .initiate_protocol("ask", vec![to("server")], Value::Null)
        .unwrap_err();
    assert!(matches!(err, AgencyError::UnknownFactory(id) if id == "ask"));
}

#[test]
fn test_repeated_traversal_is_answered_as_duplicate() {
    let mut h = Harness::new();
    h.start("boss");
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Silent), false, None)
        .unwrap();

    let mut msg = Message::request(json!("once")).with_protocol_id("ask");
    msg.sender_id = Some(SessionId::from("remote"));
    msg.reply_to = Some(to("boss"));
    msg.traversal_id = Some("t-1".to_string());

    let server = h.agent("server");
    assert!(server.on_message(msg.clone()).unwrap());
    assert!(server.on_message(msg).unwrap());
    assert_eq!(server.live_sessions().len(), 1);

    let boss = AgentId::new("boss");
    assert_eq!(h.messaging.queued(&boss), 1);
    let reply = h.agency.messaging().next_message(&boss).unwrap();
    assert_eq!(reply.kind(), PayloadKind::Duplicate);
    assert_eq!(reply.receiver_id, Some(SessionId::from("remote")));
    assert_eq!(reply.reply_to, Some(to("server")));
}

#[test]
fn test_concurrency_limit_queues_conversations() {
    let mut h = Harness::new();
    h.start("a").register_factory(ask_with_timeout(5.0));
    h.start("b").register_factory(ask_with_timeout(20.0));
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Silent), false, Some(1))
        .unwrap();

    h.agent("a")
        .initiate_protocol("ask", vec![to("server")], json!("a"))
        .unwrap();
    h.agent("b")
        .initiate_protocol("ask", vec![to("server")], json!("b"))
        .unwrap();
    h.run();

    let interest = h.agent("server").interest(ProtocolType::Request, "ask").unwrap();
    assert_eq!(interest.live_count(), 1);
    assert_eq!(interest.queued_count(), 1);

    // The first conversation expires and frees the slot.
    h.advance(5.0);

    let interest = h.agent("server").interest(ProtocolType::Request, "ask").unwrap();
    assert_eq!(interest.live_count(), 1);
    assert_eq!(interest.queued_count(), 0);
}

#[test]
fn test_notifications_reach_handler() {
    use std::sync::{Arc, Mutex};

    let mut h = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.start("listener")
        .register_notification(
            "news",
            agency_runtime::NotificationFn(move |_medium: &agency_runtime::AgentMedium, msg: &Message| {
                sink.lock().unwrap().push(msg.body().clone());
            }),
            true,
        )
        .unwrap();

    let msg = Message::notification(json!("hello")).with_protocol_id("news");
    h.agency
        .messaging()
        .post(&[Recipient::broadcast("news", "lobby")], &msg)
        .unwrap();
    h.run();

    assert_eq!(*seen.lock().unwrap(), vec![json!("hello")]);
    assert!(h.agent("listener").live_sessions().is_empty());
}

#[test]
fn test_redelivered_message_is_processed_once() {
    let mut h = Harness::new();
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Silent), false, None)
        .unwrap();

    let mut msg = Message::request(json!("once")).with_protocol_id("ask");
    msg.message_id = Some("m1".to_string());
    msg.sender_id = Some(SessionId::from("remote"));
    msg.reply_to = Some(to("client"));
    msg.traversal_id = Some("t-1".to_string());
    msg.expiration_time = Some(START + 10.0);

    let server = h.agent("server");
    assert!(server.on_message(msg.clone()).unwrap());
    assert!(!server.on_message(msg.clone()).unwrap());
    assert_eq!(server.live_sessions().len(), 1);

    // A message id is forgotten once its message expired.
    h.advance(11.0);
    let mut late = msg;
    late.traversal_id = Some("t-2".to_string());
    late.expiration_time = Some(START + 30.0);
    assert!(h.agent("server").on_message(late).unwrap());
}

#[test]
fn test_first_message_without_traversal_is_dropped() {
    let mut h = Harness::new();
    h.start("server")
        .register_interest(ReplierFactory::new("ask", || Echo), false, None)
        .unwrap();

    let mut msg = Message::request(json!(1)).with_protocol_id("ask");
    msg.sender_id = Some(SessionId::from("remote"));
    msg.reply_to = Some(to("client"));

    let server = h.agent("server");
    assert!(!server.on_message(msg).unwrap());
    assert!(server.live_sessions().is_empty());
}

#[test]
fn test_requests_carry_traversal_id() {
    let mut h = Harness::new();
    h.start("client").register_factory(ask_with_timeout(5.0));
    h.start("server");

    h.agent("client")
        .initiate_protocol("ask", vec![to("server")], json!(1))
        .unwrap();
    let sent = h
        .agency
        .messaging()
        .next_message(&AgentId::new("server"))
        .unwrap();
    assert!(sent.traversal_id.is_some());
    assert!(sent.message_id.is_some());
}
