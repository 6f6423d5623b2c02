mod common;

use agency_runtime::{
    ContractorFactory, ContractorTimeouts, Manager, ManagerFactory, ManagerMedium,
    ProtocolFailure,
};
use agency_types::{ContractState, Message, Recipient};
use common::*;
use serde_json::{json, Value};

fn hire_contract(workers: &[(&str, f64)]) -> (Harness, EventLog) {
    let mut h = Harness::new();
    let log = event_log();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Hire));
    for (name, cost) in workers {
        let cost = *cost;
        let worker_log = log.clone();
        h.start(name)
            .register_interest(
                ContractorFactory::new("hire", move || Worker {
                    cost,
                    log: worker_log.clone(),
                }),
                false,
                None,
            )
            .unwrap();
    }
    (h, log)
}

#[test]
fn test_contract_grants_cheapest_and_completes() {
    let (mut h, log) = hire_contract(&[("w1", 3.0), ("w2", 1.0)]);
    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1"), to("w2")], json!({"task": "dig"}))
        .unwrap();
    assert!(handle.try_result().is_none());

    h.run();

    assert_eq!(handle.try_result(), Some(Ok(json!([{"done_by": "w2"}]))));
    let events = events(&log);
    assert!(events.contains(&"w1:rejected".to_string()));
    assert!(events.contains(&"w2:granted".to_string()));
    assert!(events.contains(&"w2:acknowledged".to_string()));
    for name in ["boss", "w1", "w2"] {
        assert!(h.agent(name).live_sessions().is_empty(), "{name} still busy");
    }
    assert_eq!(h.agency.scheduler().pending(), 0);
}

#[test]
fn test_all_refusals_expire_contract() {
    struct Refuser;
    impl agency_runtime::Contractor for Refuser {
        fn announced(
            &mut self,
            contractor: &mut agency_runtime::ContractorMedium,
            _announcement: &Message,
        ) {
            contractor.refuse(Message::refusal());
        }
    }

    let mut h = Harness::new();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Hire));
    h.start("w1")
        .register_interest(ContractorFactory::new("hire", || Refuser), false, None)
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], Value::Null)
        .unwrap();
    h.run();

    assert_eq!(handle.try_result(), Some(Err(ProtocolFailure::Expired)));
}

#[test]
fn test_broadcast_waits_for_announce_window() {
    let mut h = Harness::new();
    let log = event_log();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Hire));
    for (name, cost) in [("w1", 2.0), ("w2", 5.0)] {
        let worker_log = log.clone();
        h.start(name)
            .register_interest(
                ContractorFactory::new("hire", move || Worker {
                    cost,
                    log: worker_log.clone(),
                })
                .with_timeouts(ContractorTimeouts { bid: 30.0 }),
                true,
                None,
            )
            .unwrap();
    }

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![Recipient::broadcast("hire", "lobby")], Value::Null)
        .unwrap();
    h.run();

    let session = handle.session_id.clone();
    let manager = h
        .agent("boss")
        .protocol_as::<agency_runtime::AgencyManager>(&session)
        .unwrap();
    assert_eq!(manager.state(), ContractState::Announced);
    assert_eq!(manager.medium().contractors().len(), 2);
    assert_eq!(manager.medium().expected_bids(), None);
    assert!(handle.try_result().is_none());

    h.advance(10.0);

    assert_eq!(handle.try_result(), Some(Ok(json!([{"done_by": "w1"}]))));
    assert!(events(&log).contains(&"w2:rejected".to_string()));
}

#[test]
fn test_grant_rejects_every_other_bidder() {
    let (mut h, log) = hire_contract(&[("w1", 4.0), ("w2", 2.0), ("w3", 9.0)]);
    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1"), to("w2"), to("w3")], Value::Null)
        .unwrap();
    h.run();

    assert!(matches!(handle.try_result(), Some(Ok(_))));
    let mut events = events(&log);
    events.sort();
    assert_eq!(
        events,
        vec![
            "w1:rejected",
            "w2:acknowledged",
            "w2:granted",
            "w3:rejected",
        ]
    );
}

#[test]
fn test_unreported_grant_aborts_contract() {
    struct Lazy;
    impl agency_runtime::Contractor for Lazy {
        fn announced(
            &mut self,
            contractor: &mut agency_runtime::ContractorMedium,
            _announcement: &Message,
        ) {
            contractor.bid(Message::bid(1.0, Value::Null));
        }
    }

    let mut h = Harness::new();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Hire));
    h.start("w1")
        .register_interest(ContractorFactory::new("hire", || Lazy), false, None)
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], Value::Null)
        .unwrap();
    h.run();
    assert!(handle.try_result().is_none());

    h.advance(10.0);

    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::InitiatorFailed {
            state: "aborted".to_string()
        }))
    );
}

#[test]
fn test_contractor_defect_cancels_contract() {
    struct Defector;
    impl agency_runtime::Contractor for Defector {
        fn announced(
            &mut self,
            contractor: &mut agency_runtime::ContractorMedium,
            _announcement: &Message,
        ) {
            contractor.bid(Message::bid(1.0, Value::Null));
        }

        fn granted(&mut self, contractor: &mut agency_runtime::ContractorMedium, _grant: &Message) {
            contractor.defect(Message::cancellation(Some("busy".to_string())));
        }
    }

    let mut h = Harness::new();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Hire));
    h.start("w1")
        .register_interest(ContractorFactory::new("hire", || Defector), false, None)
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], Value::Null)
        .unwrap();
    h.run();

    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::Remote(
            "Other contractor cancelled the job with reason: busy".to_string()
        )))
    );
}

#[test]
fn test_result_is_delivered_once() {
    struct Decisive;
    impl Manager for Decisive {
        fn initiate(&mut self, manager: &mut ManagerMedium, _args: &Value) {
            manager.announce(Message::announcement(Value::Null));
        }

        fn closed(&mut self, manager: &mut ManagerMedium) {
            assert!(manager.terminate(json!("first")));
            assert!(!manager.terminate(json!("second")));
        }
    }

    let mut h = Harness::new();
    let log = event_log();
    h.start("boss")
        .register_factory(ManagerFactory::new("hire", || Decisive));
    let worker_log = log.clone();
    h.start("w1")
        .register_interest(
            ContractorFactory::new("hire", move || Worker {
                cost: 1.0,
                log: worker_log.clone(),
            }),
            false,
            None,
        )
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], Value::Null)
        .unwrap();
    h.run();

    assert_eq!(handle.try_result(), Some(Ok(json!("first"))));
    assert_eq!(handle.try_result(), None);
    assert_eq!(events(&log), vec!["w1:rejected"]);
}

#[test]
fn test_manager_without_announcement_fails() {
    struct Idle;
    impl Manager for Idle {
        fn initiate(&mut self, _manager: &mut ManagerMedium, _args: &Value) {}
    }

    let mut h = Harness::new();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Idle));
    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], Value::Null)
        .unwrap();

    h.advance(10.0);

    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::InitiatorFailed {
            state: "wtf".to_string()
        }))
    );
}

#[test]
fn test_progress_reports_reach_manager_before_completion() {
    struct Tracker(EventLog);
    impl Manager for Tracker {
        fn initiate(&mut self, manager: &mut ManagerMedium, args: &Value) {
            Hire.initiate(manager, args);
        }

        fn closed(&mut self, manager: &mut ManagerMedium) {
            Hire.closed(manager);
        }

        fn update_report(&mut self, _manager: &mut ManagerMedium, report: &Message) {
            self.0.lock().unwrap().push(format!("update:{}", report.body()));
        }

        fn completed(&mut self, manager: &mut ManagerMedium, reports: Vec<Message>) -> Value {
            self.0.lock().unwrap().push("completed".to_string());
            Hire.completed(manager, reports)
        }
    }

    struct Steady;
    impl agency_runtime::Contractor for Steady {
        fn announced(
            &mut self,
            contractor: &mut agency_runtime::ContractorMedium,
            _announcement: &Message,
        ) {
            contractor.bid(Message::bid(1.0, Value::Null));
        }

        fn granted(&mut self, contractor: &mut agency_runtime::ContractorMedium, _grant: &Message) {
            assert!(contractor.update(Message::update_report(json!(50))).is_some());
            contractor.complete(Message::final_report(json!("dug")));
        }
    }

    let mut h = Harness::new();
    let log = event_log();
    let manager_log = log.clone();
    h.start("boss").register_factory(ManagerFactory::new("hire", move || {
        Tracker(manager_log.clone())
    }));
    h.start("w1")
        .register_interest(ContractorFactory::new("hire", || Steady), false, None)
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], json!({}))
        .unwrap();
    h.run();

    assert_eq!(handle.try_result(), Some(Ok(json!(["dug"]))));
    assert_eq!(events(&log), vec!["update:50".to_string(), "completed".to_string()]);
}

#[test]
fn test_grant_with_updates_reports_periodically_until_complete() {
    struct Supervise(EventLog);
    impl Manager for Supervise {
        fn initiate(&mut self, manager: &mut ManagerMedium, args: &Value) {
            Hire.initiate(manager, args);
        }

        fn closed(&mut self, manager: &mut ManagerMedium) {
            let grants = manager
                .get_bids()
                .into_iter()
                .map(|bid| (bid, Message::grant_with_updates(Value::Null, 2.0)))
                .collect();
            manager.grant(grants);
        }

        fn update_report(&mut self, manager: &mut ManagerMedium, _report: &Message) {
            let now = manager.core().get_time() - START;
            self.0.lock().unwrap().push(format!("update@{now}"));
        }

        fn completed(&mut self, manager: &mut ManagerMedium, reports: Vec<Message>) -> Value {
            self.0.lock().unwrap().push("completed".to_string());
            Hire.completed(manager, reports)
        }
    }

    struct Reporting {
        sent: usize,
    }
    impl agency_runtime::Contractor for Reporting {
        fn announced(
            &mut self,
            contractor: &mut agency_runtime::ContractorMedium,
            _announcement: &Message,
        ) {
            contractor.bid(Message::bid(1.0, Value::Null));
        }

        fn reported(&mut self, contractor: &mut agency_runtime::ContractorMedium, report: &Message) {
            assert_eq!(report.kind(), agency_types::PayloadKind::UpdateReport);
            self.sent += 1;
            if self.sent == 3 {
                contractor.complete(Message::final_report(json!("done")));
            }
        }
    }

    let mut h = Harness::new();
    let log = event_log();
    let manager_log = log.clone();
    h.start("boss").register_factory(ManagerFactory::new("hire", move || {
        Supervise(manager_log.clone())
    }));
    h.start("w1")
        .register_interest(
            ContractorFactory::new("hire", || Reporting { sent: 0 }),
            false,
            None,
        )
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], json!({}))
        .unwrap();
    h.run();
    assert!(handle.try_result().is_none());

    for _ in 0..3 {
        h.advance(2.0);
    }
    assert_eq!(handle.try_result(), Some(Ok(json!(["done"]))));

    h.advance(10.0);
    assert_eq!(
        events(&log),
        vec!["update@2", "update@4", "update@6", "completed"]
    );
    assert!(h.agent("w1").live_sessions().is_empty());
    assert_eq!(h.agency.scheduler().pending(), 0);
}

#[test]
fn test_cancellation_from_unknown_bidder_keeps_contract_granted() {
    struct Holdout;
    impl agency_runtime::Contractor for Holdout {
        fn announced(
            &mut self,
            contractor: &mut agency_runtime::ContractorMedium,
            _announcement: &Message,
        ) {
            contractor.bid(Message::bid(1.0, Value::Null));
        }
    }

    let mut h = Harness::new();
    h.start("boss").register_factory(ManagerFactory::new("hire", || Hire));
    h.start("w1")
        .register_interest(ContractorFactory::new("hire", || Holdout), false, None)
        .unwrap();

    let mut handle = h
        .agent("boss")
        .initiate_protocol("hire", vec![to("w1")], Value::Null)
        .unwrap();
    h.run();
    let session = h.agent("boss").live_sessions()[0].clone();
    assert_eq!(h.agent("boss").protocol_state(&session).as_deref(), Some("granted"));

    let mut stray = Message::cancellation(Some("not mine".to_string()));
    stray.receiver_id = Some(session.clone());
    stray.reply_to = Some(to("ghost"));
    stray.traversal_id = Some("t-ghost".to_string());
    stray.expiration_time = Some(START + 5.0);
    h.agent("boss").on_message(stray).unwrap();

    assert_eq!(h.agent("boss").protocol_state(&session).as_deref(), Some("granted"));
    assert!(handle.try_result().is_none());

    h.advance(10.0);

    assert_eq!(
        handle.try_result(),
        Some(Err(ProtocolFailure::InitiatorFailed {
            state: "aborted".to_string()
        }))
    );
}
