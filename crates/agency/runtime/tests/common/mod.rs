#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use agency_journal::{JournalKeeper, MemoryJournal};
use agency_runtime::{
    Agency, AgencyAgent, AgencyConfig, Contractor, ContractorMedium, EmuMessaging, ManualClock,
    Manager, ManagerMedium, Replier, ReplierMedium, Requester, RequesterMedium,
};
use agency_types::{AgentId, Message, Recipient};
use serde_json::{json, Value};

pub const START: f64 = 1000.0;

pub struct Harness {
    pub agency: Agency,
    pub clock: Arc<ManualClock>,
    pub messaging: Arc<EmuMessaging>,
    pub keeper: Arc<MemoryJournal>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let messaging = Arc::new(EmuMessaging::new());
        let keeper = Arc::new(MemoryJournal::new());
        let agency = Agency::with_keeper(
            AgencyConfig::default(),
            clock.clone(),
            messaging.clone(),
            Some(keeper.clone() as Arc<dyn JournalKeeper>),
        );
        Self {
            agency,
            clock,
            messaging,
            keeper,
        }
    }

    pub fn start(&mut self, name: &str) -> &mut AgencyAgent {
        self.agency.start_agent(name).unwrap()
    }

    pub fn agent(&mut self, name: &str) -> &mut AgencyAgent {
        self.agency.agent_mut(&AgentId::new(name)).unwrap()
    }

    pub fn run(&mut self) -> usize {
        self.agency.run_pending()
    }

    pub fn advance(&mut self, seconds: f64) -> usize {
        self.clock.advance(seconds);
        self.agency.run_pending()
    }
}

pub fn to(name: &str) -> Recipient {
    Recipient::agent(&AgentId::new(name), "lobby")
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Announces the args, grants the cheapest bid once the window closes and
/// returns the report bodies.
pub struct Hire;

impl Manager for Hire {
    fn initiate(&mut self, manager: &mut ManagerMedium, args: &Value) {
        manager.announce(Message::announcement(args.clone()));
    }

    fn closed(&mut self, manager: &mut ManagerMedium) {
        let grants = Message::pick_best(&manager.get_bids(), 1)
            .into_iter()
            .map(|bid| (bid, Message::grant(json!("go"))))
            .collect();
        manager.grant(grants);
    }

    fn completed(&mut self, _manager: &mut ManagerMedium, reports: Vec<Message>) -> Value {
        Value::Array(reports.iter().map(|r| r.body().clone()).collect())
    }
}

/// Bids `cost`, reports its own agent id when granted.
pub struct Worker {
    pub cost: f64,
    pub log: EventLog,
}

impl Worker {
    fn record(&self, contractor: &ContractorMedium, event: &str) {
        let agent = contractor.core().medium().agent_id().to_string();
        self.log.lock().unwrap().push(format!("{agent}:{event}"));
    }
}

impl Contractor for Worker {
    fn announced(&mut self, contractor: &mut ContractorMedium, _announcement: &Message) {
        contractor.bid(Message::bid(self.cost, Value::Null));
    }

    fn rejected(&mut self, contractor: &mut ContractorMedium, _rejection: &Message) {
        self.record(contractor, "rejected");
    }

    fn granted(&mut self, contractor: &mut ContractorMedium, _grant: &Message) {
        self.record(contractor, "granted");
        let agent = contractor.core().medium().agent_id().to_string();
        contractor.complete(Message::final_report(json!({ "done_by": agent })));
    }

    fn acknowledged(&mut self, contractor: &mut ContractorMedium, _ack: &Message) {
        self.record(contractor, "acknowledged");
    }

    fn bid_expired(&mut self, contractor: &mut ContractorMedium) {
        self.record(contractor, "bid_expired");
    }

    fn cancelled(&mut self, contractor: &mut ContractorMedium, _cancellation: &Message) {
        self.record(contractor, "cancelled");
    }
}

/// Sends the args as the request body.
pub struct Ask;

impl Requester for Ask {
    fn initiate(&mut self, requester: &mut RequesterMedium, args: &Value) {
        requester.request(Message::request(args.clone()));
    }
}

/// Echoes the request body back.
pub struct Echo;

impl Replier for Echo {
    fn requested(&mut self, replier: &mut ReplierMedium, request: &Message) {
        replier.reply(Message::response(json!({ "echo": request.body() })));
    }
}

/// Never answers.
pub struct Silent;

impl Replier for Silent {
    fn requested(&mut self, _replier: &mut ReplierMedium, _request: &Message) {}
}
