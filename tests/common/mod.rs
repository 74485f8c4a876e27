//! Shared fixtures for the watchlist integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use omm_session::dispatch::EventSender;
use omm_session::rest::{RestExchange, RestRequest};
use omm_session::session::{TransportError, TransportEvent};
use omm_session::watchlist::msg::{
    Domain, InboundMsg, LoginFeatures, LoginRequest, OutboundBody, OutboundMsg, Payload,
    ServiceAction, ServiceInfo, ServiceUpdate, WireRequest, WireStreamId,
};
use omm_session::{
    ChannelTransport, EventLog, HostDescriptor, SimClock, StreamEvent, Watchlist, WatchlistConfig,
};

#[derive(Default)]
pub struct Wire {
    pub connects: Vec<HostDescriptor>,
    pub written: Vec<OutboundMsg>,
    pub closes: usize,
}

pub struct RecordingTransport(pub Arc<Mutex<Wire>>);

impl ChannelTransport for RecordingTransport {
    fn connect(
        &mut self,
        host: &HostDescriptor,
        _auth_token: Option<&str>,
    ) -> Result<(), TransportError> {
        self.0.lock().connects.push(host.clone());
        Ok(())
    }

    fn write(&mut self, msg: &OutboundMsg) -> Result<(), TransportError> {
        self.0.lock().written.push(msg.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {
        self.0.lock().closes += 1;
    }
}

/// Accepts requests and never answers; tests push responses themselves.
#[derive(Default)]
pub struct ParkedRest {
    pub submitted: Mutex<Vec<RestRequest>>,
}

impl RestExchange for ParkedRest {
    fn submit(&self, request: RestRequest, _reply: EventSender) {
        self.submitted.lock().push(request);
    }
}

pub fn features() -> LoginFeatures {
    LoginFeatures {
        supports_post: true,
        single_open: true,
        ..Default::default()
    }
}

pub fn service(id: u16, name: &str) -> ServiceUpdate {
    ServiceUpdate {
        service_id: id,
        action: ServiceAction::Add,
        info: Some(ServiceInfo::new(name)),
        groups: Vec::new(),
    }
}

pub struct Fixture {
    pub wl: Watchlist,
    pub clock: Arc<SimClock>,
    pub wire: Arc<Mutex<Wire>>,
    pub rest: Arc<ParkedRest>,
    pub tx: EventSender,
    pub log: EventLog,
}

impl Fixture {
    pub fn new(mut config: WatchlistConfig) -> Self {
        config.session.jitter_factor = 0.0;
        let clock = Arc::new(SimClock::new(0));
        let wire = Arc::new(Mutex::new(Wire::default()));
        let rest = Arc::new(ParkedRest::default());
        let wl = Watchlist::new(
            config,
            Box::new(RecordingTransport(Arc::clone(&wire))),
            rest.clone(),
            clock.clone(),
        );
        let tx = wl.event_sender();
        Self {
            wl,
            clock,
            wire,
            rest,
            tx,
            log: EventLog::new(),
        }
    }

    pub fn dispatch(&mut self) -> usize {
        self.wl.dispatch(&mut self.log).unwrap()
    }

    pub fn deliver(&mut self, msg: InboundMsg) {
        self.tx.message(msg);
        self.dispatch();
    }

    pub fn take_written(&self) -> Vec<OutboundMsg> {
        std::mem::take(&mut self.wire.lock().written)
    }

    pub fn connects(&self) -> Vec<HostDescriptor> {
        self.wire.lock().connects.clone()
    }

    /// Requests written on a domain since the last take.
    pub fn requests(&self, domain: Domain) -> Vec<(WireStreamId, WireRequest)> {
        self.take_written()
            .into_iter()
            .filter(|m| m.domain == domain)
            .filter_map(|m| m.as_request().cloned().map(|r| (m.stream_id, r)))
            .collect()
    }

    pub fn connected(&mut self, host: HostDescriptor) {
        self.tx.transport(TransportEvent::Connected { host });
        self.dispatch();
    }

    /// Answer the login and directory requests written after a connect.
    ///
    /// Returns the directory wire stream.
    pub fn answer_login(&mut self, services: Vec<ServiceUpdate>) -> WireStreamId {
        let login_wire = self
            .take_written()
            .iter()
            .find(|m| matches!(m.body, OutboundBody::Login { .. }))
            .map(|m| m.stream_id)
            .expect("login written after connect");
        self.deliver(InboundMsg::refresh(
            login_wire,
            Domain::Login,
            Payload::LoginFeatures(features()),
        ));
        let directory_wire = self
            .requests(Domain::Directory)
            .first()
            .map(|(w, _)| *w)
            .expect("directory requested after login");
        self.deliver(InboundMsg::refresh(
            directory_wire,
            Domain::Directory,
            Payload::Services(services),
        ));
        directory_wire
    }

    /// Login, connect to `host` and answer with one service.
    pub fn ready(&mut self, host: HostDescriptor, service_name: &str) -> WireStreamId {
        self.wl.open_login(LoginRequest::new("user")).unwrap();
        self.wl.connect().unwrap();
        self.connected(host);
        self.answer_login(vec![service(1, service_name)])
    }

    pub fn item_events(&self, stream_id: i32) -> Vec<&StreamEvent> {
        self.log.for_stream(stream_id)
    }
}
