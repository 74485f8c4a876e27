//! Watchlist scenarios driven end to end through the dispatch queue
//!
//! A recording transport stands in for the channel and a recording REST exchange for HTTP;
//! inbound traffic is pushed through `EventSender` exactly as a transport reader would.

use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::clock::SimClock;
use crate::rest::{AuthTokenEvent, RestPurpose, RestRequest, RestResponse};
use crate::session::{HostDescriptor, TransportError, TransportEvent};
use crate::watchlist::dictionary::{DictionaryDownloadMode, ENUM_DICTIONARY, FIELD_DICTIONARY};
use crate::watchlist::event::EventLog;
use crate::watchlist::msg::{
    DataState, FieldEntry, GroupChange, GroupId, LoginRequest, Payload, ServiceAction,
    ServiceInfo, ServiceUpdate, View, ViewValue, WireRequest,
};

const FEED: &str = "DIRECT_FEED";

// =============================================================================
// FIXTURES
// =============================================================================

#[derive(Default)]
struct Wire {
    connects: Vec<HostDescriptor>,
    written: Vec<OutboundMsg>,
}

struct RecordingTransport(Arc<Mutex<Wire>>);

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

    fn close(&mut self) {}
}

#[derive(Default)]
struct RecordingRest {
    submitted: Mutex<Vec<RestRequest>>,
}

impl RestExchange for RecordingRest {
    fn submit(&self, request: RestRequest, _reply: EventSender) {
        self.submitted.lock().push(request);
    }
}

struct Harness {
    wl: Watchlist,
    clock: Arc<SimClock>,
    wire: Arc<Mutex<Wire>>,
    rest: Arc<RecordingRest>,
    tx: EventSender,
    log: EventLog,
    login_wire: WireStreamId,
    directory_wire: WireStreamId,
}

fn config() -> WatchlistConfig {
    let mut config = WatchlistConfig::default();
    config.session.jitter_factor = 0.0;
    config
}

fn features() -> LoginFeatures {
    LoginFeatures {
        supports_post: true,
        supports_optimized_pause_resume: true,
        single_open: true,
        ..Default::default()
    }
}

fn add_service(id: ServiceId, name: &str) -> ServiceUpdate {
    ServiceUpdate {
        service_id: id,
        action: ServiceAction::Add,
        info: Some(ServiceInfo::new(name)),
        groups: Vec::new(),
    }
}

fn delete_service(id: ServiceId) -> ServiceUpdate {
    ServiceUpdate {
        service_id: id,
        action: ServiceAction::Delete,
        info: None,
        groups: Vec::new(),
    }
}

fn fields(ids: &[i32]) -> Payload {
    Payload::Fields(
        ids.iter()
            .map(|id| FieldEntry::new(*id, format!("F{}", id), "1.0"))
            .collect(),
    )
}

fn field_ids(payload: &Payload) -> Vec<i32> {
    match payload {
        Payload::Fields(entries) => entries.iter().map(|e| e.id).collect(),
        _ => Vec::new(),
    }
}

fn dictionary_service(id: ServiceId) -> ServiceUpdate {
    let mut info = ServiceInfo::new("DICT_FEED");
    info.dictionaries_provided = vec![FIELD_DICTIONARY.into(), ENUM_DICTIONARY.into()];
    ServiceUpdate {
        service_id: id,
        action: ServiceAction::Add,
        info: Some(info),
        groups: Vec::new(),
    }
}

fn dictionary_part(wire_id: WireStreamId, name: &str, raw: &[u8]) -> InboundMsg {
    InboundMsg::refresh(
        wire_id,
        Domain::Dictionary,
        Payload::DictionaryPart {
            name: name.to_string(),
            raw: raw.to_vec(),
        },
    )
}

fn group_closed(group: u8, text: &str) -> Payload {
    Payload::Services(vec![ServiceUpdate {
        service_id: 1,
        action: ServiceAction::Update,
        info: None,
        groups: vec![GroupChange {
            group: GroupId::new(vec![group]),
            merged_to: None,
            state: Some(State::closed(text)),
        }],
    }])
}

fn refresh_in_group(wire_id: WireStreamId, group: GroupId) -> InboundMsg {
    InboundMsg {
        stream_id: wire_id,
        domain: Domain::MarketPrice,
        body: MsgBody::Refresh {
            state: State::open_ok(),
            solicited: true,
            complete: true,
            group_id: Some(group),
            payload: fields(&[22]),
        },
    }
}

impl Harness {
    fn new(config: WatchlistConfig) -> Self {
        let clock = Arc::new(SimClock::new(0));
        let wire = Arc::new(Mutex::new(Wire::default()));
        let rest = Arc::new(RecordingRest::default());
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
            login_wire: 0,
            directory_wire: 0,
        }
    }

    fn dispatch(&mut self) -> usize {
        self.wl.dispatch(&mut self.log).unwrap()
    }

    fn deliver(&mut self, msg: InboundMsg) -> usize {
        self.tx.message(msg);
        self.dispatch()
    }

    fn take_written(&self) -> Vec<OutboundMsg> {
        std::mem::take(&mut self.wire.lock().written)
    }

    /// Item requests written since the last take.
    fn requests(&self) -> Vec<(WireStreamId, WireRequest)> {
        self.take_written()
            .into_iter()
            .filter(|m| !m.domain.is_administrative())
            .filter_map(|m| m.as_request().cloned().map(|r| (m.stream_id, r)))
            .collect()
    }

    /// Channel up, login refreshed, directory answered with one service.
    fn ready(&mut self, features: LoginFeatures) -> StreamId {
        let login = self.wl.open_login(LoginRequest::new("user")).unwrap();
        self.wl.connect().unwrap();
        self.login_after_connect(features);
        self.log.clear();
        login
    }

    fn login_after_connect(&mut self, features: LoginFeatures) {
        self.tx.transport(TransportEvent::Connected {
            host: HostDescriptor::default(),
        });
        self.dispatch();
        self.login_wire = self
            .take_written()
            .iter()
            .find(|m| matches!(m.body, OutboundBody::Login { .. }))
            .map(|m| m.stream_id)
            .expect("login written once the channel is up");

        self.deliver(InboundMsg::refresh(
            self.login_wire,
            Domain::Login,
            Payload::LoginFeatures(features),
        ));
        // Item requests may follow in the same flush once the directory answers
        let written = self.take_written();
        self.directory_wire = written
            .iter()
            .find(|m| m.domain == Domain::Directory)
            .map(|m| m.stream_id)
            .expect("directory requested after login");

        self.deliver(InboundMsg::refresh(
            self.directory_wire,
            Domain::Directory,
            Payload::Services(vec![add_service(1, FEED)]),
        ));
    }

    fn open_item(&mut self, name: &str) -> (StreamId, WireStreamId) {
        let id = self
            .wl
            .open(ItemRequest::market_price(name).service_name(FEED))
            .unwrap();
        let wire_id = self
            .requests()
            .last()
            .map(|(w, _)| *w)
            .expect("item request written");
        (id, wire_id)
    }

    /// Dictionary requests written since the last take, as (wire id, name).
    fn dictionary_requests(&self) -> Vec<(WireStreamId, String)> {
        self.take_written()
            .into_iter()
            .filter(|m| m.domain == Domain::Dictionary)
            .filter_map(|m| m.as_request().map(|r| (m.stream_id, r.name.clone())))
            .collect()
    }

    fn disconnect(&mut self) {
        self.tx.transport(TransportEvent::Disconnected {
            reason: "connection reset".into(),
        });
        self.dispatch();
    }
}

// =============================================================================
// OPEN / MERGE
// =============================================================================

#[test]
fn test_item_waits_for_login_and_service() {
    let mut h = Harness::new(config());
    let id = h
        .wl
        .open(ItemRequest::market_price("IBM.N").service_name(FEED))
        .unwrap();
    assert_eq!(h.wl.pending_count(), 1);
    assert!(h.take_written().is_empty());

    h.wl.open_login(LoginRequest::new("user")).unwrap();
    h.wl.connect().unwrap();
    h.login_after_connect(features());

    assert_eq!(h.wl.channel_state(), ChannelState::Ready);
    assert!(h.wl.directory_open());
    assert_eq!(h.wl.service_id(FEED), Some(1));

    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    let (wire_id, request) = &requests[0];
    assert_eq!(request.name, "IBM.N");
    assert_eq!(request.service_id, Some(1));
    assert_eq!(h.wl.pending_count(), 0);

    h.log.clear();
    h.deliver(InboundMsg::refresh(*wire_id, Domain::MarketPrice, fields(&[22, 25])));
    let events = h.log.for_stream(id);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].kind, StreamEventKind::Refresh { .. }));
    assert_eq!(h.wl.stream_phase(id), Some(StreamPhase::Open));
}

#[test]
fn test_same_key_shares_wire_stream_with_view_union() {
    let mut h = Harness::new(config());
    h.ready(features());

    let a = h
        .wl
        .open(
            ItemRequest::market_price("IBM.N")
                .service_name(FEED)
                .view(View::FieldIds(vec![22, 25])),
        )
        .unwrap();
    let b = h
        .wl
        .open(
            ItemRequest::market_price("IBM.N")
                .service_name(FEED)
                .view(View::FieldIds(vec![25, 30])),
        )
        .unwrap();

    let requests = h.requests();
    assert_eq!(h.wl.wire_stream_count(), 1);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0, requests[1].0);
    let view = requests[1].1.view.clone().unwrap();
    assert_eq!(
        view,
        vec![ViewValue::Field(22), ViewValue::Field(25), ViewValue::Field(30)]
    );

    h.deliver(InboundMsg::refresh(
        requests[0].0,
        Domain::MarketPrice,
        fields(&[22, 25, 30]),
    ));
    let refresh_fields = |id| match &h.log.for_stream(id)[0].kind {
        StreamEventKind::Refresh { payload, .. } => field_ids(payload),
        other => panic!("expected refresh, got {:?}", other),
    };
    assert_eq!(refresh_fields(a), vec![22, 25]);
    assert_eq!(refresh_fields(b), vec![25, 30]);
}

#[test]
fn test_view_narrows_once_first_refresh_arrives() {
    let mut h = Harness::new(config());
    h.ready(features());

    let a = h
        .wl
        .open(
            ItemRequest::market_price("IBM.N")
                .service_name(FEED)
                .view(View::FieldIds(vec![22, 25])),
        )
        .unwrap();
    let b = h
        .wl
        .open(
            ItemRequest::market_price("IBM.N")
                .service_name(FEED)
                .view(View::FieldIds(vec![25, 30])),
        )
        .unwrap();
    let wire_id = h.requests()[0].0;

    // Leaving before the refresh cannot be sent yet
    h.wl.close(b).unwrap();
    assert!(h.requests().is_empty());

    h.deliver(InboundMsg::refresh(
        wire_id,
        Domain::MarketPrice,
        fields(&[22, 25, 30]),
    ));
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, wire_id);
    assert_eq!(
        requests[0].1.view,
        Some(vec![ViewValue::Field(22), ViewValue::Field(25)])
    );
    assert!(requests[0].1.no_refresh);

    match &h.log.for_stream(a)[0].kind {
        StreamEventKind::Refresh { payload, .. } => assert_eq!(field_ids(payload), vec![22, 25]),
        other => panic!("expected refresh, got {:?}", other),
    }

    // Nothing further once the narrowed view is on the wire
    h.deliver(InboundMsg::update(wire_id, Domain::MarketPrice, fields(&[22])));
    assert!(h.requests().is_empty());
}

#[test]
fn test_snapshot_closes_after_complete_refresh() {
    let mut h = Harness::new(config());
    h.ready(features());

    let id = h
        .wl
        .open(
            ItemRequest::market_price("IBM.N")
                .service_name(FEED)
                .non_streaming(),
        )
        .unwrap();
    let requests = h.requests();
    assert!(!requests[0].1.streaming);
    let wire_id = requests[0].0;

    h.deliver(InboundMsg {
        stream_id: wire_id,
        domain: Domain::MarketPrice,
        body: MsgBody::Refresh {
            state: State::open_ok(),
            solicited: true,
            complete: false,
            group_id: None,
            payload: fields(&[22]),
        },
    });
    assert_eq!(h.wl.stream_phase(id), Some(StreamPhase::PendingRequest));
    assert_eq!(h.wl.wire_stream_count(), 1);

    h.deliver(InboundMsg::refresh(wire_id, Domain::MarketPrice, fields(&[25])));
    assert_eq!(h.wl.stream_phase(id), None);
    assert_eq!(h.wl.wire_stream_count(), 0);
    assert_eq!(h.log.for_stream(id).len(), 2);
    // The provider already ended a non-streaming request
    assert!(h
        .take_written()
        .iter()
        .all(|m| m.body != OutboundBody::Close));
}

#[test]
fn test_private_stream_not_merged() {
    let mut h = Harness::new(config());
    h.ready(features());

    h.wl.open(ItemRequest::market_price("IBM.N").service_name(FEED))
        .unwrap();
    h.wl.open(
        ItemRequest::market_price("IBM.N")
            .service_name(FEED)
            .private_stream(),
    )
    .unwrap();

    let requests = h.requests();
    assert_eq!(h.wl.wire_stream_count(), 2);
    assert_ne!(requests[0].0, requests[1].0);
    assert!(requests[1].1.private);
}

#[test]
fn test_batch_opens_each_item() {
    let mut h = Harness::new(config());
    h.ready(features());

    let ids = h
        .wl
        .open_batch(
            ["IBM.N", "MSFT.O", "TRI.N"]
                .iter()
                .map(|n| ItemRequest::market_price(*n).service_name(FEED))
                .collect(),
        )
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(h.wl.wire_stream_count(), 3);
    assert_eq!(h.requests().len(), 3);

    let err = h.wl.open_batch(Vec::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_closing_last_member_closes_wire_stream() {
    let mut h = Harness::new(config());
    h.ready(features());

    let (a, wire_id) = h.open_item("IBM.N");
    let b = h
        .wl
        .open(ItemRequest::market_price("IBM.N").service_name(FEED))
        .unwrap();
    h.take_written();

    h.wl.close(a).unwrap();
    assert!(h
        .take_written()
        .iter()
        .all(|m| m.body != OutboundBody::Close));

    h.wl.close(b).unwrap();
    let written = h.take_written();
    assert_eq!(written, vec![OutboundMsg::close(wire_id, Domain::MarketPrice)]);
    assert_eq!(h.wl.wire_stream_count(), 0);
    // Only the login stream remains
    assert_eq!(h.wl.stream_count(), 1);

    assert_eq!(h.wl.close(b).unwrap_err().kind(), ErrorKind::UnknownStream);
}

// =============================================================================
// RECOVERY
// =============================================================================

#[test]
fn test_channel_loss_reissues_recoverable_items() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (id, first_wire) = h.open_item("IBM.N");
    h.deliver(InboundMsg::refresh(first_wire, Domain::MarketPrice, fields(&[22])));
    h.log.clear();

    h.disconnect();
    assert_eq!(h.wl.channel_state(), ChannelState::Down);
    assert_eq!(h.wl.stream_phase(id), Some(StreamPhase::Recovering));
    assert_eq!(h.wl.pending_count(), 1);
    let recovering = h.log.for_stream(id).iter().any(|e| {
        matches!(
            &e.kind,
            StreamEventKind::Status { recovering: true, state, .. }
                if state.data_state == DataState::Suspect
        )
    });
    assert!(recovering);

    h.clock.advance_millis(500);
    h.dispatch();
    assert_eq!(h.wl.channel_state(), ChannelState::Connecting);
    assert_eq!(h.wire.lock().connects.len(), 2);

    h.login_after_connect(features());
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.name, "IBM.N");
    assert_ne!(requests[0].0, first_wire);

    h.deliver(InboundMsg::refresh(requests[0].0, Domain::MarketPrice, fields(&[22])));
    assert_eq!(h.wl.stream_phase(id), Some(StreamPhase::Open));
}

#[test]
fn test_channel_loss_closes_without_single_open() {
    let mut h = Harness::new(config());
    h.ready(LoginFeatures::default());
    let (id, wire_id) = h.open_item("IBM.N");
    h.deliver(InboundMsg::refresh(wire_id, Domain::MarketPrice, fields(&[22])));
    h.log.clear();

    h.disconnect();
    let events = h.log.for_stream(id);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_terminal());
    assert_eq!(h.wl.stream_phase(id), None);
    assert_eq!(h.wl.pending_count(), 0);
}

#[test]
fn test_private_stream_closed_on_channel_loss() {
    let mut h = Harness::new(config());
    h.ready(features());
    let id = h
        .wl
        .open(
            ItemRequest::market_price("IBM.N")
                .service_name(FEED)
                .private_stream(),
        )
        .unwrap();
    let wire_id = h.requests()[0].0;
    h.deliver(InboundMsg::refresh(wire_id, Domain::MarketPrice, fields(&[22])));
    h.log.clear();

    h.disconnect();
    let events = h.log.for_stream(id);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_terminal());
    assert_eq!(h.wl.stream_phase(id), None);
    assert_eq!(h.wl.pending_count(), 0);
}

#[test]
fn test_item_closed_by_provider_is_not_reissued() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (closed, wire_a) = h.open_item("IBM.N");
    let (recovering, wire_b) = h.open_item("MSFT.O");
    h.log.clear();

    h.deliver(InboundMsg::status(
        wire_a,
        Domain::MarketPrice,
        State::closed("not entitled"),
    ));
    h.deliver(InboundMsg::status(
        wire_b,
        Domain::MarketPrice,
        State::closed_recover("source restarting"),
    ));

    assert!(h.log.for_stream(closed)[0].is_terminal());
    assert_eq!(h.wl.stream_phase(closed), None);

    // ClosedRecover goes straight back out on a new wire stream
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.name, "MSFT.O");
    assert_ne!(requests[0].0, wire_b);
    assert_eq!(h.wl.stream_phase(recovering), Some(StreamPhase::Recovering));
}

#[test]
fn test_login_closed_recover_takes_channel_down() {
    let mut h = Harness::new(config());
    let login = h.ready(features());
    let (id, first_wire) = h.open_item("IBM.N");
    h.deliver(InboundMsg::refresh(first_wire, Domain::MarketPrice, fields(&[22])));
    h.log.clear();

    h.deliver(InboundMsg::status(
        h.login_wire,
        Domain::Login,
        State::closed_recover("login moved"),
    ));
    assert_eq!(h.wl.channel_state(), ChannelState::Down);
    assert_eq!(h.wl.stream_phase(login), Some(StreamPhase::Recovering));
    assert_eq!(h.wl.stream_phase(id), Some(StreamPhase::Recovering));
    assert_eq!(h.wl.wire_stream_count(), 0);
    // Nothing is resent on the dropped connection
    assert!(h.take_written().is_empty());
    let login_recovering = h
        .log
        .for_stream(login)
        .iter()
        .filter(|e| matches!(e.kind, StreamEventKind::Status { recovering: true, .. }))
        .count();
    assert_eq!(login_recovering, 1);
    assert!(h
        .log
        .for_stream(id)
        .iter()
        .any(|e| matches!(e.kind, StreamEventKind::Status { recovering: true, .. })));

    h.clock.advance_millis(500);
    h.dispatch();
    assert_eq!(h.wl.channel_state(), ChannelState::Connecting);
    assert_eq!(h.wire.lock().connects.len(), 2);

    h.login_after_connect(features());
    assert_eq!(h.wl.channel_state(), ChannelState::Ready);
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.name, "IBM.N");
    assert_ne!(requests[0].0, first_wire);
}

#[test]
fn test_service_delete_cascades_to_items() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (kept, wire_a) = h.open_item("IBM.N");
    let dropped = h
        .wl
        .open(
            ItemRequest::market_price("MSFT.O")
                .service_name(FEED)
                .recoverable(false),
        )
        .unwrap();
    let wire_b = h.requests()[0].0;
    h.deliver(InboundMsg::refresh(wire_a, Domain::MarketPrice, fields(&[22])));
    h.deliver(InboundMsg::refresh(wire_b, Domain::MarketPrice, fields(&[22])));
    h.log.clear();

    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![delete_service(1)]),
    ));
    assert_eq!(h.wl.service_id(FEED), None);
    assert_eq!(h.wl.stream_phase(kept), Some(StreamPhase::Recovering));
    assert_eq!(h.wl.stream_phase(dropped), None);
    assert_eq!(h.wl.pending_count(), 1);
    assert_eq!(h.wl.wire_stream_count(), 0);
    assert!(h.log.for_stream(dropped)[0].is_terminal());

    // Service comes back: the recoverable item is reissued
    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![add_service(1, FEED)]),
    ));
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.name, "IBM.N");
    assert_eq!(h.wl.pending_count(), 0);
}

#[test]
fn test_group_status_and_merge_reach_members() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (a, wire_a) = h.open_item("IBM.N");
    let (b, wire_b) = h.open_item("MSFT.O");
    h.deliver(refresh_in_group(wire_a, GroupId::new(vec![7])));
    h.deliver(refresh_in_group(wire_b, GroupId::new(vec![7])));
    h.log.clear();

    let group_update = |group: u8, merged_to: Option<u8>, state: Option<State>| ServiceUpdate {
        service_id: 1,
        action: ServiceAction::Update,
        info: None,
        groups: vec![GroupChange {
            group: GroupId::new(vec![group]),
            merged_to: merged_to.map(|g| GroupId::new(vec![g])),
            state,
        }],
    };

    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![group_update(7, None, Some(State::open_suspect("source down")))]),
    ));
    for id in [a, b] {
        let events = h.log.for_stream(id);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].kind,
            StreamEventKind::Status { state, .. } if state.data_state == DataState::Suspect
        ));
    }

    h.log.clear();
    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![group_update(7, Some(9), None)]),
    ));
    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![group_update(9, None, Some(State::open_ok()))]),
    ));
    assert_eq!(h.log.for_stream(a).len(), 1);
    assert_eq!(h.log.for_stream(b).len(), 1);
}

#[test]
fn test_group_close_reaches_each_member_once() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (a, wire_a) = h.open_item("IBM.N");
    let (c, wire_c) = h.open_item("MSFT.O");
    h.deliver(refresh_in_group(wire_a, GroupId::new(vec![7])));
    h.deliver(refresh_in_group(wire_c, GroupId::new(vec![7])));

    // Joins after the others, so the group lists IBM.N, MSFT.O, IBM.N
    let b = h
        .wl
        .open(ItemRequest::market_price("IBM.N").service_name(FEED))
        .unwrap();
    h.deliver(refresh_in_group(wire_a, GroupId::new(vec![7])));
    h.log.clear();

    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        group_closed(7, "group gone"),
    ));
    for id in [a, b, c] {
        let events = h.log.for_stream(id);
        assert_eq!(events.len(), 1, "stream {}", id);
        assert!(events[0].is_terminal());
    }
    assert_eq!(h.wl.wire_stream_count(), 0);
    assert!(h.log.errors().is_empty());
}

// =============================================================================
// DICTIONARY DOWNLOAD
// =============================================================================

fn dictionary_config() -> WatchlistConfig {
    let mut config = config();
    config.dictionary_download = DictionaryDownloadMode::FirstAvailable;
    config
}

#[test]
fn test_refused_dictionary_not_requested_again() {
    let mut h = Harness::new(dictionary_config());
    h.ready(features());
    h.take_written();

    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![dictionary_service(2)]),
    ));
    let requested = h.dictionary_requests();
    let names: Vec<&str> = requested.iter().map(|(_, n)| n.as_str()).collect();
    assert_eq!(names, vec![FIELD_DICTIONARY, ENUM_DICTIONARY]);
    let (field_wire, enum_wire) = (requested[0].0, requested[1].0);

    h.deliver(InboundMsg::status(
        field_wire,
        Domain::Dictionary,
        State::closed("not entitled"),
    ));
    h.clock.advance_millis(1_000);
    h.dispatch();
    assert!(h.dictionary_requests().is_empty());

    // The other download is unaffected
    h.deliver(dictionary_part(enum_wire, ENUM_DICTIONARY, b"enum"));
    assert_eq!(h.wl.dictionary(ENUM_DICTIONARY), Some(b"enum".to_vec()));
    assert!(!h.wl.dictionaries_loaded());
    h.dispatch();
    assert!(h.dictionary_requests().is_empty());
}

#[test]
fn test_dictionary_closed_recover_retried_once_idle() {
    let mut h = Harness::new(dictionary_config());
    h.ready(features());
    h.take_written();

    h.deliver(InboundMsg::update(
        h.directory_wire,
        Domain::Directory,
        Payload::Services(vec![dictionary_service(2)]),
    ));
    let requested = h.dictionary_requests();
    let (field_wire, enum_wire) = (requested[0].0, requested[1].0);

    // Enum download still in flight: nothing is requested twice
    h.deliver(InboundMsg::status(
        field_wire,
        Domain::Dictionary,
        State::closed_recover("busy"),
    ));
    assert!(h.dictionary_requests().is_empty());

    h.deliver(dictionary_part(enum_wire, ENUM_DICTIONARY, b"enum"));
    let retried = h.dictionary_requests();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].1, FIELD_DICTIONARY);
    assert_ne!(retried[0].0, field_wire);

    h.deliver(dictionary_part(retried[0].0, FIELD_DICTIONARY, b"fld"));
    assert!(h.wl.dictionaries_loaded());
}

// =============================================================================
// POSTS
// =============================================================================

#[test]
fn test_post_ack_and_timeout() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (id, wire_id) = h.open_item("IBM.N");
    h.deliver(InboundMsg::refresh(wire_id, Domain::MarketPrice, fields(&[22])));

    h.wl.submit_post(id, PostMsg::new(1)).unwrap();
    h.wl.submit_post(id, PostMsg::new(2)).unwrap();
    assert_eq!(h.wl.outstanding_posts(), 2);
    let posts = h
        .take_written()
        .into_iter()
        .filter(|m| matches!(m.body, OutboundBody::Post(_)))
        .count();
    assert_eq!(posts, 2);

    h.log.clear();
    h.deliver(InboundMsg::ack(wire_id, Domain::MarketPrice, 1, None));
    assert!(matches!(
        h.log.for_stream(id)[0].kind,
        StreamEventKind::Ack { ack_id: 1, .. }
    ));
    assert_eq!(h.wl.outstanding_posts(), 1);

    h.clock.advance_millis(14_999);
    h.dispatch();
    assert!(h.log.errors().is_empty());

    h.clock.advance_millis(1);
    h.dispatch();
    let errors = h.log.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::PostTimeout);
    assert_eq!(errors[0].stream_id, Some(id));
    assert_eq!(errors[0].domain, Some(Domain::MarketPrice));

    h.clock.advance_millis(60_000);
    h.dispatch();
    assert_eq!(h.log.errors().len(), 1);
    assert_eq!(h.wl.outstanding_posts(), 0);
}

#[test]
fn test_post_rejected_when_provider_lacks_support() {
    let mut h = Harness::new(config());
    h.ready(LoginFeatures::default());
    let (id, _) = h.open_item("IBM.N");

    let err = h.wl.submit_post(id, PostMsg::new(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.stream_id, Some(id));
    assert_eq!(h.wl.outstanding_posts(), 0);
}

#[test]
fn test_post_while_channel_down_is_transient() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (id, _) = h.open_item("IBM.N");
    h.disconnect();

    let err = h.wl.submit_post(id, PostMsg::new(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelDown);
    assert!(err.is_transient());
    assert_eq!(err.prior_state, Some(StreamPhase::Recovering));
}

// =============================================================================
// PAUSE
// =============================================================================

#[test]
fn test_wire_pauses_only_when_every_member_paused() {
    let mut h = Harness::new(config());
    h.ready(features());
    let (a, wire_id) = h.open_item("IBM.N");
    let b = h
        .wl
        .open(ItemRequest::market_price("IBM.N").service_name(FEED))
        .unwrap();
    h.deliver(InboundMsg::refresh(wire_id, Domain::MarketPrice, fields(&[22])));
    h.take_written();

    h.wl.pause(a).unwrap();
    assert!(h.requests().is_empty());

    h.wl.pause(b).unwrap();
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].1.paused);
    assert!(requests[0].1.no_refresh);

    h.wl.resume(a).unwrap();
    let requests = h.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].1.paused);
}

#[test]
fn test_pause_without_support_warns() {
    let mut h = Harness::new(config());
    h.ready(LoginFeatures::default());
    let (id, _) = h.open_item("IBM.N");
    h.take_written();

    h.wl.pause(id).unwrap();
    h.dispatch();
    assert!(h
        .log
        .events
        .iter()
        .any(|e| matches!(e, WatchlistEvent::Warning(_))));
    assert!(h.take_written().is_empty());
}

#[test]
fn test_pause_all_goes_through_login_stream() {
    let mut h = Harness::new(config());
    h.ready(features());
    h.open_item("IBM.N");

    h.wl.pause_all().unwrap();
    let written = h.take_written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].stream_id, h.login_wire);
    assert!(matches!(
        written[0].body,
        OutboundBody::Login { paused: true, .. }
    ));
}

// =============================================================================
// ERRORS AND ROLES
// =============================================================================

#[test]
fn test_message_for_unknown_wire_stream_reported_once() {
    let mut h = Harness::new(config());
    h.ready(features());

    h.deliver(InboundMsg::update(999, Domain::MarketPrice, fields(&[22])));
    let errors = h.log.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::UnknownStream);
    assert_eq!(h.log.stream_events().count(), 0);
}

#[test]
fn test_provider_role_rejects_item_requests() {
    let mut cfg = config();
    cfg.role = ChannelRole::NonInteractiveProvider;
    let h = Harness::new(cfg);

    let err = h.wl.open(ItemRequest::market_price("IBM.N")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(h.wl.open_login(LoginRequest::new("publisher")).is_ok());
}

#[test]
fn test_login_domain_not_opened_as_item() {
    let h = Harness::new(config());
    let err = h
        .wl
        .open(ItemRequest::new(Domain::Login, "user"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

struct Reenter<'a> {
    wl: &'a Watchlist,
    rejected: Vec<ErrorKind>,
}

impl WatchlistCallback for Reenter<'_> {
    fn on_channel_event(&mut self, _event: &ChannelEvent) {
        if let Err(e) = self.wl.dispatch(&mut EventLog::new()) {
            self.rejected.push(e.kind());
        }
    }
}

#[test]
fn test_reentrant_dispatch_rejected() {
    let h = Harness::new(config());
    h.wl.connect().unwrap();

    let mut callback = Reenter {
        wl: &h.wl,
        rejected: Vec::new(),
    };
    let delivered = h.wl.dispatch(&mut callback).unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(callback.rejected, vec![ErrorKind::ConcurrentDispatch]);

    // Guard released once the pass returns
    assert!(h.wl.dispatch(&mut EventLog::new()).is_ok());
}

#[test]
fn test_shutdown_closes_every_stream() {
    let mut h = Harness::new(config());
    let login = h.ready(features());
    let (id, _) = h.open_item("IBM.N");

    h.wl.shutdown();
    h.dispatch();
    assert_eq!(h.wl.channel_state(), ChannelState::Closed);
    assert_eq!(h.wl.stream_count(), 0);
    assert!(h.log.for_stream(id)[0].is_terminal());
    assert!(h.log.for_stream(login).iter().any(|e| e.is_terminal()));
    assert_eq!(
        h.wl.connect().unwrap_err().kind(),
        ErrorKind::ChannelClosed
    );
}

// =============================================================================
// REST
// =============================================================================

fn token_config() -> WatchlistConfig {
    let mut cfg = config();
    cfg.token.token_url = Some("https://auth.example/token".into());
    cfg.token.client_id = Some("app-key".into());
    cfg.token.renewal_margin_ms = 10_000;
    cfg.token.attempt_limit = 1;
    cfg
}

#[test]
fn test_token_renewal_reissues_login() {
    let mut h = Harness::new(token_config());
    h.wl.install_token("t0", 60);
    h.wl
        .open_login(LoginRequest::new("user").auth_token("t0"))
        .unwrap();
    h.wl.connect().unwrap();
    h.login_after_connect(features());
    h.log.clear();

    h.clock.advance_millis(49_999);
    h.dispatch();
    assert!(h.rest.submitted.lock().is_empty());

    h.clock.advance_millis(1);
    h.dispatch();
    let request = {
        let submitted = h.rest.submitted.lock();
        assert_eq!(submitted.len(), 1);
        submitted[0].clone()
    };
    assert_eq!(request.purpose, RestPurpose::TokenRenewal);

    h.tx.send(DispatchEvent::Rest {
        request_id: request.id,
        result: Ok(RestResponse::new(
            200,
            r#"{"access_token":"t1","expires_in":600}"#,
        )),
    });
    h.dispatch();
    assert!(h
        .log
        .events
        .iter()
        .any(|e| matches!(e, WatchlistEvent::AuthToken(AuthTokenEvent::Renewed { .. }))));
    let reissued = h.take_written().into_iter().any(|m| {
        matches!(
            &m.body,
            OutboundBody::Login { auth_token: Some(t), .. } if t == "t1"
        )
    });
    assert!(reissued);
}

#[test]
fn test_token_failure_leaves_channel_running() {
    let mut h = Harness::new(token_config());
    h.wl.install_token("t0", 60);
    h.ready(features());

    h.clock.advance_millis(50_000);
    h.dispatch();
    let request_id = h.rest.submitted.lock()[0].id;
    h.tx.send(DispatchEvent::Rest {
        request_id,
        result: Ok(RestResponse::new(401, "unauthorized")),
    });
    h.dispatch();

    let failed = h.log.events.iter().any(|e| {
        matches!(
            e,
            WatchlistEvent::AuthToken(AuthTokenEvent::Failed(err))
                if err.kind() == ErrorKind::AuthTokenFailure
        )
    });
    assert!(failed);
    assert_eq!(h.wl.channel_state(), ChannelState::Ready);
}

#[test]
fn test_service_discovery_result_delivered() {
    let mut h = Harness::new(config());
    let request_id = h.wl.discover_services();
    let request = h.rest.submitted.lock()[0].clone();
    assert_eq!(request.purpose, RestPurpose::ServiceDiscovery);
    assert_eq!(request.id, request_id);

    h.tx.send(DispatchEvent::Rest {
        request_id,
        result: Ok(RestResponse::new(
            200,
            r#"{"services":[{"endpoint":"amer-1.example.com","port":14002}]}"#,
        )),
    });
    h.dispatch();
    let endpoints = h.log.events.iter().find_map(|e| match e {
        WatchlistEvent::ServiceDiscovery(d) => d.result.as_ref().ok().cloned(),
        _ => None,
    });
    assert_eq!(endpoints.map(|e| e.len()), Some(1));
}
