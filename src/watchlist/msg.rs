//! Message Model
//!
//! Decoded domain messages as they cross the codec boundary, in both directions. Byte layout is
//! the codec's concern; these are the structures the handlers read and produce.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Application-visible stream identifier.
pub type StreamId = i32;

/// Stream identifier used on the wire. Several application streams may share one.
pub type WireStreamId = i32;

/// Service identifier assigned by the provider.
pub type ServiceId = u16;

// =============================================================================
// DOMAINS & STATES
// =============================================================================

/// Message domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Domain {
    Login,
    Directory,
    Dictionary,
    MarketPrice,
    MarketByOrder,
    MarketByPrice,
    SymbolList,
    Custom(u8),
}

impl Domain {
    /// Login, directory and dictionary carry session metadata rather than market data.
    #[inline]
    pub fn is_administrative(&self) -> bool {
        matches!(self, Self::Login | Self::Directory | Self::Dictionary)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => write!(f, "LOGIN"),
            Self::Directory => write!(f, "DIRECTORY"),
            Self::Dictionary => write!(f, "DICTIONARY"),
            Self::MarketPrice => write!(f, "MARKET_PRICE"),
            Self::MarketByOrder => write!(f, "MARKET_BY_ORDER"),
            Self::MarketByPrice => write!(f, "MARKET_BY_PRICE"),
            Self::SymbolList => write!(f, "SYMBOL_LIST"),
            Self::Custom(d) => write!(f, "DOMAIN_{}", d),
        }
    }
}

/// Stream state reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Open,
    NonStreaming,
    ClosedRecover,
    Closed,
    Redirected,
}

/// Health of the data on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataState {
    Ok,
    Suspect,
    NoChange,
}

/// Reason code attached to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateCode {
    None,
    NotFound,
    Timeout,
    NotEntitled,
    NoResources,
    UsageError,
    Preempted,
    UnsupportedViewType,
}

/// Full message state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StateCode,
    pub text: String,
}

impl State {
    pub fn new(stream_state: StreamState, data_state: DataState, text: impl Into<String>) -> Self {
        Self {
            stream_state,
            data_state,
            code: StateCode::None,
            text: text.into(),
        }
    }

    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok, "")
    }

    pub fn open_suspect(text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Suspect, text)
    }

    pub fn closed_recover(text: impl Into<String>) -> Self {
        Self::new(StreamState::ClosedRecover, DataState::Suspect, text)
    }

    pub fn closed(text: impl Into<String>) -> Self {
        Self::new(StreamState::Closed, DataState::Suspect, text)
    }

    pub fn with_code(mut self, code: StateCode) -> Self {
        self.code = code;
        self
    }

    /// The stream does not stay open after this state.
    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(
            self.stream_state,
            StreamState::Closed | StreamState::ClosedRecover | StreamState::Redirected
        )
    }
}

// =============================================================================
// KEYS, VIEWS, PAYLOADS
// =============================================================================

/// Opaque item group identifier. The empty id is the synthetic default group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "default");
        }
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// How a request names its service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceRef {
    Id(ServiceId),
    Name(String),
}

/// One element of a view. Field ids order numerically, names lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViewValue {
    Field(i32),
    Name(String),
}

/// Requested subset of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum View {
    FieldIds(Vec<i32>),
    ElementNames(Vec<String>),
}

impl View {
    /// Sorted, deduplicated elements.
    pub fn values(&self) -> Vec<ViewValue> {
        let mut values: Vec<ViewValue> = match self {
            Self::FieldIds(ids) => ids.iter().copied().map(ViewValue::Field).collect(),
            Self::ElementNames(names) => names.iter().cloned().map(ViewValue::Name).collect(),
        };
        values.sort();
        values.dedup();
        values
    }

    #[inline]
    pub fn is_field_ids(&self) -> bool {
        matches!(self, Self::FieldIds(_))
    }

    /// Whether an entry is part of this view.
    pub fn contains(&self, entry: &FieldEntry) -> bool {
        match self {
            Self::FieldIds(ids) => ids.contains(&entry.id),
            Self::ElementNames(names) => names.iter().any(|n| *n == entry.name),
        }
    }

    /// Client-side filter of a payload down to this view.
    pub fn filter(&self, fields: &[FieldEntry]) -> Vec<FieldEntry> {
        fields.iter().filter(|f| self.contains(f)).cloned().collect()
    }
}

/// Decoded field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub id: i32,
    pub name: String,
    pub value: String,
}

impl FieldEntry {
    pub fn new(id: i32, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Opaque application value handed back with every event on a stream.
#[derive(Clone)]
pub struct Closure(pub Arc<dyn Any + Send + Sync>);

impl Closure {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure(..)")
    }
}

// =============================================================================
// ADMIN PAYLOADS
// =============================================================================

/// Capabilities advertised in the login refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFeatures {
    pub supports_post: bool,
    pub supports_optimized_pause_resume: bool,
    pub supports_suspect_data: bool,
    pub single_open: bool,
    pub supports_rtt: bool,
}

/// Provider-side description of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default)]
    pub dictionaries_provided: Vec<String>,
    #[serde(default)]
    pub dictionaries_used: Vec<String>,
    #[serde(default = "default_true")]
    pub service_up: bool,
    #[serde(default = "default_true")]
    pub accepting_requests: bool,
}

fn default_true() -> bool {
    true
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dictionaries_provided: Vec::new(),
            dictionaries_used: Vec::new(),
            service_up: true,
            accepting_requests: true,
        }
    }
}

/// Add/update/delete of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceAction {
    Add,
    Update,
    Delete,
}

/// Group state change or merge announced for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChange {
    pub group: GroupId,
    #[serde(default)]
    pub merged_to: Option<GroupId>,
    #[serde(default)]
    pub state: Option<State>,
}

/// One entry of a directory refresh or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub service_id: ServiceId,
    pub action: ServiceAction,
    #[serde(default)]
    pub info: Option<ServiceInfo>,
    #[serde(default)]
    pub groups: Vec<GroupChange>,
}

/// Message body contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Fields(Vec<FieldEntry>),
    LoginFeatures(LoginFeatures),
    Services(Vec<ServiceUpdate>),
    DictionaryPart { name: String, raw: Vec<u8> },
    Rtt { ticks: u64 },
}

// =============================================================================
// INBOUND
// =============================================================================

/// Negative acknowledgement reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakCode {
    AccessDenied,
    DeniedBySource,
    SourceDown,
    InvalidContent,
    NoResponse,
}

/// Decoded message received on a wire stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMsg {
    pub stream_id: WireStreamId,
    pub domain: Domain,
    pub body: MsgBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    Refresh {
        state: State,
        solicited: bool,
        complete: bool,
        group_id: Option<GroupId>,
        payload: Payload,
    },
    Update {
        payload: Payload,
    },
    Status {
        state: Option<State>,
        group_id: Option<GroupId>,
    },
    Ack {
        ack_id: u32,
        seq_num: Option<u32>,
        nak: Option<NakCode>,
        text: String,
    },
    Generic {
        payload: Payload,
    },
}

impl InboundMsg {
    pub fn refresh(stream_id: WireStreamId, domain: Domain, payload: Payload) -> Self {
        Self {
            stream_id,
            domain,
            body: MsgBody::Refresh {
                state: State::open_ok(),
                solicited: true,
                complete: true,
                group_id: None,
                payload,
            },
        }
    }

    pub fn update(stream_id: WireStreamId, domain: Domain, payload: Payload) -> Self {
        Self {
            stream_id,
            domain,
            body: MsgBody::Update { payload },
        }
    }

    pub fn status(stream_id: WireStreamId, domain: Domain, state: State) -> Self {
        Self {
            stream_id,
            domain,
            body: MsgBody::Status {
                state: Some(state),
                group_id: None,
            },
        }
    }

    pub fn ack(stream_id: WireStreamId, domain: Domain, ack_id: u32, seq_num: Option<u32>) -> Self {
        Self {
            stream_id,
            domain,
            body: MsgBody::Ack {
                ack_id,
                seq_num,
                nak: None,
                text: String::new(),
            },
        }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Login request submitted by the application.
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub user_name: String,
    pub application_id: String,
    pub position: String,
    pub auth_token: Option<String>,
    pub rtt: bool,
    pub pause_all: bool,
    pub closure: Option<Closure>,
}

impl LoginRequest {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            application_id: "256".to_string(),
            ..Default::default()
        }
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn rtt(mut self) -> Self {
        self.rtt = true;
        self
    }

    pub fn closure(mut self, closure: Closure) -> Self {
        self.closure = Some(closure);
        self
    }
}

/// Directory, dictionary or market data request.
#[derive(Debug, Clone)]
pub struct ItemRequest {
    pub domain: Domain,
    pub name: String,
    pub service: Option<ServiceRef>,
    pub view: Option<View>,
    pub streaming: bool,
    pub private: bool,
    pub paused: bool,
    pub recoverable: Option<bool>,
    pub closure: Option<Closure>,
}

impl ItemRequest {
    pub fn new(domain: Domain, name: impl Into<String>) -> Self {
        Self {
            domain,
            name: name.into(),
            service: None,
            view: None,
            streaming: true,
            private: false,
            paused: false,
            recoverable: None,
            closure: None,
        }
    }

    pub fn market_price(name: impl Into<String>) -> Self {
        Self::new(Domain::MarketPrice, name)
    }

    pub fn directory() -> Self {
        Self::new(Domain::Directory, "")
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service = Some(ServiceRef::Name(name.into()));
        self
    }

    pub fn service_id(mut self, id: ServiceId) -> Self {
        self.service = Some(ServiceRef::Id(id));
        self
    }

    pub fn view(mut self, view: View) -> Self {
        self.view = Some(view);
        self
    }

    pub fn non_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn private_stream(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = Some(recoverable);
        self
    }

    pub fn closure(mut self, closure: Closure) -> Self {
        self.closure = Some(closure);
        self
    }
}

/// Post submitted by the application. The tracker keeps its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMsg {
    pub post_id: u32,
    pub seq_num: Option<u32>,
    pub ack_requested: bool,
    pub payload: Vec<FieldEntry>,
}

impl PostMsg {
    pub fn new(post_id: u32) -> Self {
        Self {
            post_id,
            seq_num: None,
            ack_requested: true,
            payload: Vec::new(),
        }
    }

    pub fn seq_num(mut self, seq: u32) -> Self {
        self.seq_num = Some(seq);
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.ack_requested = false;
        self
    }

    pub fn field(mut self, entry: FieldEntry) -> Self {
        self.payload.push(entry);
        self
    }
}

/// Request as it goes on the wire after merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub name: String,
    pub service_id: Option<ServiceId>,
    pub view: Option<Vec<ViewValue>>,
    pub streaming: bool,
    pub private: bool,
    pub paused: bool,
    pub no_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundBody {
    Login {
        user_name: String,
        application_id: String,
        position: String,
        auth_token: Option<String>,
        rtt: bool,
        paused: bool,
    },
    Request(WireRequest),
    Close,
    Post(PostMsg),
    Rtt { ticks: u64 },
}

/// Encode-ready message for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMsg {
    pub stream_id: WireStreamId,
    pub domain: Domain,
    pub body: OutboundBody,
}

impl OutboundMsg {
    pub fn close(stream_id: WireStreamId, domain: Domain) -> Self {
        Self {
            stream_id,
            domain,
            body: OutboundBody::Close,
        }
    }

    /// Request payload, if this is a request.
    pub fn as_request(&self) -> Option<&WireRequest> {
        match &self.body {
            OutboundBody::Request(req) => Some(req),
            _ => None,
        }
    }
}
