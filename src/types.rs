pub mod error;
mod parser;


use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::{
    types::error::{Error, Result},
    util,
};

/// A subscription id, unique and monotonically increasing for the lifetime
/// of a client
pub type Sid = u64;

/// <https://docs.nats.io/reference/reference-protocols/nats-protocol#protocol-messages>
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Info {
    /// The unique identifier of the NATS server
    pub server_id: String,
    /// The version of the NATS server
    pub version: String,
    /// The version of golang the NATS server was built with
    #[serde(default)]
    pub go: String,
    /// The IP address the NATS server listens on
    pub host: String,
    /// The port number the NATS server listens on
    pub port: u16,
    /// Maximum payload size, in bytes, that the server will accept from the
    /// client
    pub max_payload: u64,
    /// An integer indicating the protocol version of the server
    pub proto: i32,
    /// An optional unsigned integer representing the internal client
    /// identifier in the server
    pub client_id: Option<u64>,
    /// If this is set, then the client should try to authenticate upon
    /// connect
    #[serde(default)]
    pub auth_required: bool,
    /// If this is set, then the client must perform the TLS/1.2 handshake
    #[serde(default)]
    pub tls_required: bool,
    /// If this is set, the client must provide a valid certificate during
    /// the TLS handshake
    #[serde(default)]
    pub tls_verify: bool,
    /// If this is set, the server supports message headers
    #[serde(default)]
    pub headers: bool,
    /// An optional list of server urls that a client can connect to
    #[serde(default)]
    pub connect_urls: Vec<String>,
}

/// The `CONNECT` options sent as the first client frame of every connection
///
/// <https://docs.nats.io/reference/reference-protocols/nats-protocol#connect>
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Connect {
    /// Turns on +OK protocol acknowledgements
    verbose: bool,
    /// Turns on additional strict format checking, e.g. for properly formed
    /// subjects
    pedantic: bool,
    /// Indicates whether the client requires an SSL connection
    tls_required: bool,
    /// Client authorization token (if auth_required is set)
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    /// Connection username (if auth_required is set)
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    /// Connection password (if auth_required is set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<String>,
    /// Optional client name
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// The implementation language of the client
    lang: String,
    /// The version of the client
    version: String,
    /// Sending 0 (or absent) indicates the client supports the original
    /// protocol. Sending 1 indicates the client supports dynamic
    /// reconfiguration and the echo option.
    protocol: i32,
    /// If set to true, the server (version 1.2.0+) will send originating
    /// messages from this connection to this connection's own subscriptions
    echo: bool,
    /// If set to true, the client accepts `HMSG` frames and may send `HPUB`
    headers: bool,
}

impl Connect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    pub fn pedantic(&mut self, pedantic: bool) -> &mut Self {
        self.pedantic = pedantic;
        self
    }

    pub fn echo(&mut self, echo: bool) -> &mut Self {
        self.echo = echo;
        self
    }

    pub fn name(&mut self, name: String) -> &mut Self {
        self.name = Some(name);
        self
    }

    pub fn token(&mut self, token: String) -> &mut Self {
        self.auth_token = Some(token);
        self.user = None;
        self.pass = None;
        self
    }

    pub fn username_password(&mut self, user: String, pass: String) -> &mut Self {
        self.user = Some(user);
        self.pass = Some(pass);
        self.auth_token = None;
        self
    }

    // The authorization baked into an address wins over the client level
    // defaults.
    pub(crate) fn apply_authorization(&mut self, authorization: &Authorization) {
        match authorization {
            Authorization::Token(token) => {
                self.token(token.clone());
            }
            Authorization::UsernamePassword(user, pass) => {
                self.username_password(user.clone(), pass.clone());
            }
        }
    }
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: None,
            pass: None,
            name: None,
            lang: String::from(util::CLIENT_LANG),
            version: String::from(util::CLIENT_VERSION),
            protocol: 1,
            echo: false,
            headers: true,
        }
    }
}

/// Authorization embedded in an [`Address`](struct.Address.html)
#[derive(Clone, Debug, PartialEq)]
pub enum Authorization {
    Token(String),
    UsernamePassword(String, String),
}

impl Authorization {
    pub fn token(token: String) -> Self {
        Authorization::Token(token)
    }

    pub fn username_password(username: String, password: String) -> Self {
        Authorization::UsernamePassword(username, password)
    }

    fn parse(s: &str) -> Self {
        match util::split_before(s, util::USERNAME_PASSWORD_SEPARATOR) {
            (Some(username), password) => {
                Authorization::username_password(String::from(username), String::from(password))
            }
            (None, token) => Authorization::token(String::from(token)),
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Token(token) => write!(f, "{}", token),
            Authorization::UsernamePassword(username, password) => write!(
                f,
                "{}{}{}",
                username,
                util::USERNAME_PASSWORD_SEPARATOR,
                password
            ),
        }
    }
}

/// An address used to connect to a NATS server
///
/// The string representation can take the following forms:
/// * `nats://<username>:<password>@<domain>:<port>`
/// * `nats://<token>@<domain>:<port>`
///
/// The only required part is the `<domain>`; the default port is `4222`.
/// Authorization specified by the address overrides the client's
/// [`Connect`](struct.Connect.html) defaults when connecting.
#[derive(Clone, Debug, PartialEq)]
pub struct Address {
    domain: String,
    port: u16,
    authorization: Option<Authorization>,
}

impl Address {
    pub fn new(domain: &str, port: u16, authorization: Option<Authorization>) -> Self {
        Self {
            domain: String::from(domain),
            port,
            authorization,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `(domain, port)` pair used for the TCP connect
    pub fn address(&self) -> (&str, u16) {
        (&self.domain, self.port)
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(authorization) = &self.authorization {
            write!(f, "{}{}", authorization, util::AUTHORIZATION_SEPARATOR)?;
        }
        write!(f, "{}:{}", self.domain, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (maybe_scheme, rest) = util::split_before(s, util::NETWORK_SCHEME_SEPARATOR);
        if let Some(scheme) = maybe_scheme {
            if scheme != util::NATS_NETWORK_SCHEME {
                return Err(Error::InvalidNetworkScheme(String::from(scheme)));
            }
        }

        if rest.is_empty() {
            return Err(Error::InvalidAddress(String::from(s)));
        }

        let (maybe_authorization, rest) = util::split_before(rest, util::AUTHORIZATION_SEPARATOR);
        let authorization = maybe_authorization.map(Authorization::parse);

        if rest.is_empty() {
            return Err(Error::InvalidAddress(String::from(s)));
        }

        let (domain, maybe_port) = util::split_after(rest, util::DOMAIN_PORT_SEPARATOR);
        if domain.is_empty() {
            return Err(Error::InvalidAddress(String::from(s)));
        }
        let port = if let Some(maybe_port) = maybe_port {
            maybe_port
                .parse()
                .map_err(|_| Error::InvalidAddress(String::from(s)))?
        } else {
            util::NATS_DEFAULT_PORT
        };

        Ok(Address::new(domain, port, authorization))
    }
}

/// A dot separated subject with optional `*` and trailing `>` wildcards
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subject {
    pub(crate) tokens: Vec<String>,
    pub(crate) full_wildcard: bool,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(util::SUBJECT_TOKEN_DELIMITER))?;
        if self.full_wildcard {
            if !self.tokens.is_empty() {
                write!(f, "{}", util::SUBJECT_TOKEN_DELIMITER)?;
            }
            write!(f, "{}", util::SUBJECT_FULL_WILDCARD)?;
        }
        Ok(())
    }
}

/// Errors the server reports through `-ERR`
///
/// <https://docs.nats.io/reference/reference-protocols/nats-protocol#-err>
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolError {
    UnknownProtocolOperation,
    AttemptedToConnectToRoutePort,
    AuthorizationViolation,
    AuthorizationTimeout,
    InvalidClientProtocol,
    MaximumControlLineExceeded,
    ParserError,
    SecureConnectionTlsRequired,
    StaleConnection,
    MaximumConnectionsExceeded,
    SlowConsumer,
    MaximumPayloadViolation,
    InvalidSubject,
    PermissionsViolationForSubscription(Subject),
    PermissionsViolationForPublish(Subject),
    /// Any error message this client does not recognize, preserved verbatim
    Other(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownProtocolOperation => {
                write!(f, "{}", util::UNKNOWN_PROTOCOL_OPERATION)
            }
            ProtocolError::AttemptedToConnectToRoutePort => {
                write!(f, "{}", util::ATTEMPTED_TO_CONNECT_TO_ROUTE_PORT)
            }
            ProtocolError::AuthorizationViolation => write!(f, "{}", util::AUTHORIZATION_VIOLATION),
            ProtocolError::AuthorizationTimeout => write!(f, "{}", util::AUTHORIZATION_TIMEOUT),
            ProtocolError::InvalidClientProtocol => write!(f, "{}", util::INVALID_CLIENT_PROTOCOL),
            ProtocolError::MaximumControlLineExceeded => {
                write!(f, "{}", util::MAXIMUM_CONTROL_LINE_EXCEEDED)
            }
            ProtocolError::ParserError => write!(f, "{}", util::PARSER_ERROR),
            ProtocolError::SecureConnectionTlsRequired => {
                write!(f, "{}", util::SECURE_CONNECTION_TLS_REQUIRED)
            }
            ProtocolError::StaleConnection => write!(f, "{}", util::STALE_CONNECTION),
            ProtocolError::MaximumConnectionsExceeded => {
                write!(f, "{}", util::MAXIMUM_CONNECTIONS_EXCEEDED)
            }
            ProtocolError::SlowConsumer => write!(f, "{}", util::SLOW_CONSUMER),
            ProtocolError::MaximumPayloadViolation => {
                write!(f, "{}", util::MAXIMUM_PAYLOAD_VIOLATION)
            }
            ProtocolError::InvalidSubject => write!(f, "{}", util::INVALID_SUBJECT),
            ProtocolError::PermissionsViolationForSubscription(subject) => write!(
                f,
                "{} {}",
                util::PERMISSIONS_VIOLATION_FOR_SUBSCRIPTION,
                subject
            ),
            ProtocolError::PermissionsViolationForPublish(subject) => {
                write!(f, "{} {}", util::PERMISSIONS_VIOLATION_FOR_PUBLISH, subject)
            }
            ProtocolError::Other(message) => write!(f, "{}", message),
        }
    }
}

/// An ordered list of message headers carried by `HPUB`/`HMSG`
///
/// The wire form is the `NATS/1.0` version line followed by `Name: Value`
/// lines and a terminating blank line. Names may repeat; lookups return the
/// first match.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing entries with the same name
    pub fn append(&mut self, name: &str, value: &str) -> &mut Self {
        self.entries.push((String::from(name), String::from(value)));
        self
    }

    /// The first value stored under `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // A name cannot carry the separator and neither side can carry CRLF,
    // otherwise the block would parse differently than it was written.
    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in &self.entries {
            if name.is_empty() || name.contains(':') || name.contains('\r') || name.contains('\n')
            {
                return Err(Error::InvalidHeaders(format!("invalid name {:?}", name)));
            }
            if value.contains('\r') || value.contains('\n') {
                return Err(Error::InvalidHeaders(format!("invalid value {:?}", value)));
            }
        }
        Ok(())
    }

    /// The exact number of bytes [`encode_into`](Self::encode_into) writes
    pub(crate) fn encoded_len(&self) -> usize {
        let mut len = util::HEADERS_VERSION_LINE.len() + util::MESSAGE_TERMINATOR.len();
        for (name, value) in &self.entries {
            len += name.len()
                + util::HEADER_NAME_VALUE_SEPARATOR.len()
                + value.len()
                + util::MESSAGE_TERMINATOR.len();
        }
        len + util::MESSAGE_TERMINATOR.len()
    }

    pub(crate) fn encode_into(&self, buf: &mut bytes::BytesMut) {
        use bytes::BufMut;
        buf.put_slice(util::HEADERS_VERSION_LINE.as_bytes());
        buf.put_slice(util::MESSAGE_TERMINATOR.as_bytes());
        for (name, value) in &self.entries {
            buf.put_slice(name.as_bytes());
            buf.put_slice(util::HEADER_NAME_VALUE_SEPARATOR.as_bytes());
            buf.put_slice(value.as_bytes());
            buf.put_slice(util::MESSAGE_TERMINATOR.as_bytes());
        }
        buf.put_slice(util::MESSAGE_TERMINATOR.as_bytes());
    }

    pub(crate) fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::InvalidHeaders(String::from("not utf8")))?;
        let mut lines = text.split(util::MESSAGE_TERMINATOR);
        let version = lines
            .next()
            .ok_or_else(|| Error::InvalidHeaders(String::from("empty block")))?;
        if !version.starts_with(util::HEADERS_VERSION_LINE) {
            return Err(Error::InvalidHeaders(format!(
                "invalid version line {:?}",
                version
            )));
        }
        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = match util::split_after(line, ":") {
                (name, Some(value)) => (name, value.trim_start_matches(' ')),
                (_, None) => {
                    return Err(Error::InvalidHeaders(format!("invalid line {:?}", line)));
                }
            };
            headers.append(name, value);
        }
        Ok(headers)
    }
}

/// A message delivered to a subscription
#[derive(Clone, Debug, PartialEq)]
pub struct Msg {
    subject: Subject,
    sid: Sid,
    reply_to: Option<Subject>,
    headers: Option<Headers>,
    payload: Bytes,
}

impl Msg {
    pub(crate) fn new(
        subject: Subject,
        sid: Sid,
        reply_to: Option<Subject>,
        headers: Option<Headers>,
        payload: Bytes,
    ) -> Self {
        Self {
            subject,
            sid,
            reply_to,
            headers,
            payload,
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn reply_to(&self) -> Option<&Subject> {
        self.reply_to.as_ref()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Representation of all possible server control lines. A control line is
/// the first line of a frame.
#[derive(Debug, PartialEq)]
pub enum ServerControl {
    Info(Info),
    Msg {
        subject: Subject,
        sid: Sid,
        reply_to: Option<Subject>,
        len: u64,
    },
    Hmsg {
        subject: Subject,
        sid: Sid,
        reply_to: Option<Subject>,
        header_len: u64,
        total_len: u64,
    },
    Ping,
    Pong,
    Ok,
    Err(ProtocolError),
}

/// Representation of all possible server frames. This is similar to
/// `ServerControl` except `MSG`/`HMSG` carry their payload.
#[derive(Debug, PartialEq)]
pub enum ServerMessage {
    Info(Info),
    Msg(Msg),
    Ping,
    Pong,
    Ok,
    Err(ProtocolError),
}

impl From<ServerControl> for ServerMessage {
    fn from(control: ServerControl) -> Self {
        match control {
            ServerControl::Info(info) => ServerMessage::Info(info),
            // `Msg` and `Hmsg` controls announce a payload and must go
            // through the codec's payload state instead.
            ServerControl::Msg { .. } | ServerControl::Hmsg { .. } => unreachable!(),
            ServerControl::Ping => ServerMessage::Ping,
            ServerControl::Pong => ServerMessage::Pong,
            ServerControl::Ok => ServerMessage::Ok,
            ServerControl::Err(e) => ServerMessage::Err(e),
        }
    }
}

/// Client states
///
/// ```text
///                   +-----------------------------------------+
///                   |                                         |
///                   v                                         |
/// +--------------+     +--------------+     +--------------+  |
/// |              |     |              |     |              |  |
/// | Disconnected +---->+  Connecting  +---->+  Connected   +--+
/// |              |     |              |     |              |
/// +--------------+     +--------------+     +--------------+
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum ClientState {
    /// The client is connected to an address
    Connected(Address),
    /// The client is trying to connect to an address
    Connecting(Address),
    /// The client is disconnected
    Disconnected,
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Connected(address) => write!(f, "Connected({})", address),
            ClientState::Connecting(address) => write!(f, "Connecting({})", address),
            ClientState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Tuning knobs for a [`Client`](crate::Client)
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of outbound frames the sender queue holds before publishers
    /// start awaiting capacity
    pub sender_queue_length: usize,
    /// Default per-subscription inbox capacity
    pub subscription_capacity: usize,
    /// High water mark, in bytes, of the pipe between the socket reader and
    /// the dispatcher
    pub read_pipe_high_water: usize,
    /// Largest inbound payload the parser accepts before treating the frame
    /// as a protocol violation
    pub max_payload: usize,
    /// Delay between reconnect attempts after a failed TCP connect
    pub reconnect_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sender_queue_length: util::DEFAULT_SENDER_QUEUE_LENGTH,
            subscription_capacity: util::DEFAULT_SUBSCRIPTION_CAPACITY,
            read_pipe_high_water: util::DEFAULT_READ_PIPE_HIGH_WATER,
            max_payload: util::DEFAULT_MAX_PAYLOAD,
            reconnect_delay: util::DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Monotonic traffic counters, readable without a lock
#[derive(Debug, Default)]
pub struct Counters {
    transmitted_bytes: AtomicU64,
    transmitted_messages: AtomicU64,
    received_bytes: AtomicU64,
    received_messages: AtomicU64,
    sender_queue_bytes: AtomicU64,
    receiver_queue_bytes: AtomicU64,
}

impl Counters {
    /// Total bytes handed to the kernel, including protocol overhead
    pub fn transmitted_bytes(&self) -> u64 {
        self.transmitted_bytes.load(Ordering::Relaxed)
    }

    /// Total frames written to the socket
    pub fn transmitted_messages(&self) -> u64 {
        self.transmitted_messages.load(Ordering::Relaxed)
    }

    /// Total bytes read from the socket
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Total `MSG`/`HMSG` frames parsed
    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    /// Bytes currently enqueued for the sender
    pub fn sender_queue_bytes(&self) -> u64 {
        self.sender_queue_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently buffered between the socket reader and the dispatcher
    pub fn receiver_queue_bytes(&self) -> u64 {
        self.receiver_queue_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_transmitted(&self, bytes: u64) {
        self.transmitted_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.transmitted_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_received_bytes(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_received_message(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_sender_queue_bytes(&self, bytes: u64) {
        self.sender_queue_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_sender_queue_bytes(&self, bytes: u64) {
        self.sender_queue_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_receiver_queue_bytes(&self, bytes: u64) {
        self.receiver_queue_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_receiver_queue_bytes(&self, bytes: u64) {
        self.receiver_queue_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}
