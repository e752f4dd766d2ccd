//! Builds and opens one authenticated edge connection: identity payload,
//! endpoint URL, MQTT CONNECT, topic subscription and the initial sync
//! request.

use mqtt_wire::{Connect, QoS};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tracing::{info, warn};

use crate::config::EdgeConfig;
use crate::error::{Result, SyncError};
use crate::session::{IdentitySnapshot, SessionContext, SyncCursor};
use crate::topics::{
    CREATE_QUEUE_TOPIC, DELTA_BATCH_SIZE, GET_DIFFS_TOPIC, MAX_DELTAS_ABLE_TO_PROCESS,
    SUBSCRIBE_TOPICS, SYNC_API_VERSION, SYNC_ENCODING,
};
use crate::transport::{self, ConnectionHandle, OpenParams, TransportEvent};

pub const MQTT_CLIENT_ID: &str = "mqttwsclient";
pub const MQTT_PROTOCOL_NAME: &str = "MQIsdp";
pub const MQTT_PROTOCOL_LEVEL: u8 = 3;
pub const ORIGIN: &str = "https://www.messenger.com";
pub const REFERER: &str = "https://www.messenger.com/";

/// The JSON carried in the CONNECT username field. This is the whole
/// authentication step; there is no separate handshake.
pub fn identity_payload(identity: &IdentitySnapshot, edge: &EdgeConfig) -> Value {
    json!({
        "u": identity.user_id,
        "s": identity.session_numeric_id,
        "chat_on": edge.online,
        "fg": false,
        "d": identity.client_id,
        "ct": "websocket",
        "aid": edge.app_id,
        "mqtt_sid": "",
        "cp": 3,
        "ecp": 10,
        "st": [],
        "pm": [],
        "dc": "",
        "no_auto_fg": true,
        "gas": null,
        "pack": [],
        "a": edge.user_agent,
    })
}

pub fn endpoint_url(base: &str, region: Option<&str>, sid: u64, client_id: &str) -> String {
    match region {
        Some(region) => format!(
            "{base}?region={}&sid={sid}&cid={client_id}",
            region.to_lowercase()
        ),
        None => format!("{base}?sid={sid}&cid={client_id}"),
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| SyncError::Config(format!("invalid {name} header: {e}")))
}

/// Upgrade request with the browser-like headers the edge expects.
pub fn build_request(url: &str, session: &SessionContext, edge: &EdgeConfig) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(SyncError::from_tungstenite)?;
    let headers = request.headers_mut();
    headers.insert(
        header::COOKIE,
        header_value("Cookie", &session.cookie_header())?,
    );
    headers.insert(header::ORIGIN, HeaderValue::from_static(ORIGIN));
    headers.insert(header::REFERER, HeaderValue::from_static(REFERER));
    headers.insert(
        header::USER_AGENT,
        header_value("User-Agent", &edge.user_agent)?,
    );
    Ok(request)
}

pub fn connect_packet(username: String, edge: &EdgeConfig) -> Connect {
    Connect {
        protocol_name: MQTT_PROTOCOL_NAME.to_string(),
        protocol_level: MQTT_PROTOCOL_LEVEL,
        client_id: MQTT_CLIENT_ID.to_string(),
        username: Some(username),
        password: None,
        clean_session: true,
        keep_alive: edge.keepalive.as_secs().min(u16::MAX as u64) as u16,
    }
}

/// The one publish that starts delta delivery on a new connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub topic: &'static str,
    pub payload: Value,
}

impl SyncRequest {
    pub fn is_warm(&self) -> bool {
        self.topic == GET_DIFFS_TOPIC
    }
}

/// Cold start without a sync token, warm resume with one. A cursor with no
/// sequence id cannot start either.
pub fn initial_sync_request(user_id: &str, cursor: &SyncCursor) -> Result<SyncRequest> {
    let Some(seq_id) = cursor.last_seq_id else {
        return Err(SyncError::Validation(
            "no sequence id to start sync from".into(),
        ));
    };

    let mut payload = json!({
        "sync_api_version": SYNC_API_VERSION,
        "max_deltas_able_to_process": MAX_DELTAS_ABLE_TO_PROCESS,
        "delta_batch_size": DELTA_BATCH_SIZE,
        "encoding": SYNC_ENCODING,
        "entity_fbid": user_id,
    });

    let topic = match &cursor.sync_token {
        Some(token) => {
            payload["last_seq_id"] = json!(seq_id);
            payload["sync_token"] = json!(token);
            GET_DIFFS_TOPIC
        }
        None => {
            payload["initial_titan_sequence_id"] = json!(seq_id);
            payload["device_params"] = Value::Null;
            CREATE_QUEUE_TOPIC
        }
    };
    Ok(SyncRequest { topic, payload })
}

/// Open a connection, subscribe to every topic and send the initial sync
/// request built from the cursor as it is right now.
pub async fn connect(
    session: &SessionContext,
    edge: &EdgeConfig,
    conn_id: u64,
    events: mpsc::Sender<TransportEvent>,
) -> Result<ConnectionHandle> {
    let identity = session.snapshot_identity();
    let url = endpoint_url(
        &edge.url,
        edge.region.as_deref(),
        identity.session_numeric_id,
        &identity.client_id,
    );
    info!(conn_id, client_id = %identity.client_id, "Connecting to edge");

    let username = identity_payload(&identity, edge).to_string();
    let handle = transport::open(OpenParams {
        conn_id,
        request: build_request(&url, session, edge)?,
        connect: connect_packet(username, edge),
        connect_timeout: edge.connect_timeout,
        keepalive: edge.keepalive,
        events,
    })
    .await?;

    session.set_connected(true);
    session.touch();

    if let Err(e) = start_sync(session, &handle).await {
        warn!(conn_id, error = %e, "Edge session setup failed");
        session.set_connected(false);
        handle.close().await;
        return Err(e);
    }
    Ok(handle)
}

async fn start_sync(session: &SessionContext, handle: &ConnectionHandle) -> Result<()> {
    handle.subscribe(&SUBSCRIBE_TOPICS, QoS::AtMostOnce).await?;

    let request = initial_sync_request(session.user_id(), &session.cursor())?;
    info!(
        conn_id = handle.conn_id(),
        topic = request.topic,
        warm = request.is_warm(),
        "Requesting sync"
    );
    handle
        .publish(
            request.topic,
            request.payload.to_string().into_bytes(),
            QoS::AtLeastOnce,
        )
        .await
}
