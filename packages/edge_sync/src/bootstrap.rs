//! One-shot HTTP query that yields the starting sequence id.

use reqwest::header::{COOKIE, USER_AGENT};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::session::SessionContext;

/// Error code the batch endpoint returns even for healthy sessions.
pub const BENIGN_ERROR_CODE: i64 = 1357001;

/// Anti-JSON-hijacking prefix the platform puts in front of API responses.
const RESPONSE_PREFIX: &str = "for (;;);";

pub struct Bootstrapper {
    http: reqwest::Client,
    url: String,
    doc_id: String,
    user_agent: String,
}

impl Bootstrapper {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.edge.connect_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            url: config.bootstrap.url.clone(),
            doc_id: config.bootstrap.doc_id.clone(),
            user_agent: config.edge.user_agent.clone(),
        })
    }

    /// The `queries` form field: one batched inbox query asking for the seq id.
    pub fn queries_param(&self) -> String {
        json!({
            "o0": {
                "doc_id": self.doc_id,
                "query_params": {
                    "limit": 1,
                    "before": null,
                    "tags": ["INBOX"],
                    "includeDeliveryReceipts": false,
                    "includeSeqID": true,
                }
            }
        })
        .to_string()
    }

    fn form(&self, session: &SessionContext) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("queries", self.queries_param()),
            ("av", session.user_id().to_string()),
            ("__a", "1".to_string()),
        ];
        if let Some(token) = session.fb_dtsg() {
            form.push(("fb_dtsg", token));
        }
        form
    }

    /// Ask the server for the viewer's current sync sequence id.
    pub async fn fetch_seq_id(&self, session: &SessionContext) -> Result<u64> {
        debug!(url = %self.url, "Fetching sequence id");

        let response = self
            .http
            .post(&self.url)
            .header(COOKIE, session.cookie_header())
            .header(USER_AGENT, &self.user_agent)
            .form(&self.form(session))
            .send()
            .await
            .map_err(SyncError::from_reqwest)?
            .error_for_status()
            .map_err(SyncError::from_reqwest)?;

        // Expired sessions get bounced to the login page instead of an error body
        if response.url().path().contains("login") {
            return Err(SyncError::Authentication(
                "bootstrap redirected to login".into(),
            ));
        }

        let body = response.text().await.map_err(SyncError::from_reqwest)?;
        parse_bootstrap_response(&body)
    }

    /// Fetch the seq id and install it into the session cursor. Any sync
    /// token from a previous queue is dropped.
    pub async fn bootstrap(&self, session: &SessionContext) -> Result<u64> {
        let seq_id = self.fetch_seq_id(session).await?;
        let stored = session.update_cursor(|cursor| {
            cursor.apply_bootstrap(seq_id);
            cursor.last_seq_id.unwrap_or(seq_id)
        });
        if stored != seq_id {
            warn!(
                fetched = seq_id,
                kept = stored,
                "Bootstrap returned an older sequence id than the cursor, keeping cursor"
            );
        }
        info!(seq_id = stored, "Sequence id bootstrapped");
        Ok(stored)
    }
}

/// Split a batch response into its JSON documents.
fn parse_batch_documents(body: &str) -> Result<Vec<Value>> {
    let body = body.trim_start();
    let body = body.strip_prefix(RESPONSE_PREFIX).unwrap_or(body);

    let docs = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line)
                .map_err(|e| SyncError::Validation(format!("bootstrap response is not JSON: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if docs.is_empty() {
        return Err(SyncError::Validation("empty bootstrap response".into()));
    }
    Ok(docs)
}

fn seq_id_from(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Extract `o0.data.viewer.message_threads.sync_sequence_id` from a batch
/// response body.
pub fn parse_bootstrap_response(body: &str) -> Result<u64> {
    let docs = parse_batch_documents(body)?;

    for doc in &docs {
        if let Some(code) = doc.get("error").and_then(Value::as_i64) {
            if code != BENIGN_ERROR_CODE {
                let summary = doc
                    .get("errorSummary")
                    .and_then(Value::as_str)
                    .unwrap_or("session rejected");
                return Err(SyncError::Authentication(format!(
                    "bootstrap error {code}: {summary}"
                )));
            }
            debug!(code, "Ignoring benign bootstrap error code");
        }
    }

    let first = &docs[0];
    if !first.is_object() {
        return Err(SyncError::Validation(
            "bootstrap response has unexpected shape".into(),
        ));
    }

    first
        .pointer("/o0/data/viewer/message_threads/sync_sequence_id")
        .and_then(seq_id_from)
        .ok_or_else(|| SyncError::Validation("sequence id not found in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::session::{Cookie, CookieJar};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const GOOD: &str = r#"for (;;);{"o0":{"data":{"viewer":{"message_threads":{"sync_sequence_id":"1001"}}}}}
{"successful_results":1,"error_results":0,"skipped_results":0}"#;

    // -- parse_bootstrap_response --

    #[test]
    fn parses_string_seq_id_with_prefix() {
        assert_eq!(parse_bootstrap_response(GOOD).unwrap(), 1001);
    }

    #[test]
    fn parses_integer_seq_id_without_prefix() {
        let body = r#"{"o0":{"data":{"viewer":{"message_threads":{"sync_sequence_id":77}}}}}"#;
        assert_eq!(parse_bootstrap_response(body).unwrap(), 77);
    }

    #[test]
    fn missing_field_is_validation() {
        let body = r#"{"o0":{"data":{"viewer":{"message_threads":{}}}}}"#;
        assert!(matches!(
            parse_bootstrap_response(body),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn non_json_is_validation() {
        assert!(matches!(
            parse_bootstrap_response("<html>login</html>"),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            parse_bootstrap_response(""),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn array_document_is_validation() {
        assert!(matches!(
            parse_bootstrap_response("[1,2,3]"),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn auth_error_code_is_authentication() {
        let body = r#"for (;;);{"error":1357004,"errorSummary":"Sorry, something went wrong"}"#;
        assert!(matches!(
            parse_bootstrap_response(body),
            Err(SyncError::Authentication(_))
        ));
    }

    #[test]
    fn benign_error_code_is_ignored() {
        let body = r#"{"error":1357001}
{"o0":{"data":{"viewer":{"message_threads":{"sync_sequence_id":5}}}}}"#;
        // The benign marker leads, so the first document lacks the field
        assert!(matches!(
            parse_bootstrap_response(body),
            Err(SyncError::Validation(_))
        ));

        let body = r#"{"o0":{"data":{"viewer":{"message_threads":{"sync_sequence_id":5}}}},"error":1357001}"#;
        assert_eq!(parse_bootstrap_response(body).unwrap(), 5);
    }

    // -- HTTP round trip against a local server --

    type Seen = Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>>;

    async fn spawn_graphql_server(
        body: &'static str,
    ) -> (String, Seen, tokio::sync::oneshot::Sender<()>) {
        use axum::{Form, Router, http::HeaderMap, routing::post};

        let seen: Seen = Arc::default();
        let seen_route = seen.clone();
        let app = Router::new().route(
            "/api/graphqlbatch/",
            post(
                move |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| {
                    let seen = seen_route.clone();
                    async move {
                        let cookie = headers
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.lock().unwrap().push((form, cookie));
                        body
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        (
            format!("http://127.0.0.1:{port}/api/graphqlbatch/"),
            seen,
            tx,
        )
    }

    fn bootstrapper(url: String) -> Bootstrapper {
        let mut fc = FileConfig::default();
        fc.bootstrap.url = url;
        Bootstrapper::new(&ClientConfig::from_file(&fc)).unwrap()
    }

    fn session() -> SessionContext {
        SessionContext::new(CookieJar::new(vec![
            Cookie {
                key: "c_user".into(),
                value: "4242".into(),
                domain: None,
            },
            Cookie {
                key: "xs".into(),
                value: "abc".into(),
                domain: None,
            },
        ]))
        .unwrap()
        .with_fb_dtsg("dtsg-token")
    }

    #[tokio::test]
    async fn bootstrap_stores_seq_id_and_sends_form() {
        let (url, seen, _shutdown) = spawn_graphql_server(GOOD).await;
        let session = session();
        session.update_cursor(|c| c.set_sync_token("stale"));

        let seq = bootstrapper(url).bootstrap(&session).await.unwrap();
        assert_eq!(seq, 1001);
        assert_eq!(session.cursor().last_seq_id, Some(1001));
        assert!(session.cursor().sync_token.is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (form, cookie) = &seen[0];
        assert_eq!(form.get("av").map(String::as_str), Some("4242"));
        assert_eq!(form.get("__a").map(String::as_str), Some("1"));
        assert_eq!(form.get("fb_dtsg").map(String::as_str), Some("dtsg-token"));
        let queries: Value = serde_json::from_str(&form["queries"]).unwrap();
        assert_eq!(queries["o0"]["doc_id"], "3336396659757871");
        assert_eq!(queries["o0"]["query_params"]["includeSeqID"], true);
        assert_eq!(queries["o0"]["query_params"]["tags"], json!(["INBOX"]));
        assert_eq!(cookie.as_deref(), Some("c_user=4242; xs=abc"));
    }

    #[tokio::test]
    async fn bootstrap_auth_error_leaves_cursor_empty() {
        let (url, _seen, _shutdown) = spawn_graphql_server(r#"{"error":1357004}"#).await;
        let session = session();
        let err = bootstrapper(url).bootstrap(&session).await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(session.cursor().last_seq_id.is_none());
    }

    #[tokio::test]
    async fn bootstrap_unreachable_is_network() {
        let err = bootstrapper("http://127.0.0.1:1/api/graphqlbatch/".into())
            .bootstrap(&session())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }
}
