//! Periodic session refresh.
//!
//! A plain page load keeps the web session alive: the server answers with
//! rotated cookies in `Set-Cookie` and embeds a fresh form token
//! (`fb_dtsg`) in the page. Both are written back into the shared
//! [`SessionContext`] so the next bootstrap or socket upgrade uses them.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RefreshConfig};
use crate::error::{Result, SyncError};
use crate::session::{Cookie, SessionContext};

static DTSG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""DTSGInitialData".*?"token":"([^"]+)""#).unwrap());
static DTSG_FALLBACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"DTSGInitialData"[^}]*"token":"([^"]+)""#).unwrap());

/// Form token embedded in a page body, if any.
pub fn extract_fb_dtsg(body: &str) -> Option<&str> {
    DTSG_PATTERN
        .captures(body)
        .or_else(|| DTSG_FALLBACK.captures(body))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// What one `Set-Cookie` header asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieUpdate {
    Set(Cookie),
    Remove(String),
}

/// Parse a `Set-Cookie` header value. Attributes other than `Domain` and
/// `Max-Age` are ignored; a zero max-age or the literal value `deleted`
/// means the cookie is gone.
pub fn parse_set_cookie(raw: &str) -> Option<CookieUpdate> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"');

    let mut domain = None;
    let mut expired = value == "deleted";
    for attr in parts {
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        let key = key.trim();
        if key.eq_ignore_ascii_case("domain") {
            domain = Some(val.trim().to_string()).filter(|d| !d.is_empty());
        } else if key.eq_ignore_ascii_case("max-age") {
            expired |= val.trim().parse::<i64>().is_ok_and(|n| n <= 0);
        }
    }

    Some(if expired {
        CookieUpdate::Remove(name.to_string())
    } else {
        CookieUpdate::Set(Cookie {
            key: name.to_string(),
            value: value.to_string(),
            domain,
        })
    })
}

/// Counts from one refresh, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub cookies_updated: usize,
    pub cookies_removed: usize,
    pub token_updated: bool,
}

pub struct SessionRefresher {
    http: reqwest::Client,
    url: String,
    user_agent: String,
}

impl SessionRefresher {
    pub fn new(config: &ClientConfig, refresh: &RefreshConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.edge.connect_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            url: refresh.url.clone(),
            user_agent: config.edge.user_agent.clone(),
        })
    }

    /// Load the refresh page once and absorb whatever it hands back.
    pub async fn refresh(&self, session: &SessionContext) -> Result<RefreshOutcome> {
        debug!(url = %self.url, "Refreshing session");
        let response = self
            .http
            .get(&self.url)
            .header(COOKIE, session.cookie_header())
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(SyncError::from_reqwest)?
            .error_for_status()
            .map_err(SyncError::from_reqwest)?;

        if response.url().path().contains("login") {
            return Err(SyncError::Authentication(
                "session refresh redirected to login".into(),
            ));
        }

        let updates: Vec<CookieUpdate> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();

        let mut outcome = session.update_cookies(|jar| {
            let mut outcome = RefreshOutcome::default();
            for update in updates {
                match update {
                    CookieUpdate::Set(cookie) => {
                        jar.insert(cookie);
                        outcome.cookies_updated += 1;
                    }
                    CookieUpdate::Remove(name) => {
                        if jar.remove(&name) {
                            outcome.cookies_removed += 1;
                        }
                    }
                }
            }
            outcome
        });

        let body = response.text().await.map_err(SyncError::from_reqwest)?;
        if let Some(token) = extract_fb_dtsg(&body) {
            session.set_fb_dtsg(token);
            outcome.token_updated = true;
        }

        info!(
            cookies_updated = outcome.cookies_updated,
            cookies_removed = outcome.cookies_removed,
            token_updated = outcome.token_updated,
            "Session refreshed"
        );
        Ok(outcome)
    }
}

/// Call `refresh` every `interval` until cancelled. Failures are logged and
/// the schedule carries on.
pub async fn run_session_refresh<F, Fut>(
    interval: Duration,
    cancel: CancellationToken,
    mut refresh: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RefreshOutcome>>,
{
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = refresh() => result,
        };
        match result {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(failures, error = %e, "Session refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::session::CookieJar;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    // -- extract_fb_dtsg --

    #[test]
    fn finds_token_in_page_body() {
        let body = r#"<script>require("ServerJS"),["DTSGInitialData",[],{"token":"AQH-abc:12"},258]</script>"#;
        assert_eq!(extract_fb_dtsg(body), Some("AQH-abc:12"));
    }

    #[test]
    fn fallback_pattern_handles_unquoted_prefix() {
        let body = r#"define(DTSGInitialData",[],{"async_get_token":"x","token":"tok2"})"#;
        assert_eq!(extract_fb_dtsg(body), Some("tok2"));
    }

    #[test]
    fn no_token_in_body() {
        assert_eq!(extract_fb_dtsg("<html>hello</html>"), None);
        assert_eq!(extract_fb_dtsg(r#""DTSGInitialData",[],{}"#), None);
    }

    // -- parse_set_cookie --

    #[test]
    fn set_cookie_with_attributes() {
        let update =
            parse_set_cookie("xs=42%3Aabc; expires=Fri, 01 Jan 2027 00:00:00 GMT; Max-Age=31536000; path=/; domain=.facebook.com; secure; httponly");
        assert_eq!(
            update,
            Some(CookieUpdate::Set(Cookie {
                key: "xs".into(),
                value: "42%3Aabc".into(),
                domain: Some(".facebook.com".into()),
            }))
        );
    }

    #[test]
    fn deleted_or_expired_cookie_is_removed() {
        assert_eq!(
            parse_set_cookie("presence=deleted; expires=Thu, 01 Jan 1970 00:00:01 GMT; path=/"),
            Some(CookieUpdate::Remove("presence".into()))
        );
        assert_eq!(
            parse_set_cookie("fr=abc; Max-Age=0"),
            Some(CookieUpdate::Remove("fr".into()))
        );
    }

    #[test]
    fn malformed_set_cookie_is_skipped() {
        assert_eq!(parse_set_cookie("novalue"), None);
        assert_eq!(parse_set_cookie("=x; path=/"), None);
        assert_eq!(parse_set_cookie(""), None);
    }

    // -- HTTP round trip --

    type SeenCookies = Arc<std::sync::Mutex<Vec<Option<String>>>>;

    async fn spawn_page_server(
        body: &'static str,
    ) -> (String, SeenCookies, tokio::sync::oneshot::Sender<()>) {
        use axum::{
            Router,
            http::{HeaderMap, header},
            response::AppendHeaders,
            routing::get,
        };

        let seen: SeenCookies = Arc::default();
        let seen_route = seen.clone();
        let app = Router::new().route(
            "/",
            get(move |headers: HeaderMap| {
                let seen = seen_route.clone();
                async move {
                    seen.lock().unwrap().push(
                        headers
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string),
                    );
                    (
                        AppendHeaders([
                            (header::SET_COOKIE, "xs=rotated; Path=/; HttpOnly"),
                            (header::SET_COOKIE, "presence=deleted; Max-Age=0"),
                            (header::SET_COOKIE, "wd=1280x720; Path=/"),
                        ]),
                        body,
                    )
                }
            }),
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
        (format!("http://127.0.0.1:{port}/"), seen, tx)
    }

    fn refresher(url: String) -> SessionRefresher {
        let mut fc = FileConfig::default();
        fc.session.refresh_url = url;
        let config = ClientConfig::from_file(&fc);
        let refresh = config.refresh.clone().unwrap();
        SessionRefresher::new(&config, &refresh).unwrap()
    }

    fn cookie(key: &str, value: &str) -> Cookie {
        Cookie {
            key: key.into(),
            value: value.into(),
            domain: None,
        }
    }

    #[tokio::test]
    async fn refresh_rotates_cookies_and_token() {
        let (url, seen, _shutdown) =
            spawn_page_server(r#"<html>["DTSGInitialData",[],{"token":"fresh-dtsg"}]</html>"#).await;
        let session = SessionContext::new(CookieJar::new(vec![
            cookie("c_user", "4242"),
            cookie("xs", "original"),
            cookie("presence", "p"),
        ]))
        .unwrap();

        let outcome = refresher(url).refresh(&session).await.unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome {
                cookies_updated: 2,
                cookies_removed: 1,
                token_updated: true,
            }
        );
        assert_eq!(
            seen.lock().unwrap()[0].as_deref(),
            Some("c_user=4242; xs=original; presence=p")
        );

        let jar = session.cookies();
        assert_eq!(jar.get("xs"), Some("rotated"));
        assert_eq!(jar.get("wd"), Some("1280x720"));
        assert_eq!(jar.get("presence"), None);
        assert_eq!(session.fb_dtsg().as_deref(), Some("fresh-dtsg"));
        assert_eq!(session.user_id(), "4242");
    }

    #[tokio::test]
    async fn refresh_without_token_keeps_old_one() {
        let (url, _seen, _shutdown) = spawn_page_server("<html>no token here</html>").await;
        let session = SessionContext::new(CookieJar::new(vec![cookie("c_user", "1")]))
            .unwrap()
            .with_fb_dtsg("kept");

        let outcome = refresher(url).refresh(&session).await.unwrap();
        assert!(!outcome.token_updated);
        assert_eq!(session.fb_dtsg().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn unreachable_page_is_network_error() {
        let session = SessionContext::with_user_id("1", CookieJar::default());
        let err = refresher("http://127.0.0.1:1/".into())
            .refresh(&session)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }

    // -- run_session_refresh --

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_keeps_going_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let calls = calls.clone();
            run_session_refresh(Duration::from_secs(1200), cancel.clone(), move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n % 2 == 0 {
                        Err(SyncError::Network("reset".into()))
                    } else {
                        Ok(RefreshOutcome::default())
                    }
                }
            })
        });

        tokio::time::sleep(Duration::from_secs(1199)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(3 * 1200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap();
    }
}
