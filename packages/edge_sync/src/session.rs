//! Per-account session state shared by every task of one client.
//!
//! The user id is fixed for the life of the session. Everything else
//! (cookies, form token, client id, sync cursor, connection flags) sits
//! behind one short-lived lock and is never held across an await. Cursor
//! changes are also published on a `watch` channel so a consumer can persist
//! them as they happen.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Largest integer a JSON number can carry without losing precision.
pub const MAX_SESSION_NUMERIC_ID: u64 = (1 << 53) - 1;

/// Fresh random `s` value for the identity payload, drawn per connection.
pub fn new_session_numeric_id() -> u64 {
    rand::rng().random_range(1..=MAX_SESSION_NUMERIC_ID)
}

pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Sync cursor
// =============================================================================

/// Position in the server-side delta stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    #[serde(default)]
    pub last_seq_id: Option<u64>,
    #[serde(default)]
    pub sync_token: Option<String>,
}

impl SyncCursor {
    /// Move `last_seq_id` forward. Returns false (and leaves the cursor
    /// alone) when `seq_id` is not newer than what we already have.
    pub fn advance(&mut self, seq_id: u64) -> bool {
        match self.last_seq_id {
            Some(current) if seq_id <= current => false,
            _ => {
                self.last_seq_id = Some(seq_id);
                true
            }
        }
    }

    pub fn set_sync_token(&mut self, token: impl Into<String>) {
        self.sync_token = Some(token.into());
    }

    /// A warm resume needs both a token and a position.
    pub fn is_warm(&self) -> bool {
        self.sync_token.is_some() && self.last_seq_id.is_some()
    }

    /// Install a freshly bootstrapped sequence id. The token belongs to the
    /// old queue, so it goes.
    pub fn apply_bootstrap(&mut self, seq_id: u64) {
        self.advance(seq_id);
        self.sync_token = None;
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Config(format!(
                "reading cursor {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .map_err(|e| SyncError::Config(format!("writing cursor {}: {e}", path.display())))
    }
}

// =============================================================================
// Cookies
// =============================================================================

/// One exported browser cookie. Appstate exports use either `key` or `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    #[serde(alias = "name")]
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Session cookies sent with the bootstrap request and the socket upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new(cookies: Vec<Cookie>) -> Self {
        let mut jar = Self::default();
        for cookie in cookies {
            jar.insert(cookie);
        }
        jar
    }

    /// Parse an appstate export: a JSON array of `{key, value, domain}`.
    pub fn from_appstate_json(raw: &str) -> Result<Self> {
        let cookies: Vec<Cookie> = serde_json::from_str(raw)
            .map_err(|e| SyncError::Config(format!("appstate is not a cookie list: {e}")))?;
        if cookies.is_empty() {
            return Err(SyncError::Config("appstate contains no cookies".into()));
        }
        Ok(Self::new(cookies))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_appstate_json(&raw)
    }

    /// Later cookies with the same name replace earlier ones.
    pub fn insert(&mut self, cookie: Cookie) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| c.key == cookie.key) {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }

    /// Returns whether a cookie with that name was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.cookies.len();
        self.cookies.retain(|c| c.key != key);
        self.cookies.len() != before
    }

    /// `Cookie` header value: `a=1; b=2`.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.key, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// =============================================================================
// Session context
// =============================================================================

#[derive(Debug)]
struct SessionState {
    cookies: CookieJar,
    fb_dtsg: Option<String>,
    client_id: String,
    cursor: SyncCursor,
    mqtt_connected: bool,
    last_message_time: Option<Instant>,
    first_listen: bool,
}

/// Identity values captured once per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    pub user_id: String,
    pub client_id: String,
    pub session_numeric_id: u64,
}

#[derive(Debug)]
pub struct SessionContext {
    user_id: String,
    state: Mutex<SessionState>,
    cursor_tx: watch::Sender<SyncCursor>,
}

impl SessionContext {
    /// The user id is the value of the `c_user` cookie.
    pub fn new(cookies: CookieJar) -> Result<Self> {
        let user_id = cookies
            .get("c_user")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SyncError::Config("no c_user cookie in session".into()))?
            .to_string();
        Ok(Self::with_user_id(user_id, cookies))
    }

    pub fn with_user_id(user_id: impl Into<String>, cookies: CookieJar) -> Self {
        Self {
            user_id: user_id.into(),
            state: Mutex::new(SessionState {
                cookies,
                fb_dtsg: None,
                client_id: new_client_id(),
                cursor: SyncCursor::default(),
                mqtt_connected: false,
                last_message_time: None,
                first_listen: true,
            }),
            cursor_tx: watch::Sender::new(SyncCursor::default()),
        }
    }

    pub fn with_fb_dtsg(self, token: impl Into<String>) -> Self {
        self.set_fb_dtsg(token);
        self
    }

    /// Start from a cursor persisted by an earlier run.
    pub fn resume_from(self, cursor: SyncCursor) -> Self {
        self.update_cursor(|c| *c = cursor);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn cookies(&self) -> CookieJar {
        self.lock().cookies.clone()
    }

    /// `Cookie` header for the next request, reflecting every refresh so far.
    pub fn cookie_header(&self) -> String {
        self.lock().cookies.header_value()
    }

    pub fn update_cookies<R>(&self, f: impl FnOnce(&mut CookieJar) -> R) -> R {
        f(&mut self.lock().cookies)
    }

    pub fn fb_dtsg(&self) -> Option<String> {
        self.lock().fb_dtsg.clone()
    }

    pub fn set_fb_dtsg(&self, token: impl Into<String>) {
        self.lock().fb_dtsg = Some(token.into());
    }

    pub fn client_id(&self) -> String {
        self.lock().client_id.clone()
    }

    pub fn regenerate_client_id(&self) -> String {
        let id = new_client_id();
        debug!(client_id = %id, "Regenerated client id");
        self.lock().client_id = id.clone();
        id
    }

    /// Current client id plus a freshly drawn numeric session id.
    pub fn snapshot_identity(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            user_id: self.user_id.clone(),
            client_id: self.client_id(),
            session_numeric_id: new_session_numeric_id(),
        }
    }

    pub fn cursor(&self) -> SyncCursor {
        self.lock().cursor.clone()
    }

    /// Mutate the cursor. Watchers are notified only when it actually
    /// changed.
    pub fn update_cursor<R>(&self, f: impl FnOnce(&mut SyncCursor) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state.cursor);
        if *self.cursor_tx.borrow() != state.cursor {
            self.cursor_tx.send_replace(state.cursor.clone());
        }
        result
    }

    /// Receiver that wakes on every cursor change.
    pub fn subscribe_cursor(&self) -> watch::Receiver<SyncCursor> {
        self.cursor_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().mqtt_connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().mqtt_connected = connected;
    }

    /// Record that an inbound payload just arrived.
    pub fn touch(&self) {
        self.lock().last_message_time = Some(Instant::now());
    }

    pub fn last_message_time(&self) -> Option<Instant> {
        self.lock().last_message_time
    }

    /// Time since the last inbound payload, `None` if nothing arrived yet.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_message_time().map(|t| t.elapsed())
    }

    pub fn mark_listened(&self) {
        self.lock().first_listen = false;
    }

    /// Bootstrap is skipped only on the first listen of a session that
    /// already knows where it is.
    pub fn needs_bootstrap(&self) -> bool {
        let state = self.lock();
        !state.first_listen || state.cursor.last_seq_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jar(pairs: &[(&str, &str)]) -> CookieJar {
        CookieJar::new(
            pairs
                .iter()
                .map(|(k, v)| Cookie {
                    key: k.to_string(),
                    value: v.to_string(),
                    domain: Some(".facebook.com".into()),
                })
                .collect(),
        )
    }

    // ── SyncCursor ──────────────────────────────────────────────────────

    #[test]
    fn cursor_advances_forward_only() {
        let mut cursor = SyncCursor::default();
        assert!(cursor.advance(100));
        assert!(cursor.advance(105));
        assert!(!cursor.advance(104));
        assert!(!cursor.advance(105));
        assert_eq!(cursor.last_seq_id, Some(105));
    }

    #[test]
    fn bootstrap_clears_token_but_never_rewinds() {
        let mut cursor = SyncCursor {
            last_seq_id: Some(500),
            sync_token: Some("tok".into()),
        };
        cursor.apply_bootstrap(300);
        assert_eq!(cursor.last_seq_id, Some(500));
        assert!(cursor.sync_token.is_none());

        cursor.apply_bootstrap(900);
        assert_eq!(cursor.last_seq_id, Some(900));
    }

    #[test]
    fn cursor_is_warm_only_with_token_and_seq() {
        let mut cursor = SyncCursor::default();
        assert!(!cursor.is_warm());
        cursor.set_sync_token("t");
        assert!(!cursor.is_warm());
        cursor.advance(1);
        assert!(cursor.is_warm());
    }

    #[test]
    fn cursor_persists_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cursor.json");
        assert_eq!(SyncCursor::load(&path).unwrap(), None);

        let cursor = SyncCursor {
            last_seq_id: Some(42),
            sync_token: Some("abc".into()),
        };
        cursor.save(&path).unwrap();
        assert_eq!(SyncCursor::load(&path).unwrap(), Some(cursor));
    }

    #[test]
    fn corrupt_cursor_file_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cursor.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(SyncCursor::load(&path), Err(SyncError::Parse(_))));
    }

    // ── CookieJar ───────────────────────────────────────────────────────

    #[test]
    fn appstate_accepts_key_and_name() {
        let raw = r#"[
            {"key": "c_user", "value": "1000", "domain": "facebook.com"},
            {"name": "xs", "value": "secret"}
        ]"#;
        let jar = CookieJar::from_appstate_json(raw).unwrap();
        assert_eq!(jar.get("c_user"), Some("1000"));
        assert_eq!(jar.get("xs"), Some("secret"));
        assert_eq!(jar.header_value(), "c_user=1000; xs=secret");
    }

    #[test]
    fn appstate_rejects_empty_and_garbage() {
        assert!(matches!(
            CookieJar::from_appstate_json("[]"),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            CookieJar::from_appstate_json("{\"c_user\": 1}"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn duplicate_cookie_replaces_value() {
        let jar = jar(&[("xs", "old"), ("xs", "new")]);
        assert_eq!(jar.get("xs"), Some("new"));
        assert_eq!(jar.header_value(), "xs=new");
    }

    #[test]
    fn remove_drops_cookie() {
        let mut jar = jar(&[("c_user", "1"), ("xs", "x")]);
        assert!(jar.remove("xs"));
        assert!(!jar.remove("xs"));
        assert_eq!(jar.header_value(), "c_user=1");
    }

    #[test]
    fn load_appstate_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("appstate.json");
        std::fs::write(&path, r#"[{"key":"c_user","value":"7"}]"#).unwrap();
        assert_eq!(CookieJar::load(&path).unwrap().get("c_user"), Some("7"));
        assert!(CookieJar::load(&tmp.path().join("missing.json")).is_err());
    }

    // ── SessionContext ──────────────────────────────────────────────────

    #[test]
    fn user_id_comes_from_c_user() {
        let session = SessionContext::new(jar(&[("c_user", "1234"), ("xs", "x")])).unwrap();
        assert_eq!(session.user_id(), "1234");
        assert!(SessionContext::new(jar(&[("xs", "x")])).is_err());
    }

    #[test]
    fn regenerate_changes_client_id() {
        let session = SessionContext::with_user_id("1", CookieJar::default());
        let before = session.client_id();
        let after = session.regenerate_client_id();
        assert_ne!(before, after);
        assert_eq!(session.client_id(), after);
        assert!(uuid::Uuid::parse_str(&after).is_ok());
    }

    #[test]
    fn snapshot_draws_fresh_numeric_id_in_range() {
        let session = SessionContext::with_user_id("1", CookieJar::default());
        for _ in 0..64 {
            let snap = session.snapshot_identity();
            assert!(snap.session_numeric_id >= 1);
            assert!(snap.session_numeric_id <= MAX_SESSION_NUMERIC_ID);
            assert_eq!(snap.client_id, session.client_id());
        }
    }

    #[test]
    fn needs_bootstrap_rules() {
        let session = SessionContext::with_user_id("1", CookieJar::default());
        assert!(session.needs_bootstrap());

        let resumed = SessionContext::with_user_id("1", CookieJar::default()).resume_from(
            SyncCursor {
                last_seq_id: Some(10),
                sync_token: None,
            },
        );
        assert!(!resumed.needs_bootstrap());
        resumed.mark_listened();
        assert!(resumed.needs_bootstrap());
    }

    #[test]
    fn cookie_and_token_updates_are_visible() {
        let session = SessionContext::new(jar(&[("c_user", "9"), ("xs", "old")])).unwrap();
        assert!(session.fb_dtsg().is_none());
        session.update_cookies(|jar| {
            jar.insert(Cookie {
                key: "xs".into(),
                value: "new".into(),
                domain: None,
            })
        });
        session.set_fb_dtsg("tok");
        assert_eq!(session.cookie_header(), "c_user=9; xs=new");
        assert_eq!(session.fb_dtsg().as_deref(), Some("tok"));
        assert_eq!(session.user_id(), "9");
    }

    #[tokio::test]
    async fn cursor_watch_fires_only_on_change() {
        let session = SessionContext::with_user_id("1", CookieJar::default());
        let mut rx = session.subscribe_cursor();

        session.update_cursor(|c| c.advance(5));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().last_seq_id, Some(5));

        // Older marker: cursor untouched, no wakeup
        session.update_cursor(|c| c.advance(3));
        assert!(!rx.has_changed().unwrap());

        session.update_cursor(|c| c.set_sync_token("abc"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().sync_token.as_deref(), Some("abc"));
    }

    #[test]
    fn resumed_cursor_is_published() {
        let cursor = SyncCursor {
            last_seq_id: Some(77),
            sync_token: Some("t".into()),
        };
        let session =
            SessionContext::with_user_id("1", CookieJar::default()).resume_from(cursor.clone());
        assert_eq!(*session.subscribe_cursor().borrow(), cursor);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_for_tracks_last_payload() {
        let session = SessionContext::with_user_id("1", CookieJar::default());
        assert!(session.idle_for().is_none());
        session.touch();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(session.idle_for(), Some(Duration::from_secs(30)));
    }
}
