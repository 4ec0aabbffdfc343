use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use taskdesk_core::{Session, TaskList};
use tokio::sync::RwLock;
use tracing::debug;
use ulid::Ulid;

pub const SESSION_COOKIE: &str = "taskdesk_sid";
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24);
pub const MAX_SESSIONS: usize = 10_000;

/// Per-browser state kept in process memory and keyed by the session cookie.
#[derive(Debug, Clone, Default)]
pub struct BrowserSession {
    pub pending_verifier: Option<String>,
    pub session: Option<Session>,
    pub tasks: Option<TaskList>,
    pub flash: Option<String>,
}

#[derive(Debug)]
struct Slot {
    entry: BrowserSession,
    touched: Instant,
}

/// Entries idle longer than the TTL are pruned on insert, and the least recently used
/// entry is evicted once the store is at capacity.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Slot>>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_limits(SESSION_TTL, MAX_SESSIONS)
    }
}

impl SessionStore {
    #[must_use]
    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self { inner: Arc::default(), ttl, capacity: capacity.max(1) }
    }

    pub async fn get(&self, id: &str) -> Option<BrowserSession> {
        let sessions = self.inner.read().await;
        sessions
            .get(id)
            .filter(|slot| slot.touched.elapsed() < self.ttl)
            .map(|slot| slot.entry.clone())
    }

    /// Apply `edit` to an existing, unexpired entry. Unknown ids are never inserted.
    pub async fn edit<R>(&self, id: &str, edit: impl FnOnce(&mut BrowserSession) -> R) -> Option<R> {
        let mut sessions = self.inner.write().await;
        let slot = sessions.get_mut(id).filter(|slot| slot.touched.elapsed() < self.ttl)?;
        slot.touched = Instant::now();
        Some(edit(&mut slot.entry))
    }

    /// Apply `edit` to the entry for `id`, creating it when missing.
    pub async fn upsert<R>(&self, id: &str, edit: impl FnOnce(&mut BrowserSession) -> R) -> R {
        let mut sessions = self.inner.write().await;
        if !sessions.contains_key(id) {
            self.make_room(&mut sessions);
        }
        let slot = sessions
            .entry(id.to_string())
            .or_insert_with(|| Slot { entry: BrowserSession::default(), touched: Instant::now() });
        if slot.touched.elapsed() >= self.ttl {
            slot.entry = BrowserSession::default();
        }
        slot.touched = Instant::now();
        edit(&mut slot.entry)
    }

    pub async fn remove(&self, id: &str) -> Option<BrowserSession> {
        self.inner.write().await.remove(id).map(|slot| slot.entry)
    }

    fn make_room(&self, sessions: &mut HashMap<String, Slot>) {
        let before = sessions.len();
        sessions.retain(|_, slot| slot.touched.elapsed() < self.ttl);
        while sessions.len() >= self.capacity {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, slot)| slot.touched)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => sessions.remove(&id),
                None => break,
            };
        }
        if sessions.len() < before {
            debug!(evicted = before - sessions.len(), "browser sessions pruned");
        }
    }

    #[cfg(test)]
    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Existing session id from the cookie jar, if any.
pub fn session_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// Issue a fresh session id, replacing any cookie the browser sent.
pub fn issue_session_id(jar: CookieJar) -> (CookieJar, String) {
    let id = Ulid::new().to_string();
    let cookie = Cookie::build((SESSION_COOKIE, id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    (jar.add(cookie), id)
}

pub fn clear_session_cookie(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
}
