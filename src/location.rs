//! Location and the history adapter boundary. Spec §1 treats the history
//! adapter as an external collaborator; this module only defines the trait
//! it must implement plus the value types that cross that boundary.

use rand::Rng;
use serde::{Deserialize, Serialize};

pub type LocationKey = String;

/// Generates an opaque key the way the source system does: a short random
/// base36 string. The initial entry's key is always `"default"` (spec §3).
pub fn new_key() -> LocationKey {
    let mut rng = rand::thread_rng();
    let n: u64 = rng.gen();
    base36(n)
}

fn base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub pathname: String,
    pub search: String,
    pub hash: String,
    pub state: serde_json::Value,
    pub key: LocationKey,
}

impl Location {
    pub fn new(pathname: impl Into<String>) -> Self {
        Location {
            pathname: pathname.into(),
            search: String::new(),
            hash: String::new(),
            state: serde_json::Value::Null,
            key: "default".to_string(),
        }
    }

    /// `pathname + search + hash`, the portion that identifies "the same
    /// place" independent of history-entry identity.
    pub fn href(&self) -> String {
        format!("{}{}{}", self.pathname, self.search, self.hash)
    }

    pub fn with_key(mut self, key: impl Into<LocationKey>) -> Self {
        self.key = key.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Pop,
    Push,
    Replace,
}

/// The external collaborator described in spec §1: "provides current
/// location, push/replace/go, and a listen callback; supplies createHref
/// and URL parsing." Implemented by a platform adapter (browser, hash,
/// memory) outside this crate's scope; a `MemoryHistory` reference
/// implementation lives in [`crate::testing`] for engine tests.
pub trait History: Send + Sync {
    fn location(&self) -> Location;
    fn push(&self, location: &Location);
    fn replace(&self, location: &Location);
    fn go(&self, delta: i32);
    /// Registers a POP listener, returning an unsubscribe handle. Invoked
    /// with the new location and the historyAction that produced it.
    fn listen(&self, callback: Box<dyn Fn(HistoryAction, Location) + Send + Sync>) -> Box<dyn FnOnce() + Send>;
    fn create_href(&self, location: &Location) -> String;
}
