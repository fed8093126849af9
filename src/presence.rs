//! Presence tracking: which gateway instance currently owns a user's connection.
//!
//! Grounded on the donor source's `presence_module.cpp`: a key is derived from the
//! user id, the stored value carries the owning gateway's RPC address plus a
//! last-seen timestamp, and entries expire after a TTL so a crashed gateway's
//! routing entries self-heal instead of requiring active cleanup. The original talks
//! to Redis directly; here that's abstracted behind [`PresenceStore`] so the gateway
//! can be tested against an in-memory store and pointed at a real backend (Redis or
//! otherwise) without this module knowing the wire dialect.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, limits::PresenceLimits};

/// The value stored for a present user: which gateway owns the connection, and when
/// it was last confirmed alive. Serializes to the JSON blob format the donor reads;
/// `PresenceStore::get` also accepts the donor's legacy raw-string format for
/// backward compatibility (see [`InMemoryPresenceStore`] and [`parse_stored_value`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceRecord {
    pub gateway_rpc: String,
    pub last_seen_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parses a stored presence value, accepting both the current JSON encoding and the
/// donor's legacy raw `gateway_rpc` string (no JSON, no `last_seen_ms`) for
/// forward-compatible reads of values written by an older process.
fn parse_stored_value(raw: &str) -> Result<PresenceRecord, Error> {
    if raw.trim_start().starts_with('{') {
        serde_json::from_str(raw).map_err(|e| Error::Protocol(format!("malformed presence record: {e}")))
    } else {
        Ok(PresenceRecord {
            gateway_rpc: raw.to_string(),
            last_seen_ms: now_ms(),
        })
    }
}

/// Backend-agnostic presence storage. A real deployment implements this over Redis
/// (`SET key value EX ttl` / `GET key` / `DEL key`, as the donor does); tests and
/// local development can use [`InMemoryPresenceStore`].
#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set(&self, key: &str, record: &PresenceRecord, ttl_sec: u32) -> Result<(), Error>;
    async fn get(&self, key: &str) -> Result<Option<PresenceRecord>, Error>;
    async fn del(&self, key: &str) -> Result<(), Error>;
}

struct StoredEntry {
    raw: String,
    expires_at_ms: u64,
}

/// A TTL map suitable for tests and single-instance deployments. Expiry is checked
/// lazily on read, matching how the donor relies on Redis's own `EX` expiry rather
/// than an active sweep.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn set(&self, key: &str, record: &PresenceRecord, ttl_sec: u32) -> Result<(), Error> {
        let raw = serde_json::to_string(record).map_err(|e| Error::Backend(e.to_string()))?;
        let expires_at_ms = now_ms() + (ttl_sec as u64 * 1000);
        self.entries
            .lock()
            .expect("presence map poisoned")
            .insert(key.to_string(), StoredEntry { raw, expires_at_ms });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<PresenceRecord>, Error> {
        let mut entries = self.entries.lock().expect("presence map poisoned");
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if entry.expires_at_ms <= now_ms() {
            entries.remove(key);
            return Ok(None);
        }
        Ok(Some(parse_stored_value(&entry.raw)?))
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().expect("presence map poisoned").remove(key);
        Ok(())
    }
}

/// Rock RPC command codes handled by [`handle_command`], matching the donor's
/// `kCmdSetOnline`/`kCmdSetOffline`/`kCmdHeartbeat`/`kCmdGetRoute` constants.
pub mod cmd {
    pub const SET_ONLINE: u32 = 201;
    pub const SET_OFFLINE: u32 = 202;
    pub const HEARTBEAT: u32 = 203;
    pub const GET_ROUTE: u32 = 204;
}

/// The body of a presence request, shared across SET_ONLINE/HEARTBEAT/SET_OFFLINE/
/// GET_ROUTE — fields not relevant to a given command are simply ignored, matching
/// the donor's single-struct-for-all-subcommands layout.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceRequest {
    pub uid: u64,
    #[serde(default)]
    pub gateway_rpc: String,
    #[serde(default)]
    pub ttl_sec: u32,
}

/// The result of handling a presence command: an HTTP-style status plus a short
/// message, mirroring the donor's `(code, message)` response pairs so this maps
/// directly onto a Rock RPC result envelope.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PresenceResult {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<PresenceRecord>,
}

impl PresenceResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 200,
            message: message.into(),
            record: None,
        }
    }

    fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            record: None,
        }
    }
}

fn presence_key(prefix: &str, uid: u64) -> String {
    format!("{prefix}{uid}")
}

/// Dispatches a presence command against `store`, applying the same validation the
/// donor performs before touching the backend: `uid == 0` is always rejected, and
/// SET_ONLINE/HEARTBEAT additionally require a non-empty `gateway_rpc`.
pub async fn handle_command(
    store: &dyn PresenceStore,
    limits: &PresenceLimits,
    command: u32,
    req: &PresenceRequest,
) -> PresenceResult {
    if req.uid == 0 {
        return PresenceResult::error(400, "missing uid");
    }
    let key = presence_key(&limits.key_prefix, req.uid);

    match command {
        cmd::SET_ONLINE | cmd::HEARTBEAT => {
            if req.gateway_rpc.is_empty() {
                return PresenceResult::error(400, "missing gateway_rpc");
            }
            let ttl = if req.ttl_sec == 0 { limits.ttl_sec } else { req.ttl_sec };
            let record = PresenceRecord {
                gateway_rpc: req.gateway_rpc.clone(),
                last_seen_ms: now_ms(),
            };
            match store.set(&key, &record, ttl).await {
                Ok(()) => PresenceResult::ok("ok"),
                Err(_) => PresenceResult::error(500, "redis set failed"),
            }
        }
        cmd::SET_OFFLINE => match store.del(&key).await {
            Ok(()) => PresenceResult::ok("ok"),
            Err(_) => PresenceResult::error(500, "redis del failed"),
        },
        cmd::GET_ROUTE => match store.get(&key).await {
            Ok(Some(record)) => PresenceResult {
                code: 200,
                message: "ok".to_string(),
                record: Some(record),
            },
            Ok(None) => PresenceResult::error(404, "not found"),
            Err(_) => PresenceResult::error(500, "redis get failed"),
        },
        _ => PresenceResult::error(400, "unknown presence command"),
    }
}
