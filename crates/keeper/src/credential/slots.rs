// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backing locations for credential keys.
//!
//! A [`CredentialSource`] can be read and superseded; a [`CredentialSlots`]
//! can also be written. The store consults read-only override sources
//! (handoff directory, environment) before its own writable slots.
//!
//! Every location reads and writes a whole [`SlotRecord`] at once, so a
//! reader in any process sees one complete pair, never two halves.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credential::CredentialKey;

/// File holding the slot record inside a slot directory.
pub const SLOT_FILE: &str = "credentials.json";

/// All credential keys of one location.
#[derive(Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Epoch second at which renewal is due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl SlotRecord {
    pub fn get(&self, key: CredentialKey) -> Option<String> {
        match key {
            CredentialKey::AccessToken => self.access_token.clone(),
            CredentialKey::RefreshToken => self.refresh_token.clone(),
            CredentialKey::ExpiresAt => self.expires_at.map(|v| v.to_string()),
        }
    }

    pub fn set(&mut self, key: CredentialKey, value: &str) -> anyhow::Result<()> {
        match key {
            CredentialKey::AccessToken => self.access_token = Some(value.to_owned()),
            CredentialKey::RefreshToken => self.refresh_token = Some(value.to_owned()),
            CredentialKey::ExpiresAt => self.expires_at = Some(value.trim().parse()?),
        }
        Ok(())
    }

    pub fn remove(&mut self, key: CredentialKey) {
        match key {
            CredentialKey::AccessToken => self.access_token = None,
            CredentialKey::RefreshToken => self.refresh_token = None,
            CredentialKey::ExpiresAt => self.expires_at = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.expires_at.is_none()
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for SlotRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRecord")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A place credential keys can be read from.
pub trait CredentialSource: Send + Sync {
    /// Short label for logs and status output.
    fn name(&self) -> &'static str;

    /// Read every key in one step.
    fn load(&self) -> SlotRecord;

    fn get(&self, key: CredentialKey) -> Option<String> {
        self.load().get(key)
    }

    /// Forget whatever this source holds so a newer local write takes
    /// precedence on subsequent reads.
    fn discard(&self) {}
}

/// A writable backing location.
pub trait CredentialSlots: CredentialSource {
    /// Replace every key in one step. An empty record removes everything.
    fn save(&self, record: &SlotRecord) -> anyhow::Result<()>;

    fn set(&self, key: CredentialKey, value: &str) -> anyhow::Result<()> {
        let mut record = self.load();
        record.set(key, value)?;
        self.save(&record)
    }

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: CredentialKey) -> anyhow::Result<()> {
        let mut record = self.load();
        record.remove(key);
        self.save(&record)
    }
}

// ---------------------------------------------------------------------------
// FileSlots
// ---------------------------------------------------------------------------

/// A JSON slot record inside a directory.
///
/// Writes land via temp file + rename, so a concurrent reader (in this
/// process or another) sees either the old record or the new one.
#[derive(Debug, Clone)]
pub struct FileSlots {
    dir: PathBuf,
    label: &'static str,
}

impl FileSlots {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), label: "file" }
    }

    /// A directory populated by another flow (e.g. an email-verification
    /// redirect handler) whose values override local ones.
    pub fn handoff(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), label: "handoff" }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SLOT_FILE)
    }
}

impl CredentialSource for FileSlots {
    fn name(&self) -> &'static str {
        self.label
    }

    fn load(&self) -> SlotRecord {
        let path = self.path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SlotRecord::default(),
            Err(e) => {
                warn!(path = %path.display(), "failed to read credential slots: {e}");
                return SlotRecord::default();
            }
        };
        if contents.trim().is_empty() {
            return SlotRecord::default();
        }
        match serde_json::from_str::<SlotRecord>(&contents) {
            Ok(mut record) => {
                // Blank values read as absent.
                record.access_token = record.access_token.filter(|v| !v.trim().is_empty());
                record.refresh_token = record.refresh_token.filter(|v| !v.trim().is_empty());
                record
            }
            Err(e) => {
                warn!(path = %path.display(), "ignoring unreadable credential slots: {e}");
                SlotRecord::default()
            }
        }
    }

    fn discard(&self) {
        if let Err(e) = self.save(&SlotRecord::default()) {
            warn!(source = self.label, err = %e, "failed to discard credentials");
        }
    }
}

impl CredentialSlots for FileSlots {
    fn save(&self, record: &SlotRecord) -> anyhow::Result<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let path = self.path();
        if record.is_empty() {
            return match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(record)?;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(".{SLOT_FILE}.{}.{seq}.tmp", std::process::id()));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(dir = %self.dir.display(), "credential slots written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySlots
// ---------------------------------------------------------------------------

/// In-process slots for ephemeral sessions and tests.
#[derive(Debug, Default)]
pub struct MemorySlots {
    record: Mutex<SlotRecord>,
}

impl MemorySlots {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialSource for MemorySlots {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self) -> SlotRecord {
        self.record.lock().clone()
    }

    fn discard(&self) {
        *self.record.lock() = SlotRecord::default();
    }
}

impl CredentialSlots for MemorySlots {
    fn save(&self, record: &SlotRecord) -> anyhow::Result<()> {
        *self.record.lock() = record.clone();
        Ok(())
    }

    // Single-key edits stay atomic in memory.
    fn set(&self, key: CredentialKey, value: &str) -> anyhow::Result<()> {
        self.record.lock().set(key, value)
    }

    fn remove(&self, key: CredentialKey) -> anyhow::Result<()> {
        self.record.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EnvSource
// ---------------------------------------------------------------------------

/// Tokens injected through the process environment.
///
/// The environment cannot be rewritten for other readers, so discarding only
/// marks the values as superseded for the rest of this process.
#[derive(Debug)]
pub struct EnvSource {
    access_var: String,
    refresh_var: String,
    superseded: AtomicBool,
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new("KEEPER_ACCESS_TOKEN", "KEEPER_REFRESH_TOKEN")
    }
}

impl EnvSource {
    pub fn new(access_var: impl Into<String>, refresh_var: impl Into<String>) -> Self {
        Self {
            access_var: access_var.into(),
            refresh_var: refresh_var.into(),
            superseded: AtomicBool::new(false),
        }
    }
}

impl CredentialSource for EnvSource {
    fn name(&self) -> &'static str {
        "env"
    }

    fn load(&self) -> SlotRecord {
        if self.superseded.load(Ordering::Acquire) {
            return SlotRecord::default();
        }
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        SlotRecord {
            access_token: var(&self.access_var),
            refresh_token: var(&self.refresh_var),
            expires_at: None,
        }
    }

    fn discard(&self) {
        self.superseded.store(true, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "slots_tests.rs"]
mod tests;
