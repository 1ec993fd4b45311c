#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown display timezone: {0:?}")]
    UnknownTimezone(String),
    #[error("column separator must not be empty")]
    EmptyColumnSeparator,
    #[error("default limit must be positive")]
    ZeroDefaultLimit,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result of [`MutationScheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduled {
    /// The slot was empty; the handle is now pending and the table was
    /// queued for the next deferred tick.
    Deferred,
    /// A handle was already pending; the new one was dropped.
    Coalesced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub coalesced: u64,
    pub flushed: u64,
    pub cancelled: u64,
}

/// Per-table pending-recompute slots.
///
/// Each key holds at most one pending handle. A handle scheduled while the
/// slot is occupied is discarded, so the recompute behind a handle must read
/// the latest engine state rather than a snapshot. The ready queue stands in
/// for "run after the current synchronous work": callers drain it from their
/// own tick.
#[derive(Debug)]
pub struct MutationScheduler<K, H> {
    slots: HashMap<K, H>,
    ready: VecDeque<K>,
    stats: SchedulerStats,
}

impl<K, H> Default for MutationScheduler<K, H> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            ready: VecDeque::new(),
            stats: SchedulerStats::default(),
        }
    }
}

impl<K, H> MutationScheduler<K, H>
where
    K: Copy + Eq + Hash + fmt::Debug,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, table: K, handle: H) -> Scheduled {
        if self.slots.contains_key(&table) {
            self.stats.coalesced += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(?table, "recompute already pending; coalesced");
            return Scheduled::Coalesced;
        }

        self.slots.insert(table, handle);
        self.ready.push_back(table);
        self.stats.scheduled += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(?table, "recompute scheduled");
        Scheduled::Deferred
    }

    #[must_use]
    pub fn is_pending(&self, table: K) -> bool {
        self.slots.contains_key(&table)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.slots.len()
    }

    /// Tables waiting for the next deferred tick. Never exceeds
    /// [`Self::pending_len`].
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.ready.len()
    }

    /// Clears the slot and hands back its handle. The slot is empty by the
    /// time the caller runs the recompute, so a reschedule from inside it
    /// lands in a fresh slot.
    pub fn take(&mut self, table: K) -> Option<H> {
        let handle = self.slots.remove(&table)?;
        self.ready.retain(|queued| *queued != table);
        self.stats.flushed += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(?table, "recompute flushed");
        Some(handle)
    }

    /// Runs `recompute` for the pending handle, if any. A table with nothing
    /// pending is a no-op and returns `None`.
    pub fn flush<R>(&mut self, table: K, recompute: impl FnOnce(H) -> R) -> Option<R> {
        self.take(table).map(recompute)
    }

    /// Drops the pending handle without recomputing. Returns whether a
    /// handle was pending.
    pub fn cancel(&mut self, table: K) -> bool {
        let cancelled = self.slots.remove(&table).is_some();
        if cancelled {
            self.ready.retain(|queued| *queued != table);
            self.stats.cancelled += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(?table, "pending recompute cancelled");
        }
        cancelled
    }

    /// Takes every handle whose deferred tick has come due, in scheduling
    /// order. Tables flushed or cancelled since they were queued have
    /// already left the queue.
    pub fn drain_ready(&mut self) -> Vec<(K, H)> {
        let queued: Vec<K> = self.ready.drain(..).collect();
        queued
            .into_iter()
            .filter_map(|table| self.take(table).map(|handle| (table, handle)))
            .collect()
    }

    /// Forgets every pending handle, e.g. when the owning session shuts down.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.ready.clear();
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

const DEFAULT_TIMEZONE: &str = "UTC";
const DEFAULT_COLUMN_SEPARATOR: &str = "|";
pub const DEFAULT_LIMIT: u32 = u32::MAX;

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_owned()
}

fn default_column_separator() -> String {
    DEFAULT_COLUMN_SEPARATOR.to_owned()
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

/// Session-wide settings, loadable from JSON with a default for every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_timezone")]
    display_timezone: String,
    #[serde(default = "default_column_separator")]
    column_separator: String,
    #[serde(default = "default_limit")]
    default_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_timezone: default_timezone(),
            column_separator: default_column_separator(),
            default_limit: DEFAULT_LIMIT,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_display_timezone(mut self, name: &str) -> Result<Self, RuntimeError> {
        parse_timezone(name)?;
        self.display_timezone = name.to_owned();
        Ok(self)
    }

    pub fn with_column_separator(mut self, separator: &str) -> Result<Self, RuntimeError> {
        if separator.is_empty() {
            return Err(RuntimeError::EmptyColumnSeparator);
        }
        self.column_separator = separator.to_owned();
        Ok(self)
    }

    pub fn with_default_limit(mut self, limit: u32) -> Result<Self, RuntimeError> {
        if limit == 0 {
            return Err(RuntimeError::ZeroDefaultLimit);
        }
        self.default_limit = limit;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        parse_timezone(&self.display_timezone)?;
        if self.column_separator.is_empty() {
            return Err(RuntimeError::EmptyColumnSeparator);
        }
        if self.default_limit == 0 {
            return Err(RuntimeError::ZeroDefaultLimit);
        }
        Ok(())
    }

    /// The parsed display timezone. Falls back to UTC only if the stored
    /// name was never validated, which the constructors rule out.
    #[must_use]
    pub fn display_timezone(&self) -> Tz {
        parse_timezone(&self.display_timezone).unwrap_or(Tz::UTC)
    }

    #[must_use]
    pub fn display_timezone_name(&self) -> &str {
        &self.display_timezone
    }

    #[must_use]
    pub fn column_separator(&self) -> &str {
        &self.column_separator
    }

    #[must_use]
    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }
}

fn parse_timezone(name: &str) -> Result<Tz, RuntimeError> {
    Tz::from_str(name).map_err(|_| RuntimeError::UnknownTimezone(name.to_owned()))
}
