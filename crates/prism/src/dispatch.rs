//! Update delta dispatch: per-view callbacks fired after each recompute.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use pr_engine::{Engine, EngineError, PortId, ViewId};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback#{}", self.0)
    }
}

/// What an update callback receives besides the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    None,
    /// The rows changed on the port, as an Arrow IPC stream.
    Row,
}

impl FromStr for UpdateMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "none" => Ok(Self::None),
            "row" => Ok(Self::Row),
            other => Err(ConfigError::InvalidUpdateMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEvent<'a> {
    pub port_id: PortId,
    pub delta: Option<&'a Bytes>,
}

pub type UpdateFn = Box<dyn FnMut(&UpdateEvent<'_>)>;

struct UpdateCallback {
    view: ViewId,
    id: CallbackId,
    mode: UpdateMode,
    callback: UpdateFn,
}

impl fmt::Debug for UpdateCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCallback")
            .field("view", &self.view)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Deltas computed during one dispatch cycle, keyed by port and then by
/// view and mode. Dropped when the cycle ends.
#[derive(Debug, Default)]
pub struct DeltaCache {
    entries: HashMap<PortId, HashMap<(ViewId, UpdateMode), Bytes>>,
}

impl DeltaCache {
    /// The row delta of `view` on `port`, asking the engine only on the first
    /// request of the cycle.
    pub fn row_delta<E: Engine>(
        &mut self,
        engine: &mut E,
        view: ViewId,
        port: PortId,
    ) -> Result<Bytes, EngineError> {
        let slot = self.entries.entry(port).or_default();
        if let Some(delta) = slot.get(&(view, UpdateMode::Row)) {
            return Ok(delta.clone());
        }
        let delta = engine.get_row_delta(view, port)?;
        slot.insert((view, UpdateMode::Row), delta.clone());
        Ok(delta)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every update callback of the session in registration order.
#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    callbacks: Vec<UpdateCallback>,
}

impl Dispatcher {
    pub(crate) fn register(&mut self, view: ViewId, id: CallbackId, mode: UpdateMode, callback: UpdateFn) {
        self.callbacks.push(UpdateCallback {
            view,
            id,
            mode,
            callback,
        });
    }

    /// Removes exactly one registration. Returns false when `id` is not
    /// registered on `view`.
    pub(crate) fn unregister(&mut self, view: ViewId, id: CallbackId) -> bool {
        let Some(position) = self
            .callbacks
            .iter()
            .position(|entry| entry.view == view && entry.id == id)
        else {
            return false;
        };
        self.callbacks.remove(position);
        true
    }

    pub(crate) fn len(&self, view: ViewId) -> usize {
        self.callbacks.iter().filter(|entry| entry.view == view).count()
    }

    pub(crate) fn wants_rows(&self, view: ViewId) -> bool {
        self.callbacks
            .iter()
            .any(|entry| entry.view == view && entry.mode == UpdateMode::Row)
    }

    pub(crate) fn drop_view(&mut self, view: ViewId) {
        self.callbacks.retain(|entry| entry.view != view);
    }

    /// Fires the callbacks of `views` for one completed recompute on `port`,
    /// in registration order across all of them.
    pub(crate) fn dispatch<E: Engine>(
        &mut self,
        engine: &mut E,
        views: &[ViewId],
        port: PortId,
        cache: &mut DeltaCache,
    ) {
        for entry in self
            .callbacks
            .iter_mut()
            .filter(|entry| views.contains(&entry.view))
        {
            let view = entry.view;
            let delta = match entry.mode {
                UpdateMode::None => None,
                UpdateMode::Row => match cache.row_delta(engine, view, port) {
                    Ok(delta) => Some(delta),
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%view, %port, error = %_err, "row delta unavailable");
                        None
                    }
                },
            };
            (entry.callback)(&UpdateEvent {
                port_id: port,
                delta: delta.as_ref(),
            });
        }
    }
}
