//! Tracked requests and their listeners.
//!
//! A [`RequestHandle`] is returned by a tracked scheduling call. It records
//! the status of each requested tile and lets the caller await completion.
//! Listeners attached to the request are called once per tile when the tile
//! reaches a terminal status.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::error::ComputeError;
use crate::raster::{OwnerId, PixelBuffer};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Status of one tile inside a request.
///
/// Transitions only move forward: `Pending -> Processing -> terminal`, with
/// `Cancelled` also reachable straight from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Pending,
    Processing,
    Computed,
    Failed,
    Cancelled,
}

impl TileStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TileStatus::Computed | TileStatus::Failed | TileStatus::Cancelled
        )
    }
}

/// Tile notification passed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEvent {
    /// Requests whose tile reached a terminal status in this notification
    pub requests: Vec<RequestId>,
    pub owner: OwnerId,
    pub x: u32,
    pub y: u32,
}

/// Callbacks for tracked tiles.
///
/// Called from worker tasks, never while scheduler locks are held. A listener
/// attached to several merged requests is called once per tile.
pub trait TileListener: Send + Sync {
    fn tile_computed(&self, _event: &TileEvent, _tile: &Arc<PixelBuffer>) {}

    fn tile_failed(&self, _event: &TileEvent, _error: &ComputeError) {}

    fn tile_cancelled(&self, _event: &TileEvent) {}
}

struct RequestState {
    id: RequestId,
    owner: OwnerId,
    coords: Vec<(u32, u32)>,
    listeners: Vec<Arc<dyn TileListener>>,
    statuses: Mutex<HashMap<(u32, u32), TileStatus>>,
    /// Tiles not yet settled; `wait` resolves at zero
    remaining: watch::Sender<usize>,
}

/// Handle to a tracked request. Clones refer to the same request.
#[derive(Clone)]
pub struct RequestHandle {
    state: Arc<RequestState>,
}

impl RequestHandle {
    /// Duplicate coordinates are collapsed, keeping first-occurrence order.
    pub(crate) fn new(
        owner: OwnerId,
        coords: &[(u32, u32)],
        listeners: Vec<Arc<dyn TileListener>>,
    ) -> Self {
        let mut seen = HashSet::with_capacity(coords.len());
        let coords: Vec<(u32, u32)> = coords
            .iter()
            .copied()
            .filter(|coord| seen.insert(*coord))
            .collect();

        let statuses = coords
            .iter()
            .map(|&coord| (coord, TileStatus::Pending))
            .collect();
        let (remaining, _) = watch::channel(coords.len());

        Self {
            state: Arc::new(RequestState {
                id: RequestId::next(),
                owner,
                coords,
                listeners,
                statuses: Mutex::new(statuses),
                remaining,
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.state.id
    }

    pub fn owner(&self) -> OwnerId {
        self.state.owner
    }

    /// Requested coordinates, without duplicates.
    pub fn coords(&self) -> &[(u32, u32)] {
        &self.state.coords
    }

    /// Status of one tile, or `None` if the request does not cover it.
    pub fn status(&self, x: u32, y: u32) -> Option<TileStatus> {
        self.lock_statuses().get(&(x, y)).copied()
    }

    /// Status of every tile, in request order.
    pub fn statuses(&self) -> Vec<((u32, u32), TileStatus)> {
        let statuses = self.lock_statuses();
        self.state
            .coords
            .iter()
            .filter_map(|coord| statuses.get(coord).map(|status| (*coord, *status)))
            .collect()
    }

    /// Number of tiles whose outcome has not been delivered yet.
    pub fn remaining(&self) -> usize {
        *self.state.remaining.borrow()
    }

    /// Whether every tile is terminal and its listeners have been called.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until every tile is terminal and its listeners have been called.
    pub async fn wait(&self) {
        let mut rx = self.state.remaining.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|remaining| *remaining == 0).await;
    }

    pub(crate) fn covers(&self, x: u32, y: u32) -> bool {
        self.lock_statuses().contains_key(&(x, y))
    }

    pub(crate) fn mark_processing(&self, x: u32, y: u32) {
        let mut statuses = self.lock_statuses();
        if let Some(status) = statuses.get_mut(&(x, y)) {
            if *status == TileStatus::Pending {
                *status = TileStatus::Processing;
            }
        }
    }

    /// Move a tile to a terminal status.
    ///
    /// Returns `false` if the tile is unknown or already terminal.
    pub(crate) fn finish(&self, x: u32, y: u32, terminal: TileStatus) -> bool {
        debug_assert!(terminal.is_terminal());

        let mut statuses = self.lock_statuses();
        match statuses.get_mut(&(x, y)) {
            Some(status) if !status.is_terminal() => {
                *status = terminal;
                true
            }
            _ => false,
        }
    }

    /// Record that `count` finished tiles have been delivered.
    pub(crate) fn settle(&self, count: usize) {
        self.state
            .remaining
            .send_modify(|remaining| *remaining = remaining.saturating_sub(count));
    }

    /// Tell this request's listeners that a tile was cancelled, then settle it.
    pub(crate) fn announce_cancelled(&self, x: u32, y: u32) {
        let event = TileEvent {
            requests: vec![self.id()],
            owner: self.owner(),
            x,
            y,
        };
        for listener in &self.state.listeners {
            listener.tile_cancelled(&event);
        }
        self.settle(1);
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, HashMap<(u32, u32), TileStatus>> {
        self.state
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.state.id)
            .field("owner", &self.state.owner)
            .field("tiles", &self.state.coords.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Listeners of all `requests`, each listener object appearing once.
pub(crate) fn listener_union(requests: &[RequestHandle]) -> Vec<Arc<dyn TileListener>> {
    let mut seen = HashSet::new();
    let mut union = Vec::new();

    for request in requests {
        for listener in &request.state.listeners {
            if seen.insert(Arc::as_ptr(listener) as *const () as usize) {
                union.push(Arc::clone(listener));
            }
        }
    }

    union
}
