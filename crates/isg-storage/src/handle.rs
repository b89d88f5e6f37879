use crate::{IdentityStore, StorageError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// The store behind an async lock, shared across concurrent resolutions.
pub type SharedStore = Arc<Mutex<IdentityStore>>;

/// How long a failed initialization is replayed before the open is retried.
const FAILURE_CACHE: Duration = Duration::from_secs(30);

enum InitState {
    Uninit,
    Ready(SharedStore),
    Failed { reason: String, at: Instant },
}

/// Lazily-initialized handle to the identity store.
///
/// Concurrent first callers serialize on the state lock, so the open and
/// schema migration run at most once. A failed initialization is cached for
/// [`FAILURE_CACHE`] and replayed to later callers as
/// [`StorageError::Unavailable`] without touching the store again, so an
/// unreachable database is not hammered on every request; once the window
/// passes the next caller retries the open.
pub struct StoreHandle {
    path: PathBuf,
    state: Mutex<InitState>,
}

impl StoreHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(InitState::Uninit),
        }
    }

    /// Wrap an already-open store, for callers that manage their own
    /// lifecycle (tests, in-memory stores).
    pub fn from_store(store: IdentityStore) -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(InitState::Ready(Arc::new(Mutex::new(store)))),
        }
    }

    pub async fn acquire(&self) -> Result<SharedStore, StorageError> {
        let mut state = self.state.lock().await;
        match &*state {
            InitState::Ready(store) => return Ok(Arc::clone(store)),
            InitState::Failed { reason, at } if at.elapsed() < FAILURE_CACHE => {
                return Err(StorageError::Unavailable(reason.clone()));
            }
            InitState::Uninit | InitState::Failed { .. } => {}
        }
        match IdentityStore::open(&self.path) {
            Ok(store) => {
                let store = Arc::new(Mutex::new(store));
                *state = InitState::Ready(Arc::clone(&store));
                Ok(store)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(path = %self.path.display(), error = %reason, "identity store initialization failed");
                *state = InitState::Failed {
                    reason: reason.clone(),
                    at: Instant::now(),
                };
                Err(StorageError::Unavailable(reason))
            }
        }
    }
}
