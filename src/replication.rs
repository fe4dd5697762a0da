//! Debounced snapshot persistence
//!
//! Under the snapshot strategy only the host writes the grid back to the
//! store, and only after edits have been quiet for the debounce window. A
//! burst of edits costs one write. Writes never overlap: an edit landing
//! while a write is in flight schedules exactly one follow-up write.

use crate::grid::Grid;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Work performed once a debounced burst settles
#[async_trait]
pub trait Flush: Send + Sync + 'static {
    async fn flush(&self);
}

struct Shared {
    flusher: Arc<dyn Flush>,
    pending: AtomicBool,
    notify: Notify,
    write: Mutex<()>,
}

impl Shared {
    async fn flush_pending(&self) {
        let _guard = self.write.lock().await;
        if self.pending.swap(false, Ordering::AcqRel) {
            self.flusher.flush().await;
        }
    }
}

/// Trailing-edge debouncer with a single-writer guarantee
pub struct Debouncer {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn new(flusher: Arc<dyn Flush>, quiet: Duration) -> Self {
        let shared = Arc::new(Shared {
            flusher,
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            write: Mutex::new(()),
        });

        let worker = shared.clone();
        let task = tokio::spawn(async move {
            loop {
                worker.notify.notified().await;
                // restart the window on every touch
                while timeout(quiet, worker.notify.notified()).await.is_ok() {}
                worker.flush_pending().await;
            }
        });

        Self { shared, task }
    }

    /// Record an edit and restart the quiet window.
    pub fn touch(&self) {
        self.shared.pending.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Whether an edit is waiting to be flushed.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Flush a pending edit right away, waiting out any write in flight.
    pub async fn flush_now(&self) {
        self.shared.flush_pending().await;
    }

    /// Flush what is pending and stop the timer.
    pub async fn shutdown(&self) {
        self.flush_now().await;
        self.task.abort();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Writes the current grid text into the game row
pub struct SnapshotWriter {
    store: Arc<dyn Store>,
    game_id: String,
    grid: Arc<RwLock<Grid>>,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn Store>, game_id: impl Into<String>, grid: Arc<RwLock<Grid>>) -> Self {
        Self {
            store,
            game_id: game_id.into(),
            grid,
        }
    }
}

#[async_trait]
impl Flush for SnapshotWriter {
    async fn flush(&self) {
        let text = self.grid.read().await.serialize();
        match self.store.save_puzzle(&self.game_id, &text).await {
            Ok(true) => debug!("Saved snapshot for game {}", self.game_id),
            Ok(false) => debug!("Game {} no longer accepts snapshots", self.game_id),
            // the next edit schedules another write
            Err(e) => warn!("Failed to save snapshot for game {}: {}", self.game_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::{Difficulty, NewGame};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[derive(Default)]
    struct Counter {
        started: AtomicUsize,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
        busy_for: Duration,
    }

    #[async_trait]
    impl Flush for Counter {
        async fn flush(&self) {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            sleep(self.busy_for).await;
            self.in_flight.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_flushes_once() {
        let counter = Arc::new(Counter::default());
        let debouncer = Debouncer::new(counter.clone(), Duration::from_millis(400));

        for _ in 0..5 {
            debouncer.touch();
            sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(counter.started.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_during_flight_schedule_one_follow_up() {
        let counter = Arc::new(Counter {
            busy_for: Duration::from_millis(300),
            ..Default::default()
        });
        let debouncer = Debouncer::new(counter.clone(), Duration::from_millis(400));

        debouncer.touch();
        sleep(Duration::from_millis(450)).await;
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);

        // first write still in flight
        debouncer.touch();
        debouncer.touch();
        sleep(Duration::from_millis(2000)).await;

        assert_eq!(counter.started.load(Ordering::SeqCst), 2);
        assert!(!counter.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_skips_when_idle() {
        let counter = Arc::new(Counter::default());
        let debouncer = Debouncer::new(counter.clone(), Duration::from_millis(400));

        debouncer.flush_now().await;
        assert_eq!(counter.started.load(Ordering::SeqCst), 0);

        debouncer.touch();
        debouncer.shutdown().await;
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_writer_saves_grid_text() {
        let store = Arc::new(MemoryStore::new());
        let puzzle = "-".repeat(81);
        let game = store
            .insert_game(NewGame {
                host_user_id: "host".to_string(),
                difficulty: Difficulty::Easy,
                puzzle: puzzle.clone(),
                solution: puzzle.clone(),
            })
            .await
            .unwrap();

        let mut grid = Grid::parse(&puzzle).unwrap();
        grid.set(0, 0, Some(5)).unwrap();
        let writer = SnapshotWriter::new(store.clone(), game.id.clone(), Arc::new(RwLock::new(grid)));
        writer.flush().await;

        let saved = store.get_game(&game.id).await.unwrap().unwrap();
        assert!(saved.puzzle.starts_with('5'));
        assert_eq!(saved.givens, puzzle);
    }
}
