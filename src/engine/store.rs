use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::limits::MAX_RESERVATIONS;
use crate::model::*;
use crate::wal::Wal;

use super::StoreError;

/// Durable set of reservations. Mutations carry the caller's last observed
/// version and are compared against the stored one atomically with the write.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Every reservation whose `[start, end)` overlaps `span`.
    async fn find_conflicting(&self, span: Span) -> Result<Vec<Reservation>, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Insert when `id` is `None`, otherwise update if `version` is current.
    async fn save(&self, reservation: Reservation) -> Result<Reservation, StoreError>;

    /// Remove if `version` is current.
    async fn delete(&self, reservation: &Reservation) -> Result<(), StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

/// A change to the ledger, checked by the writer task against the state it
/// is about to apply to.
#[derive(Debug)]
pub(crate) enum Mutation {
    Insert {
        span: Span,
        owner: User,
    },
    Update {
        id: Ulid,
        expected: Version,
        span: Span,
        owner: User,
    },
    Delete {
        id: Ulid,
        expected: Version,
    },
}

type MutationReply = oneshot::Sender<Result<Option<Reservation>, StoreError>>;

pub(crate) enum WalCommand {
    Mutate {
        mutation: Mutation,
        response: MutationReply,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailNextSync {
        response: oneshot::Sender<()>,
    },
}

/// Turn a mutation into the event that records it, or refuse it.
fn plan(ledger: &Ledger, mutation: Mutation, max_reservations: usize) -> Result<Event, StoreError> {
    match mutation {
        Mutation::Insert { span, mut owner } => {
            if ledger.len() >= max_reservations {
                return Err(StoreError::Full);
            }
            if let Some(existing) = ledger.overlapping(&span).next() {
                return Err(StoreError::Conflict(existing.id));
            }
            owner.id.get_or_insert_with(Ulid::new);
            Ok(Event::ReservationCreated {
                id: Ulid::new(),
                version: 1,
                span,
                owner,
            })
        }
        Mutation::Update { id, expected, span, mut owner } => {
            let current = check_version(ledger, id, expected)?;
            if owner.id.is_none() {
                owner.id = current.owner.id;
            }
            Ok(Event::ReservationUpdated {
                id,
                version: expected + 1,
                span,
                owner,
            })
        }
        Mutation::Delete { id, expected } => {
            check_version(ledger, id, expected)?;
            Ok(Event::ReservationDeleted { id })
        }
    }
}

fn check_version(ledger: &Ledger, id: Ulid, expected: Version) -> Result<&Stay, StoreError> {
    match ledger.get(&id) {
        Some(stay) if stay.version == expected => Ok(stay),
        current => Err(StoreError::StaleVersion {
            id,
            expected,
            actual: current.map(|s| s.version),
        }),
    }
}

/// Apply an event to the ledger (no locking, caller holds the lock).
fn apply_event(ledger: &mut Ledger, event: &Event) {
    match event {
        Event::ReservationCreated { id, version, span, owner } => {
            ledger.insert(Stay {
                id: *id,
                version: *version,
                span: *span,
                owner: owner.clone(),
            });
        }
        Event::ReservationUpdated { id, version, span, owner } => {
            ledger.remove(*id);
            ledger.insert(Stay {
                id: *id,
                version: *version,
                span: *span,
                owner: owner.clone(),
            });
        }
        Event::ReservationDeleted { id } => {
            ledger.remove(*id);
        }
    }
}

/// One `ReservationCreated` per live stay, carrying its current version.
fn snapshot(ledger: &Ledger) -> Vec<Event> {
    ledger
        .stays
        .iter()
        .map(|s| Event::ReservationCreated {
            id: s.id,
            version: s.version,
            span: s.span,
            owner: s.owner.clone(),
        })
        .collect()
}

/// A compaction whose side file is being written off the writer task.
/// Events committed meanwhile are collected in `tail` and appended to the
/// side file before it replaces the log.
struct Compaction {
    task: JoinHandle<io::Result<()>>,
    tail: Vec<Event>,
    response: oneshot::Sender<io::Result<()>>,
}

enum Wake {
    Command(WalCommand),
    Compacted(io::Result<()>),
    Closed,
}

/// Owns the WAL and is the only task that mutates the ledger. A mutation
/// that reached the channel is committed or refused whether or not its
/// caller is still waiting for the reply.
struct Writer {
    wal: Wal,
    ledger: Arc<RwLock<Ledger>>,
    compaction: Option<Compaction>,
    /// Set when a failed batch could not be cut back out of the log.
    poisoned: bool,
}

/// 1. Block until a command arrives or the running compaction finishes.
/// 2. On a mutation, drain all immediately available mutations (the batch
///    window).
/// 3. Plan and apply the batch under the write lock, then one flush_sync.
/// 4. Respond to all senders, or undo the batch if the flush failed.
async fn wal_writer_loop(mut writer: Writer, mut rx: mpsc::Receiver<WalCommand>) {
    loop {
        let wake = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => Wake::Command(cmd),
                None => Wake::Closed,
            },
            written = compaction_done(&mut writer.compaction) => Wake::Compacted(written),
        };

        match wake {
            Wake::Command(WalCommand::Mutate { mutation, response }) => {
                let mut batch = vec![(mutation, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Mutate { mutation, response }) => batch.push((mutation, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, commit batch
                    }
                }

                writer.commit(batch).await;
                if let Some(other) = deferred {
                    writer.handle(other).await;
                }
            }
            Wake::Command(other) => writer.handle(other).await,
            Wake::Compacted(written) => writer.finish_compaction(written),
            Wake::Closed => {
                if writer.compaction.is_some() {
                    let written = compaction_done(&mut writer.compaction).await;
                    writer.finish_compaction(written);
                }
                break;
            }
        }
    }
}

/// Resolves when the side file is written. Never resolves when idle.
async fn compaction_done(compaction: &mut Option<Compaction>) -> io::Result<()> {
    match compaction {
        Some(c) => match (&mut c.task).await {
            Ok(written) => written,
            Err(e) => Err(io::Error::other(e)),
        },
        None => std::future::pending().await,
    }
}

fn append_batch(wal: &mut Wal, events: &[Event]) -> io::Result<()> {
    for event in events {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn install_compaction(wal: &mut Wal, tail: &[Event]) -> io::Result<()> {
    Wal::append_compact_tail(wal.path(), tail)?;
    wal.swap_compact_file()
}

impl Writer {
    async fn commit(&mut self, batch: Vec<(Mutation, MutationReply)>) {
        if self.poisoned {
            for (_, response) in batch {
                let _ = response.send(Err(StoreError::Unavailable("WAL is in an unknown state".into())));
            }
            return;
        }

        let mut ledger = self.ledger.write().await;
        let start_len = match self.wal.committed_len() {
            Ok(len) => len,
            Err(e) => {
                for (_, response) in batch {
                    let _ = response.send(Err(StoreError::Unavailable(format!("WAL error: {e}"))));
                }
                return;
            }
        };

        let mut staged = Vec::with_capacity(batch.len());
        let mut undo = Vec::with_capacity(batch.len());
        let mut outcomes = Vec::with_capacity(batch.len());
        for (mutation, response) in batch {
            match plan(&ledger, mutation, MAX_RESERVATIONS) {
                Ok(event) => {
                    let id = event.reservation_id();
                    undo.push((id, ledger.get(&id).cloned()));
                    apply_event(&mut ledger, &event);
                    staged.push(event);
                    outcomes.push((response, Ok(id)));
                }
                Err(e) => outcomes.push((response, Err(e))),
            }
        }

        let result = if staged.is_empty() {
            Ok(())
        } else {
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(staged.len() as f64);
            let flush_start = std::time::Instant::now();
            let result = append_batch(&mut self.wal, &staged);
            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                .record(flush_start.elapsed().as_secs_f64());
            result
        };

        match result {
            Ok(()) => {
                if let Some(c) = self.compaction.as_mut() {
                    c.tail.extend(staged);
                }
                for (response, outcome) in outcomes {
                    let reply = outcome.map(|id| ledger.get(&id).map(Stay::to_reservation));
                    let _ = response.send(reply);
                }
            }
            Err(e) => {
                tracing::error!("WAL commit of {} events failed: {e}", staged.len());
                for (id, previous) in undo.into_iter().rev() {
                    ledger.remove(id);
                    if let Some(stay) = previous {
                        ledger.insert(stay);
                    }
                }
                if let Err(te) = self.wal.truncate_to(start_len) {
                    tracing::error!("could not cut failed batch from WAL, refusing writes: {te}");
                    self.poisoned = true;
                }
                for (response, outcome) in outcomes {
                    let reply: Result<Option<Reservation>, StoreError> =
                        outcome.and_then(|_| Err(StoreError::Unavailable(format!("WAL error: {e}"))));
                    let _ = response.send(reply);
                }
            }
        }
    }

    async fn handle(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Mutate { mutation, response } => self.commit(vec![(mutation, response)]).await,
            WalCommand::Compact { response } => self.start_compaction(response).await,
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            #[cfg(test)]
            WalCommand::FailNextSync { response } => {
                self.wal.fail_next_sync();
                let _ = response.send(());
            }
        }
    }

    /// Snapshot under the read lock, then write the side file on the
    /// blocking pool while commits continue.
    async fn start_compaction(&mut self, response: oneshot::Sender<io::Result<()>>) {
        if self.compaction.is_some() {
            let _ = response.send(Err(io::Error::other("compaction already running")));
            return;
        }
        let events = snapshot(&*self.ledger.read().await);
        let path = self.wal.path().to_path_buf();
        let task = tokio::task::spawn_blocking(move || Wal::write_compact_file(&path, &events));
        self.compaction = Some(Compaction {
            task,
            tail: Vec::new(),
            response,
        });
    }

    fn finish_compaction(&mut self, written: io::Result<()>) {
        let Some(Compaction { tail, response, .. }) = self.compaction.take() else {
            return;
        };
        let result = written.and_then(|()| install_compaction(&mut self.wal, &tail));
        if result.is_ok() {
            // The rewritten log holds exactly the ledger.
            self.poisoned = false;
        }
        let _ = response.send(result);
    }
}

/// In-memory ledger made durable by a write-ahead log.
///
/// Reads take the ledger read lock. Writes are sent to the WAL writer task,
/// which checks versions and overlap, applies, appends and fsyncs as one
/// step under the write lock.
pub struct WalStore {
    ledger: Arc<RwLock<Ledger>>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay `wal_path` into a fresh ledger and start the WAL writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let mut ledger = Ledger::new();
        for event in &events {
            apply_event(&mut ledger, event);
        }
        tracing::debug!(
            "replayed {} events into {} reservations from {}",
            events.len(),
            ledger.len(),
            wal_path.display()
        );

        let ledger = Arc::new(RwLock::new(ledger));
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let writer = Writer {
            wal,
            ledger: ledger.clone(),
            compaction: None,
            poisoned: false,
        };
        tokio::spawn(wal_writer_loop(writer, wal_rx));

        Ok(Self { ledger, wal_tx })
    }

    pub async fn len(&self) -> usize {
        self.ledger.read().await.len()
    }

    /// Hand a mutation to the writer task. Once sent it is committed or
    /// refused even if this future is dropped.
    async fn submit(&self, mutation: Mutation) -> Result<Option<Reservation>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Mutate { mutation, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
    }

    async fn insert(&self, reservation: Reservation) -> Result<Reservation, StoreError> {
        let span = reservation
            .span()
            .ok_or(StoreError::Rejected("start date must be before end date"))?;
        let mutation = Mutation::Insert {
            span,
            owner: reservation.owner,
        };
        self.submit(mutation).await?.ok_or_else(missing)
    }

    async fn update(&self, id: Ulid, reservation: Reservation) -> Result<Reservation, StoreError> {
        let expected = reservation
            .version
            .ok_or(StoreError::Rejected("version is required to update a reservation"))?;
        let span = reservation
            .span()
            .ok_or(StoreError::Rejected("start date must be before end date"))?;
        let mutation = Mutation::Update {
            id,
            expected,
            span,
            owner: reservation.owner,
        };
        self.submit(mutation).await?.ok_or_else(missing)
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// ledger. Writes keep flowing while the side file is written.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Make the next WAL flush fail after its bytes reach the file.
    #[cfg(test)]
    pub(crate) async fn fail_next_sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::FailNextSync { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn missing() -> StoreError {
    StoreError::Unavailable("reservation missing after write".into())
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn find_conflicting(&self, span: Span) -> Result<Vec<Reservation>, StoreError> {
        let guard = self.ledger.read().await;
        Ok(guard.overlapping(&span).map(Stay::to_reservation).collect())
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let guard = self.ledger.read().await;
        Ok(guard.get(&id).map(Stay::to_reservation))
    }

    async fn save(&self, reservation: Reservation) -> Result<Reservation, StoreError> {
        match reservation.id {
            None => self.insert(reservation).await,
            Some(id) => self.update(id, reservation).await,
        }
    }

    async fn delete(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let id = reservation
            .id
            .ok_or(StoreError::Rejected("id is required to delete a reservation"))?;
        let expected = reservation
            .version
            .ok_or(StoreError::Rejected("version is required to delete a reservation"))?;
        self.submit(Mutation::Delete { id, expected }).await?;
        Ok(())
    }
}
