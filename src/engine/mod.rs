mod error;
mod mutations;
mod queries;
pub mod scheduler;
mod store;
mod validate;

pub use error::EngineError;
pub use scheduler::{
    find_conflict, is_slot_available, validate_defense, validate_jury, DefenseLookup,
    FacultyLookup, Intent, JuryLookup, ThesisLookup,
};
pub use store::{DefenseRef, SharedRoomState, Store};
pub(crate) use validate::now_ms;

use std::io;
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::model::*;
use crate::wal::{Wal, WalHandle};

/// One tenant's registries, durable through its WAL.
pub struct Engine {
    pub(super) store: Store,
    wal: WalHandle,
    pub calendar: Calendar,
    /// Held across check + WAL append + apply by every mutation.
    pub(super) write_lock: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf, calendar: Calendar) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            store: Store::new(),
            wal,
            calendar,
            write_lock: Mutex::new(()),
        };

        // Nobody else holds these Arcs yet, so try_write never contends. Blocking
        // lock calls are off limits here: tenants are created from async context.
        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events from {} ({} defenses in {} rooms)",
                events.len(),
                wal_path.display(),
                engine.store.defense_count(),
                engine.store.rooms.len()
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::DefenseSaved(d) => {
                let target = self.store.room(&d.room);
                let previous = self
                    .store
                    .defense_ref(&d.id)
                    .filter(|r| r.room != d.room)
                    .map(|r| self.store.room(&r.room));
                let mut guard = target.try_write().map_err(replay_contended)?;
                match previous {
                    Some(src) => {
                        let mut src_guard = src.try_write().map_err(replay_contended)?;
                        self.store.place_defense(&mut guard, Some(&mut src_guard), d.clone());
                        self.store.drop_if_empty(&src_guard);
                    }
                    None => self.store.place_defense(&mut guard, None, d.clone()),
                }
            }
            Event::DefenseDeleted { id, room } => {
                if let Some(rs) = self.store.existing_room(room) {
                    let mut guard = rs.try_write().map_err(replay_contended)?;
                    self.store.remove_defense(&mut guard, id);
                    self.store.drop_if_empty(&guard);
                }
            }
            other => self.store.apply_registry_event(other),
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append a registry event, then apply it.
    pub(super) async fn commit(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply_registry_event(&event);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn get_room(&self, name: &str) -> Option<SharedRoomState> {
        self.store.existing_room(name)
    }
}

fn replay_contended(_: tokio::sync::TryLockError) -> io::Error {
    io::Error::other("replay: room lock unexpectedly held")
}
