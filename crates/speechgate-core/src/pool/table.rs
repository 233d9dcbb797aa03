//! Instance table: the single source of truth for loaded models.
//!
//! Every mutation here is synchronous and runs under the pool's one mutex.
//! Nothing in this module awaits.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::BackendModel;
use crate::error::{Error, Result};
use crate::model::{CapabilityKind, ModelDescriptor, Ttl};

/// Lifecycle state of a model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Loading,
    Ready,
    Draining,
    Unloaded,
}

/// Progress of a slot as seen by callers waiting on it
#[derive(Debug, Clone)]
pub(crate) enum SlotSignal {
    Pending,
    Ready,
    Failed(Arc<str>),
    Removed,
}

/// A loaded (or loading) model owned by the pool
pub(crate) struct ModelInstance {
    pub(crate) descriptor: Arc<ModelDescriptor>,
    pub(crate) generation: u64,
    pub(crate) state: InstanceState,
    /// Live handles, plus reservations held by callers waiting on a load
    pub(crate) ref_count: usize,
    pub(crate) loaded_at: Option<Instant>,
    pub(crate) last_used: Instant,
    model: Option<BackendModel>,
    signal: watch::Sender<SlotSignal>,
}

impl ModelInstance {
    fn loading(descriptor: Arc<ModelDescriptor>, generation: u64, now: Instant) -> Self {
        let (signal, _) = watch::channel(SlotSignal::Pending);
        Self {
            descriptor,
            generation,
            state: InstanceState::Loading,
            ref_count: 0,
            loaded_at: None,
            last_used: now,
            model: None,
            signal,
        }
    }

    fn is_idle(&self) -> bool {
        self.state == InstanceState::Ready && self.ref_count == 0
    }

    /// Ready -> Draining. The model moves into the returned ticket.
    ///
    /// The signal goes back to `Pending` so callers arriving now block until
    /// the slot is removed.
    fn begin_drain(&mut self) -> Option<DrainTicket> {
        let model = self.model.take()?;
        self.state = InstanceState::Draining;
        self.signal.send_replace(SlotSignal::Pending);
        Some(DrainTicket {
            descriptor: self.descriptor.clone(),
            generation: self.generation,
            model,
        })
    }
}

/// An instance that left the Ready state and must be unloaded
#[derive(Debug)]
pub(crate) struct DrainTicket {
    pub(crate) descriptor: Arc<ModelDescriptor>,
    pub(crate) generation: u64,
    pub(crate) model: BackendModel,
}

/// Outcome of trying to take a reference to a model
pub(crate) enum AcquireStep {
    /// Instance was Ready; a reference has been counted
    Ready { generation: u64, model: BackendModel },
    /// A new Loading slot was created with one reservation for the caller,
    /// who must start the load
    Load {
        generation: u64,
        signal: watch::Receiver<SlotSignal>,
    },
    /// Joined an in-flight load (reserved) or waiting out a drain
    Wait {
        generation: u64,
        signal: watch::Receiver<SlotSignal>,
        reserved: bool,
    },
}

/// Read-only view of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub kind: CapabilityKind,
    pub state: InstanceState,
    pub ref_count: usize,
    pub generation: u64,
    /// Seconds since the load completed
    pub loaded_secs: Option<u64>,
    /// Seconds since the last reference was released; zero while referenced
    pub idle_secs: u64,
    #[serde(serialize_with = "serialize_ttl")]
    pub ttl: Ttl,
}

fn serialize_ttl<S: serde::Serializer>(ttl: &Ttl, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&ttl.to_string())
}

#[derive(Default)]
pub(crate) struct InstanceTable {
    slots: HashMap<String, ModelInstance>,
    next_generation: u64,
}

impl InstanceTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_acquire(
        &mut self,
        descriptor: &Arc<ModelDescriptor>,
        now: Instant,
    ) -> AcquireStep {
        if let Some(slot) = self.slots.get_mut(&descriptor.id) {
            return match (slot.state, slot.model.clone()) {
                (InstanceState::Ready, Some(model)) => {
                    slot.ref_count += 1;
                    debug!(
                        "Acquired {} (gen {}, refs {})",
                        descriptor.id, slot.generation, slot.ref_count
                    );
                    AcquireStep::Ready {
                        generation: slot.generation,
                        model,
                    }
                }
                (InstanceState::Loading, _) => {
                    slot.ref_count += 1;
                    AcquireStep::Wait {
                        generation: slot.generation,
                        signal: slot.signal.subscribe(),
                        reserved: true,
                    }
                }
                _ => AcquireStep::Wait {
                    generation: slot.generation,
                    signal: slot.signal.subscribe(),
                    reserved: false,
                },
            };
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let mut slot = ModelInstance::loading(descriptor.clone(), generation, now);
        slot.ref_count = 1;
        let signal = slot.signal.subscribe();
        self.slots.insert(descriptor.id.clone(), slot);
        debug!("Created loading slot for {} (gen {})", descriptor.id, generation);

        AcquireStep::Load { generation, signal }
    }

    /// Complete a load started by `begin_acquire`.
    ///
    /// On success outstanding reservations become live references. On failure
    /// the slot is removed and every waiter sees the same reason.
    pub(crate) fn finish_load(
        &mut self,
        id: &str,
        generation: u64,
        result: std::result::Result<BackendModel, String>,
        now: Instant,
    ) -> Option<DrainTicket> {
        let slot = match self.slots.get_mut(id) {
            Some(slot) if slot.generation == generation && slot.state == InstanceState::Loading => {
                slot
            }
            _ => return None,
        };

        match result {
            Ok(model) => {
                slot.state = InstanceState::Ready;
                slot.model = Some(model);
                slot.loaded_at = Some(now);
                slot.last_used = now;
                slot.signal.send_replace(SlotSignal::Ready);

                // Every waiter gave up before the load finished
                if slot.ref_count == 0 && slot.descriptor.ttl == Ttl::Immediate {
                    return slot.begin_drain();
                }
                None
            }
            Err(reason) => {
                if let Some(mut slot) = self.slots.remove(id) {
                    slot.state = InstanceState::Unloaded;
                    slot.signal.send_replace(SlotSignal::Failed(reason.into()));
                }
                None
            }
        }
    }

    /// Model for a Ready instance of the given generation
    pub(crate) fn model_of(&self, id: &str, generation: u64) -> Option<BackendModel> {
        self.slots
            .get(id)
            .filter(|slot| slot.generation == generation && slot.state == InstanceState::Ready)
            .and_then(|slot| slot.model.clone())
    }

    /// Drop one reference.
    ///
    /// Fails with `ReleaseUnderflow` when the instance has no outstanding
    /// references. Returns a drain ticket when an `Immediate` TTL instance
    /// becomes idle.
    pub(crate) fn release(
        &mut self,
        id: &str,
        generation: u64,
        now: Instant,
    ) -> Result<Option<DrainTicket>> {
        let slot = match self.slots.get_mut(id) {
            Some(slot) if slot.generation == generation => slot,
            _ => return Err(Error::ReleaseUnderflow(id.to_string())),
        };

        if slot.ref_count == 0 {
            return Err(Error::ReleaseUnderflow(id.to_string()));
        }

        slot.ref_count -= 1;
        debug!(
            "Released {} (gen {}, refs {})",
            id, generation, slot.ref_count
        );

        if slot.state != InstanceState::Ready {
            return Ok(None);
        }

        slot.last_used = now;
        if slot.ref_count == 0 && slot.descriptor.ttl == Ttl::Immediate {
            return Ok(slot.begin_drain());
        }
        Ok(None)
    }

    /// Move every idle instance whose TTL has elapsed into Draining
    pub(crate) fn collect_expired(&mut self, now: Instant) -> Vec<DrainTicket> {
        self.slots
            .values_mut()
            .filter(|slot| slot.is_idle())
            .filter(|slot| {
                slot.descriptor
                    .ttl
                    .is_expired(now.saturating_duration_since(slot.last_used))
            })
            .filter_map(|slot| slot.begin_drain())
            .collect()
    }

    /// Drain a specific idle instance on request
    pub(crate) fn drain_idle(&mut self, id: &str) -> Result<DrainTicket> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::ModelNotLoaded(id.to_string()))?;

        match slot.state {
            InstanceState::Ready if slot.ref_count == 0 => slot
                .begin_drain()
                .ok_or_else(|| Error::ModelNotLoaded(id.to_string())),
            InstanceState::Ready | InstanceState::Loading => Err(Error::ModelBusy(id.to_string())),
            InstanceState::Draining | InstanceState::Unloaded => {
                Err(Error::ModelNotLoaded(id.to_string()))
            }
        }
    }

    /// Drain every idle instance; returns the ids left behind because they
    /// are still referenced or loading
    pub(crate) fn drain_all_idle(&mut self) -> (Vec<DrainTicket>, Vec<String>) {
        let mut tickets = Vec::new();
        let mut busy = Vec::new();
        for (id, slot) in self.slots.iter_mut() {
            if slot.is_idle() {
                tickets.extend(slot.begin_drain());
            } else if slot.state != InstanceState::Draining {
                busy.push(id.clone());
            }
        }
        (tickets, busy)
    }

    /// Remove a drained slot and wake anyone waiting to reload it
    pub(crate) fn finish_drain(&mut self, id: &str, generation: u64) {
        let matches = self
            .slots
            .get(id)
            .map(|slot| slot.generation == generation && slot.state == InstanceState::Draining)
            .unwrap_or(false);

        if matches {
            if let Some(mut slot) = self.slots.remove(id) {
                slot.state = InstanceState::Unloaded;
                slot.signal.send_replace(SlotSignal::Removed);
            }
        }
    }

    pub(crate) fn snapshot(&self, now: Instant) -> Vec<InstanceSnapshot> {
        let mut view: Vec<_> = self.slots.values().map(|slot| describe(slot, now)).collect();
        view.sort_by(|a, b| a.id.cmp(&b.id));
        view
    }

    pub(crate) fn get(&self, id: &str, now: Instant) -> Option<InstanceSnapshot> {
        self.slots.get(id).map(|slot| describe(slot, now))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

fn describe(slot: &ModelInstance, now: Instant) -> InstanceSnapshot {
    let idle_secs = if slot.ref_count > 0 || slot.state != InstanceState::Ready {
        0
    } else {
        now.saturating_duration_since(slot.last_used).as_secs()
    };

    InstanceSnapshot {
        id: slot.descriptor.id.clone(),
        kind: slot.descriptor.kind,
        state: slot.state,
        ref_count: slot.ref_count,
        generation: slot.generation,
        loaded_secs: slot
            .loaded_at
            .map(|at| now.saturating_duration_since(at).as_secs()),
        idle_secs,
        ttl: slot.descriptor.ttl,
    }
}
