use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Sink for streamed deploy output (pull/push progress, container logs).
pub trait OutputWriter {
    fn write(&self, chunk: &str);

    fn line(&self, message: &str) {
        self.write(&format!("{message}\n"));
    }
}

pub struct Discard;

impl OutputWriter for Discard {
    fn write(&self, _chunk: &str) {}
}

#[derive(Debug, Default)]
pub struct Buffer(Mutex<String>);

impl Buffer {
    pub fn contents(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl OutputWriter for Buffer {
    fn write(&self, chunk: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(chunk);
    }
}

/// Correlation handle of one deploy: cancellation flag plus log transcript.
#[derive(Debug)]
pub struct DeployEvent {
    pub id: Uuid,
    pub app: String,
    cancel_requested: AtomicBool,
    cancel_acked: AtomicBool,
    transcript: Buffer,
}

impl DeployEvent {
    pub fn new(app: &str) -> Self {
        Self::with_id(Uuid::new_v4(), app)
    }

    pub fn with_id(id: Uuid, app: &str) -> Self {
        Self {
            id,
            app: app.to_string(),
            cancel_requested: AtomicBool::new(false),
            cancel_acked: AtomicBool::new(false),
            transcript: Buffer::default(),
        }
    }

    /// Requests cancellation. Returns false once the deploy already acknowledged one.
    pub fn cancel(&self) -> bool {
        if self.cancel_acked.load(Ordering::SeqCst) {
            return false;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn ack_cancel(&self) -> bool {
        if self.cancel_requested.load(Ordering::SeqCst) {
            self.cancel_acked.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn transcript(&self) -> String {
        self.transcript.contents()
    }
}

impl OutputWriter for DeployEvent {
    fn write(&self, chunk: &str) {
        self.transcript.write(chunk);
    }
}

/// In-flight deploys addressable by id.
#[derive(Default)]
pub struct EventRegistry {
    events: RwLock<HashMap<Uuid, Arc<DeployEvent>>>,
}

impl EventRegistry {
    /// Registers a new event, under `id` when the caller picked one so it can
    /// cancel the deploy while it runs.
    pub fn start(&self, app: &str, id: Option<Uuid>) -> Result<Arc<DeployEvent>> {
        let event = Arc::new(match id {
            Some(id) => DeployEvent::with_id(id, app),
            None => DeployEvent::new(app),
        });
        match self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.id)
        {
            Entry::Occupied(_) => Err(Error::EventInProgress(event.id)),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(event)
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<DeployEvent>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn finish(&self, id: &Uuid) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}
