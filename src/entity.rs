// Per-context cache of world entities seen in traffic.
//
// A context is one namespace of entities: a live connection or a replayed
// log. Contexts are shared through ContextHandles; when the last handle is
// dropped the context leaves the cache and its entities are torn down on the
// work queue, off the network thread that dropped it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::interception::{InterceptContext, PacketInterceptor};
use crate::packet::Packet;
use crate::work::{TaskHandle, WorkQueue};

/// Upper bound on waiting for a derived task during teardown.
const RELEASE_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextKey(Uuid);

impl ContextKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Mutable facts about an entity, refined as packets arrive.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityState {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub template_id: Option<i64>,
    pub location: Option<(i32, i32, i32)>,
}

#[derive(Default)]
struct Derived {
    artifact: Option<Bytes>,
    task: Option<TaskHandle>,
}

pub struct Entity {
    id: u32,
    context: ContextKey,
    state: RwLock<EntityState>,
    derived: Mutex<Derived>,
}

impl Entity {
    fn new(id: u32, context: ContextKey) -> Self {
        Self {
            id,
            context,
            state: RwLock::new(EntityState::default()),
            derived: Mutex::new(Derived::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn context(&self) -> ContextKey {
        self.context
    }

    pub fn state(&self) -> EntityState {
        self.state.read().clone()
    }

    pub fn update<F: FnOnce(&mut EntityState)>(&self, f: F) {
        f(&mut self.state.write());
    }

    /// Latest artifact produced by [`Entity::derive_with`], if any.
    pub fn derived(&self) -> Option<Bytes> {
        self.derived.lock().artifact.clone()
    }

    /// Computes a derived artifact from the current state on the work queue.
    /// A computation still pending or running for this entity is cancelled.
    pub fn derive_with<F>(self: &Arc<Self>, queue: &WorkQueue, job: F) -> TaskHandle
    where
        F: FnOnce(&EntityState, &CancellationToken) -> Option<Bytes> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let mut derived = self.derived.lock();
        if let Some(previous) = derived.task.take() {
            previous.cancel();
        }
        let handle = queue.submit(move |token| {
            let Some(entity) = weak.upgrade() else { return };
            let artifact = job(&entity.state(), token);
            if !token.is_cancelled() {
                entity.derived.lock().artifact = artifact;
            }
        });
        derived.task = Some(handle.clone());
        handle
    }

    /// Cancels derived work and drops cached artifacts.
    pub fn release_resources(&self) {
        let task = {
            let mut derived = self.derived.lock();
            derived.artifact = None;
            derived.task.take()
        };
        if let Some(task) = task {
            task.cancel();
            if !task.join(RELEASE_JOIN_TIMEOUT) {
                debug!(entity = self.id, "Derived task did not stop in time");
            }
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("state", &*self.state.read())
            .finish()
    }
}

struct CacheShared {
    contexts: Mutex<HashMap<ContextKey, Weak<ContextInner>>>,
    queue: Arc<WorkQueue>,
    teardowns: AtomicUsize,
}

struct ContextInner {
    key: ContextKey,
    entities: RwLock<HashMap<u32, Arc<Entity>>>,
    cache: Arc<CacheShared>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        {
            let mut contexts = self.cache.contexts.lock();
            // A new context may already have taken the slot.
            if contexts.get(&self.key).map_or(false, |w| w.strong_count() == 0) {
                contexts.remove(&self.key);
            }
        }
        let entities = std::mem::take(self.entities.get_mut());
        let cache = Arc::clone(&self.cache);
        let key = self.key;
        self.cache.queue.submit(move |_| {
            for entity in entities.values() {
                entity.release_resources();
            }
            cache.teardowns.fetch_add(1, Ordering::SeqCst);
            debug!(context = %key, entities = entities.len(), "Released entity context");
        });
    }
}

/// Scoped reference to an entity context. Cloning acquires, dropping releases.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<ContextInner>,
}

impl ContextHandle {
    pub fn key(&self) -> ContextKey {
        self.inner.key
    }

    pub fn get(&self, id: u32) -> Option<Arc<Entity>> {
        self.inner.entities.read().get(&id).cloned()
    }

    /// Entity `id`, created if absent. Concurrent callers get the same instance.
    pub fn get_or_create(&self, id: u32) -> Arc<Entity> {
        if let Some(entity) = self.get(id) {
            return entity;
        }
        let mut entities = self.inner.entities.write();
        Arc::clone(entities.entry(id).or_insert_with(|| {
            trace!(context = %self.inner.key, entity = id, "Created entity");
            Arc::new(Entity::new(id, self.inner.key))
        }))
    }

    pub fn len(&self) -> usize {
        self.inner.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.inner.cache.queue
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle").field("key", &self.inner.key).finish()
    }
}

#[derive(Clone)]
pub struct EntityCache {
    shared: Arc<CacheShared>,
}

impl EntityCache {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                contexts: Mutex::new(HashMap::new()),
                queue,
                teardowns: AtomicUsize::new(0),
            }),
        }
    }

    /// Handle to the context `key`, sharing it with any live handle.
    pub fn acquire(&self, key: ContextKey) -> ContextHandle {
        let mut contexts = self.shared.contexts.lock();
        if let Some(inner) = contexts.get(&key).and_then(Weak::upgrade) {
            return ContextHandle { inner };
        }
        let inner = Arc::new(ContextInner {
            key,
            entities: RwLock::new(HashMap::new()),
            cache: Arc::clone(&self.shared),
        });
        contexts.insert(key, Arc::downgrade(&inner));
        debug!(context = %key, "Opened entity context");
        ContextHandle { inner }
    }

    pub fn live_contexts(&self) -> usize {
        self.shared
            .contexts
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Number of contexts torn down so far.
    pub fn teardowns(&self) -> usize {
        self.shared.teardowns.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.shared.queue
    }
}

/// Keeps entity state current from decoded packets that carry an object id.
pub struct EntityTracker {
    id_field: String,
}

impl Default for EntityTracker {
    fn default() -> Self {
        Self {
            id_field: "object_id".to_string(),
        }
    }
}

impl PacketInterceptor for EntityTracker {
    fn intercept(&self, _packet: &mut Packet, ctx: &InterceptContext<'_>) -> anyhow::Result<()> {
        let (Some(entities), Some(id)) = (ctx.env.entities, ctx.decoded.integer(&self.id_field)) else {
            return Ok(());
        };
        let id = u32::try_from(id).with_context(|| format!("object id {} out of range", id))?;
        let entity = entities.get_or_create(id);
        let decoded = ctx.decoded;
        entity.update(|state| {
            if let Some(name) = decoded.text("name") {
                state.name = Some(name.to_string());
            }
            if state.kind.is_none() && ctx.template.is_defined() {
                state.kind = Some(ctx.template.name().to_string());
            }
            if let Some(template_id) = decoded.integer("template_id") {
                state.template_id = Some(template_id);
            }
            let coordinate = |alias: &str| decoded.integer(alias).and_then(|v| i32::try_from(v).ok());
            if let (Some(x), Some(y), Some(z)) = (coordinate("x"), coordinate("y"), coordinate("z")) {
                state.location = Some((x, y, z));
            }
        });
        Ok(())
    }
}
