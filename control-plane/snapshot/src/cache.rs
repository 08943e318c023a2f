//! Serializes resource collections to their wire form once per distinct collection.
//!
//! A [`ResourceCache`] interns resource collections by value. Equal collections share one
//! [`CachedResources`] handle while any handle is alive, so the wire form is computed at most
//! once no matter how many snapshots carry the same resources. The cache only holds weak
//! references: once the last snapshot holding a collection is dropped the entry is reclaimed and
//! a later equal collection is serialized afresh.

use ahash::{AHashMap as HashMap, RandomState};
use mesh_control_core::resource::Resource;
use parking_lot::Mutex;
use prost::Message as _;
use prost_types::Any;
use std::{
    fmt,
    hash::BuildHasher,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
};

pub type WireResources = Arc<[Any]>;

/// Converts resources to their wire form.
pub trait ResourcesSerializer<T> {
    /// Serializes a whole collection of resources.
    fn serialize(&self, resources: Vec<T>) -> CachedResources<T>;

    /// Serializing an individual resource is not supported; resources are only ever published
    /// as collections.
    fn serialize_resource(&self, resource: &T) -> Result<Any, SerializeError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("serializing a single {type_url} resource is not supported; serialize a collection")]
    SingleResource { type_url: &'static str },
}

pub struct ResourceCache<T> {
    inner: Arc<Inner<T>>,
}

/// A shared, interned resource collection and its lazily computed wire form.
pub struct CachedResources<T>(Arc<Entry<T>>);

struct Inner<T> {
    hasher: RandomState,
    entries: Mutex<HashMap<u64, Vec<Weak<Entry<T>>>>>,
    serializations: AtomicU64,
}

struct Entry<T> {
    resources: Arc<[T]>,
    wire: OnceLock<WireResources>,
}

// === impl ResourceCache ===

impl<T: Resource> ResourceCache<T> {
    /// Returns the shared handle for `resources`, creating it if no equal collection is alive.
    pub fn intern(&self, resources: Vec<T>) -> CachedResources<T> {
        let hash = self.inner.hasher.hash_one(resources.as_slice());
        let mut entries = self.inner.entries.lock();
        let bucket = entries.entry(hash).or_default();

        let mut found = None;
        bucket.retain(|weak| match weak.upgrade() {
            Some(entry) => {
                if found.is_none() && *entry.resources == *resources {
                    found = Some(entry);
                }
                true
            }
            None => false,
        });
        if let Some(entry) = found {
            return CachedResources(entry);
        }

        let entry = Arc::new(Entry {
            resources: resources.into(),
            wire: OnceLock::new(),
        });
        bucket.push(Arc::downgrade(&entry));
        CachedResources(entry)
    }

    /// Drops the bookkeeping for collections that are no longer referenced.
    pub fn purge(&self) {
        self.inner.entries.lock().retain(|_, bucket| {
            bucket.retain(|weak| weak.strong_count() > 0);
            !bucket.is_empty()
        });
    }

    /// The number of distinct collections currently referenced.
    pub fn live_entries(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .flatten()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// The total number of wire form computations performed.
    pub fn serializations(&self) -> u64 {
        self.inner.serializations.load(Ordering::Relaxed)
    }
}

impl<T: Resource> ResourcesSerializer<T> for ResourceCache<T> {
    fn serialize(&self, resources: Vec<T>) -> CachedResources<T> {
        let cached = self.intern(resources);
        cached.0.wire.get_or_init(|| {
            self.inner.serializations.fetch_add(1, Ordering::Relaxed);
            cached
                .0
                .resources
                .iter()
                .map(|resource| Any {
                    type_url: T::TYPE_URL.to_string(),
                    value: resource.encode_to_vec(),
                })
                .collect()
        });
        cached
    }

    fn serialize_resource(&self, _: &T) -> Result<Any, SerializeError> {
        Err(SerializeError::SingleResource {
            type_url: T::TYPE_URL,
        })
    }
}

impl<T> Default for ResourceCache<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                hasher: RandomState::new(),
                entries: Mutex::new(HashMap::default()),
                serializations: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field(
                "serializations",
                &self.inner.serializations.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

// === impl CachedResources ===

impl<T> CachedResources<T> {
    pub fn resources(&self) -> &[T] {
        &self.0.resources
    }

    /// The wire form, if it has been computed.
    pub fn wire(&self) -> Option<&WireResources> {
        self.0.wire.get()
    }

    pub fn len(&self) -> usize {
        self.0.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.resources.is_empty()
    }

    /// True if both handles refer to the same interned collection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for CachedResources<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: PartialEq> PartialEq for CachedResources<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.resources == other.0.resources
    }
}

impl<T: Eq> Eq for CachedResources<T> {}

impl<T> fmt::Debug for CachedResources<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResources")
            .field("len", &self.0.resources.len())
            .field("serialized", &self.0.wire.get().is_some())
            .finish()
    }
}
