//! weak-value-map: a thread-safe map whose values are held weakly.
//! An entry stays readable exactly as long as something outside the map
//! holds a strong handle to its value; after that it disappears.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: couple three independently timed events (caller mutation,
//!   value reclamation, concurrent reads) under one lock without
//!   deadlock and without ever exposing a dead value.
//! - Layers:
//!   - Tracked<V> / WeakHandle<V>: strong and weak handles to a shared
//!     value. The strong side runs registered callbacks when the last
//!     strong handle is dropped.
//!   - SlotTable<K, V, S>: structural map returning generational slot
//!     ids; stale ids never resolve.
//!   - ExclusionLock<T>: scoped mutex with a non-blocking try path and a
//!     debug-only reentrancy check.
//!   - WeakValueMap<K, V, S>: public API; stores `WeakHandle`s in the
//!     table and registers one reclamation hook per insertion.
//!
//! Slot states
//! - Live: the weak handle resolves.
//! - Reclaimed: the value is gone but the hook has not removed the slot
//!   yet. Every read treats this exactly like Absent; `len()` still
//!   counts it.
//! - Absent: no slot for the key.
//!
//! Reclamation protocol
//! - The hook captures only a `Weak` reference to the map's shared state
//!   and the slot id of its insertion, so values never keep a map alive.
//! - On firing it tries the lock without blocking. With the lock, it
//!   removes the slot if the id still resolves to a dead value. Without
//!   it, the id is queued on a channel; every lock scope drains the queue
//!   on entry and before releasing, and a queue left non-empty after a
//!   release triggers one more non-blocking attempt.
//! - Generational ids make the overwrite race benign: a hook for a value
//!   that was replaced or removed holds a stale id and does nothing.
//!
//! Constraints
//! - Keys are held strongly; only values are weak.
//! - Every operation is linearized by the one lock per map. Maps are
//!   independent of each other.
//! - User callbacks (`get_or_insert_with` factories, `retain`
//!   predicates) run under the lock and must not call back into the same
//!   map. Debug builds panic on such reentry; release builds deadlock.
//! - Slots leaving the table are detached (their hook cancelled), and
//!   their keys dropped, only after the lock is released. Either step may
//!   run user `Drop` code.
//!
//! Notes and non-goals
//! - No weak keys.
//! - Iteration is lazy and takes the lock once per step; it is not a
//!   snapshot.
//! - Values must be `Tracked<V>`; a value type that cannot be shared by
//!   reference simply cannot be stored, so there is no runtime
//!   construction error.

mod error;
mod lock;
mod slot_table;
mod slot_table_proptest;
mod tracked;
mod weak_value_map;

// Public surface
pub use error::{Error, Result};
pub use lock::ExclusionLock;
pub use tracked::{HookId, Tracked, WeakHandle};
pub use weak_value_map::{Iter, WeakValueMap};
