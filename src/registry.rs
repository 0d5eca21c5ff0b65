use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::bail;
use tracing::trace;
use crate::status::IpcError;

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for one registration. Cookies are never reused within a process, so a stale
///  cookie cannot accidentally remove somebody else's registration.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Cookie(u64);

impl Cookie {
    fn next() -> Cookie {
        Cookie(NEXT_COOKIE.fetch_add(1, Ordering::Relaxed))
    }
}

impl Debug for Cookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cookie({})", self.0)
    }
}

struct Record<C: ?Sized, R> {
    cookie: Cookie,
    remote: Option<R>,
    callbacks: Arc<C>,
    /// cleared when the record is unregistered, so that a dispatch working on a snapshot
    ///  skips it
    live: AtomicBool,
}

impl<C: ?Sized, R: PartialEq> Record<C, R> {
    fn is_duplicate_of(&self, remote: Option<&R>, callbacks: &Arc<C>) -> bool {
        match (self.remote.as_ref(), remote) {
            (Some(a), Some(b)) => a == b,
            _ => Arc::as_ptr(&self.callbacks) as *const () == Arc::as_ptr(callbacks) as *const (),
        }
    }
}

struct RegistryState<C: ?Sized, R> {
    records: Vec<Arc<Record<C, R>>>,
    closed: bool,
}

/// A bounded, ordered set of event subscribers for one profile.
///
/// All operations go through a single mutex, but the lock is never held while callbacks run:
///  [CallbackRegistry::for_each] takes a snapshot and checks each record's liveness right before
///  invoking it. Callbacks may therefore register or unregister (on this registry or others)
///  without deadlocking, and a record unregistered during a dispatch is not called afterwards.
///
/// `C` is the profile's callback trait (usually a `dyn` trait), `R` optionally identifies the
///  remote peer that registered, e.g. a server-side connection.
pub struct CallbackRegistry<C: ?Sized, R = ()> {
    capacity: usize,
    state: Mutex<RegistryState<C, R>>,
}

impl<C: ?Sized, R: PartialEq> CallbackRegistry<C, R> {
    pub fn new(capacity: usize) -> anyhow::Result<CallbackRegistry<C, R>> {
        if capacity == 0 {
            bail!("callback registry capacity must be at least 1");
        }
        Ok(CallbackRegistry {
            capacity,
            state: Mutex::new(RegistryState {
                records: Vec::with_capacity(capacity),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<RegistryState<C, R>> {
        // a panicking callback never runs under this lock, so the state is consistent anyway
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn register(&self, callbacks: Arc<C>) -> Result<Cookie, IpcError> {
        self.do_register(None, callbacks)
    }

    pub fn register_remote(&self, remote: R, callbacks: Arc<C>) -> Result<Cookie, IpcError> {
        self.do_register(Some(remote), callbacks)
    }

    fn do_register(&self, remote: Option<R>, callbacks: Arc<C>) -> Result<Cookie, IpcError> {
        let mut state = self.lock();
        if state.closed {
            return Err(IpcError::RegistryClosed);
        }
        if state.records.len() >= self.capacity {
            return Err(IpcError::RegistryFull { capacity: self.capacity });
        }
        if state.records.iter().any(|r| r.is_duplicate_of(remote.as_ref(), &callbacks)) {
            return Err(IpcError::AlreadyRegistered);
        }

        let cookie = Cookie::next();
        state.records.push(Arc::new(Record {
            cookie,
            remote,
            callbacks,
            live: AtomicBool::new(true),
        }));
        trace!("registered {:?}, {} of {} slots used", cookie, state.records.len(), self.capacity);
        Ok(cookie)
    }

    /// Returns `false` if there is no registration for the cookie, e.g. because it was
    ///  unregistered before.
    pub fn unregister(&self, cookie: Cookie) -> bool {
        let mut state = self.lock();
        match state.records.iter().position(|r| r.cookie == cookie) {
            Some(idx) => {
                let record = state.records.remove(idx);
                record.live.store(false, Ordering::Release);
                trace!("unregistered {:?}, {} remaining", cookie, state.records.len());
                true
            }
            None => false,
        }
    }

    pub fn unregister_remote(&self, remote: &R) -> Option<Cookie> {
        let mut state = self.lock();
        let idx = state.records.iter().position(|r| r.remote.as_ref() == Some(remote))?;
        let record = state.records.remove(idx);
        record.live.store(false, Ordering::Release);
        Some(record.cookie)
    }

    pub fn contains_remote(&self, remote: &R) -> bool {
        self.lock().records.iter()
            .any(|r| r.remote.as_ref() == Some(remote))
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// The transition that ends a registry's life: if there are no registrations left, the
    ///  registry is closed and rejects all further registrations. Returns `true` only for the
    ///  call that performed the transition, so exactly one caller tears down whatever belongs
    ///  to the registry (e.g. notifies the peer).
    pub fn close_if_empty(&self) -> bool {
        let mut state = self.lock();
        if state.closed || !state.records.is_empty() {
            return false;
        }
        state.closed = true;
        true
    }

    /// Drop all registrations and close the registry
    pub fn clear(&self) {
        let mut state = self.lock();
        for r in state.records.drain(..) {
            r.live.store(false, Ordering::Release);
        }
        state.closed = true;
    }

    fn snapshot(&self) -> Vec<Arc<Record<C, R>>> {
        self.lock().records.clone()
    }

    /// Call `f` for every registered callback in registration order, returning the number of
    ///  callbacks that were invoked
    pub fn for_each(&self, mut f: impl FnMut(&C)) -> usize {
        self.for_each_remote(|_, c| f(c))
    }

    pub fn for_each_remote(&self, mut f: impl FnMut(Option<&R>, &C)) -> usize {
        let mut num_invoked = 0;
        for record in self.snapshot() {
            if record.live.load(Ordering::Acquire) {
                f(record.remote.as_ref(), &record.callbacks);
                num_invoked += 1;
            }
        }
        num_invoked
    }
}
