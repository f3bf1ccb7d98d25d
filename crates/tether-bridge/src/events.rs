//! Event relays
//!
//! A relay connects one managed event on one instance to one native
//! callback. Delivery happens on the raising thread while the relay's lock
//! is held, so a handler replacement never races an in-flight delivery:
//! after `replace_handler` returns, the old callback will not run again.

use crate::marshal::utf16_into_raw;
use crate::refs::{Handle, RefTable, NULL_HANDLE};
use crate::BridgeResult;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::{Arc, Weak};
use tether_runtime::object::{Instance, ListenerId};
use tether_runtime::Value;

/// Native event handler.
///
/// Receives the subscription context, the event name as a NUL-terminated
/// UTF-16 buffer owned by the relay (valid for the duration of the call),
/// and handles for the sender and the event arguments. The handler owns
/// both handles and releases them through the reference-table exports.
pub type NativeEventFn =
    extern "C" fn(context: *mut c_void, event_name: *const u16, sender: Handle, args: Handle);

struct Handler {
    context: usize,
    callback: NativeEventFn,
}

struct RelayState {
    handler: Option<Handler>,
    listener: Option<ListenerId>,
    armed: bool,
}

/// One subscription: a managed event wired to a native callback.
pub struct EventRelay {
    target: Weak<Instance>,
    event: String,
    // Stable NUL-terminated buffer handed to the callback on every delivery.
    event_utf16: *mut u16,
    refs: Arc<RefTable>,
    args_weak: bool,
    state: Mutex<RelayState>,
}

// The raw buffer is owned exclusively by the relay and freed on drop.
unsafe impl Send for EventRelay {}
unsafe impl Sync for EventRelay {}

impl EventRelay {
    /// Attach a relay to `instance`'s event. Fails if the class does not
    /// declare the event.
    pub fn subscribe(
        instance: &Arc<Instance>,
        event: &str,
        context: usize,
        callback: NativeEventFn,
        refs: Arc<RefTable>,
        args_weak: bool,
    ) -> BridgeResult<Arc<Self>> {
        let relay = Arc::new(Self {
            target: Arc::downgrade(instance),
            event: event.into(),
            event_utf16: utf16_into_raw(event),
            refs,
            args_weak,
            state: Mutex::new(RelayState {
                handler: Some(Handler { context, callback }),
                listener: None,
                armed: true,
            }),
        });
        let weak = Arc::downgrade(&relay);
        let id = instance.attach_listener(
            event,
            Arc::new(move |sender, args| {
                if let Some(relay) = weak.upgrade() {
                    relay.deliver(sender, args);
                }
            }),
        )?;
        relay.state.lock().listener = Some(id);
        Ok(relay)
    }

    /// The subscribed event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Swap in a new callback without touching the subscription. Any
    /// delivery already in flight completes against the old callback first.
    pub fn replace_handler(&self, context: usize, callback: NativeEventFn) {
        self.state.lock().handler = Some(Handler { context, callback });
    }

    /// Disarm the relay and detach its runtime listener.
    pub fn unsubscribe(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.armed = false;
            state.handler = None;
            state.listener.take()
        };
        if let (Some(id), Some(instance)) = (listener, self.target.upgrade()) {
            instance.detach_listener(&self.event, id);
        }
    }

    fn deliver(&self, sender: &Value, args: &Value) {
        let state = self.state.lock();
        if !state.armed {
            return;
        }
        let Some(handler) = &state.handler else {
            return;
        };
        let sender_h = self.expose(sender, false);
        let args_h = self.expose(args, self.args_weak);
        (handler.callback)(
            handler.context as *mut c_void,
            self.event_utf16,
            sender_h,
            args_h,
        );
    }

    fn expose(&self, value: &Value, weak: bool) -> Handle {
        if value.is_null() {
            return NULL_HANDLE;
        }
        self.refs.acquire(value.clone(), weak)
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        crate::marshal::utf16_free(self.event_utf16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::utf16_from_ptr;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tether_runtime::object::ClassBuilder;

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static LAST_CONTEXT: AtomicUsize = AtomicUsize::new(0);
    static LAST_SENDER: AtomicU64 = AtomicU64::new(0);

    extern "C" fn record(context: *mut c_void, name: *const u16, sender: Handle, _args: Handle) {
        assert_eq!(utf16_from_ptr(name).expect("name"), "Changed");
        HITS.fetch_add(1, Ordering::SeqCst);
        LAST_CONTEXT.store(context as usize, Ordering::SeqCst);
        LAST_SENDER.store(sender, Ordering::SeqCst);
    }

    extern "C" fn record_other(context: *mut c_void, _: *const u16, _: Handle, _: Handle) {
        LAST_CONTEXT.store(context as usize, Ordering::SeqCst);
    }

    fn subject() -> Arc<Instance> {
        Instance::new(ClassBuilder::new("t.Subject").event("Changed").build())
    }

    #[test]
    fn test_relay_lifecycle() {
        let refs = Arc::new(RefTable::new());
        let inst = subject();
        let sender = Value::Object(inst.clone());

        let relay =
            EventRelay::subscribe(&inst, "Changed", 7, record, refs.clone(), false).expect("sub");
        inst.raise("Changed", &sender, &Value::Null);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_CONTEXT.load(Ordering::SeqCst), 7);

        // Sender handle resolves to the raising instance.
        let handle = LAST_SENDER.load(Ordering::SeqCst);
        assert!(refs.resolve(handle).expect("sender").identity_eq(&sender));

        // Replacement reroutes delivery without re-subscribing.
        relay.replace_handler(11, record_other);
        inst.raise("Changed", &sender, &Value::Null);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_CONTEXT.load(Ordering::SeqCst), 11);

        // After unsubscribe nothing is delivered.
        relay.unsubscribe();
        inst.raise("Changed", &sender, &Value::Null);
        assert_eq!(LAST_CONTEXT.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_subscribe_unknown_event_fails() {
        let refs = Arc::new(RefTable::new());
        let inst = subject();
        assert!(EventRelay::subscribe(&inst, "Missing", 0, record, refs, false).is_err());
    }
}
