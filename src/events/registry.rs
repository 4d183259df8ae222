//! Event registry: ordered listeners per event, one-shot listeners and
//! pattern-gated `hears` listeners.
//!
//! `trigger` snapshots the listener list before invoking anything, so
//! listeners may register or remove listeners (or trigger other events)
//! without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use uuid::Uuid;

use super::kind::{Event, IntoEvents};
use super::pattern::{HearMatch, Patterns};

/// Opaque handle returned by registration, used with `unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Returned by a listener to decide whether later listeners run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Continue,
    /// Skip the remaining listeners for this trigger call only.
    Stop,
}

/// Arguments whose text a default `hears` test can inspect.
pub trait Hearable {
    fn hear_text(&self) -> String;
}

impl Hearable for String {
    fn hear_text(&self) -> String {
        self.clone()
    }
}

impl Hearable for Vec<String> {
    fn hear_text(&self) -> String {
        self.first().cloned().unwrap_or_default()
    }
}

type Listener<A> = Arc<dyn Fn(&A) -> Propagation + Send + Sync>;
type HearHandler<A> = Arc<dyn Fn(&A, &HearMatch) + Send + Sync>;

/// Decides whether a `hears` listener's patterns match a trigger's arguments.
pub type HearTest<A> = Arc<dyn Fn(&Patterns, &A) -> Option<HearMatch> + Send + Sync>;

enum ListenerKind<A> {
    Plain(Listener<A>),
    Hears {
        patterns: Arc<Patterns>,
        handler: HearHandler<A>,
    },
}

impl<A> Clone for ListenerKind<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(l) => Self::Plain(Arc::clone(l)),
            Self::Hears { patterns, handler } => Self::Hears {
                patterns: Arc::clone(patterns),
                handler: Arc::clone(handler),
            },
        }
    }
}

struct Entry<A> {
    id: ListenerId,
    once: bool,
    kind: ListenerKind<A>,
}

impl<A> Clone for Entry<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            kind: self.kind.clone(),
        }
    }
}

/// Map from event to its ordered listeners.
///
/// An event with no listeners has no entry at all, so `has_listeners` is a
/// presence test.
pub struct EventRegistry<A> {
    events: RwLock<HashMap<Event, Vec<Entry<A>>>>,
    hear_test: RwLock<HearTest<A>>,
    default_hear_test: HearTest<A>,
}

impl<A: Hearable> EventRegistry<A> {
    /// Registry whose default test matches body patterns against `hear_text`.
    pub fn new() -> Self {
        Self::with_hear_test(Arc::new(|patterns: &Patterns, args: &A| {
            patterns.match_text(&args.hear_text())
        }))
    }
}

impl<A: Hearable> Default for EventRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> EventRegistry<A> {
    /// Registry with a custom default test. `reset` restores this test.
    pub fn with_hear_test(test: HearTest<A>) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            hear_test: RwLock::new(Arc::clone(&test)),
            default_hear_test: test,
        }
    }

    /// Register `listener` on every named event. Listeners fire in registration order.
    pub fn on<F>(&self, events: impl IntoEvents, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.listen(events, move |args| {
            listener(args);
            Propagation::Continue
        })
    }

    /// Like `on`, but the listener decides whether later listeners run.
    pub fn listen<F>(&self, events: impl IntoEvents, listener: F) -> ListenerId
    where
        F: Fn(&A) -> Propagation + Send + Sync + 'static,
    {
        self.add(events, false, ListenerKind::Plain(Arc::new(listener)))
    }

    /// Listener removed before its first invocation.
    pub fn once<F>(&self, events: impl IntoEvents, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let listener: Listener<A> = Arc::new(move |args| {
            listener(args);
            Propagation::Continue
        });
        self.add(events, true, ListenerKind::Plain(listener))
    }

    /// Listener that fires only when the hear test matches, and then stops
    /// propagation for that trigger.
    pub fn hears<F>(&self, patterns: Patterns, events: impl IntoEvents, handler: F) -> ListenerId
    where
        F: Fn(&A, &HearMatch) + Send + Sync + 'static,
    {
        self.add(
            events,
            false,
            ListenerKind::Hears {
                patterns: Arc::new(patterns),
                handler: Arc::new(handler),
            },
        )
    }

    /// Invoke every listener for `event` in order.
    ///
    /// Returns `false` when nothing is registered for the event.
    pub fn trigger(&self, event: &Event, args: &A) -> bool {
        let snapshot = match self.read_events().get(event) {
            Some(entries) => entries.clone(),
            None => {
                debug!(event = %event, "No listeners registered");
                return false;
            }
        };
        let test = Arc::clone(&*self.hear_test.read().unwrap_or_else(PoisonError::into_inner));

        for entry in snapshot {
            if entry.once {
                // Already consumed by a re-entrant trigger
                if !self.remove(event, entry.id) {
                    continue;
                }
            } else if !self.has_listener(event, entry.id) {
                continue;
            }

            let flow = match &entry.kind {
                ListenerKind::Plain(listener) => listener(args),
                ListenerKind::Hears { patterns, handler } => match test(patterns, args) {
                    Some(matched) => {
                        debug!(event = %event, pattern = %matched.pattern, "Heard pattern");
                        handler(args, &matched);
                        Propagation::Stop
                    }
                    None => Propagation::Continue,
                },
            };

            if flow == Propagation::Stop {
                break;
            }
        }

        true
    }

    /// Remove one listener, or every listener on the event when `id` is `None`.
    ///
    /// Returns whether anything was removed.
    pub fn unset(&self, event: &Event, id: Option<ListenerId>) -> bool {
        match id {
            Some(id) => self.remove(event, id),
            None => self.write_events().remove(event).is_some(),
        }
    }

    /// Drop every registration and restore the default hear test.
    pub fn reset(&self) {
        self.write_events().clear();
        *self.hear_test.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::clone(&self.default_hear_test);
    }

    /// Replace the test used by `hears` listeners.
    pub fn set_hear_test(&self, test: HearTest<A>) {
        *self.hear_test.write().unwrap_or_else(PoisonError::into_inner) = test;
    }

    /// Run the current hear test directly.
    pub fn hear_test(&self, patterns: &Patterns, args: &A) -> Option<HearMatch> {
        let test = Arc::clone(&*self.hear_test.read().unwrap_or_else(PoisonError::into_inner));
        test(patterns, args)
    }

    pub fn has_listeners(&self, event: &Event) -> bool {
        self.read_events().contains_key(event)
    }

    pub fn has_listener(&self, event: &Event, id: ListenerId) -> bool {
        self.read_events()
            .get(event)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }

    pub fn listener_count(&self, event: &Event) -> usize {
        self.read_events().get(event).map_or(0, Vec::len)
    }

    /// Events that currently have listeners.
    pub fn events(&self) -> Vec<Event> {
        self.read_events().keys().cloned().collect()
    }

    fn add(&self, events: impl IntoEvents, once: bool, kind: ListenerKind<A>) -> ListenerId {
        let id = ListenerId::new();
        let mut map = self.write_events();
        for event in events.into_events() {
            debug!(event = %event, listener = %id, once, "Registered listener");
            map.entry(event).or_default().push(Entry {
                id,
                once,
                kind: kind.clone(),
            });
        }
        id
    }

    fn remove(&self, event: &Event, id: ListenerId) -> bool {
        let mut map = self.write_events();
        let Some(entries) = map.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            map.remove(event);
        }
        removed
    }

    fn read_events(&self) -> RwLockReadGuard<'_, HashMap<Event, Vec<Entry<A>>>> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_events(&self) -> RwLockWriteGuard<'_, HashMap<Event, Vec<Entry<A>>>> {
        self.events.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn my_event() -> Event {
        Event::custom("my_event")
    }

    /// Records invocations by label.
    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        fn push(&self, label: &str) {
            self.0.lock().unwrap().push(label.to_string());
        }
        fn get(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn on_registers_under_each_event() {
        let registry = EventRegistry::<String>::new();
        let id = registry.on("my_event,my_other_event", |_| {});

        assert!(registry.has_listener(&my_event(), id));
        assert!(registry.has_listener(&Event::custom("my_other_event"), id));
    }

    #[test]
    fn trigger_without_listeners_returns_false() {
        let registry = EventRegistry::<String>::new();
        assert!(!registry.trigger(&Event::custom("no_event"), &String::new()));
    }

    #[test]
    fn trigger_runs_listeners_in_order() {
        let registry = EventRegistry::<String>::new();
        let calls = Calls::default();

        let c = calls.clone();
        registry.on(my_event(), move |arg| c.push(&format!("first:{arg}")));
        let c = calls.clone();
        registry.on(my_event(), move |arg| c.push(&format!("second:{arg}")));

        assert!(registry.trigger(&my_event(), &"param".to_string()));
        assert_eq!(calls.get(), vec!["first:param", "second:param"]);
    }

    #[test]
    fn once_is_removed_before_it_runs() {
        let registry = Arc::new(EventRegistry::<String>::new());
        let calls = Calls::default();

        registry.on(my_event(), |_| {});
        let inner = Arc::clone(&registry);
        let c = calls.clone();
        let id = registry.once(my_event(), move |arg| {
            c.push("once");
            // Re-triggering the same event must not re-enter this listener
            inner.trigger(&my_event(), arg);
        });

        registry.trigger(&my_event(), &String::new());

        assert_eq!(calls.get(), vec!["once"]);
        assert!(!registry.has_listener(&my_event(), id));
        assert!(registry.has_listeners(&my_event()));
    }

    #[test]
    fn listener_can_stop_propagation() {
        let registry = EventRegistry::<String>::new();
        let calls = Calls::default();

        registry.listen(my_event(), |_| Propagation::Stop);
        let c = calls.clone();
        registry.on(my_event(), move |_| c.push("late"));

        registry.trigger(&my_event(), &String::new());
        assert!(calls.get().is_empty());

        // Stopping one trigger does not affect the next
        registry.unset(&my_event(), None);
        let c = calls.clone();
        registry.on(my_event(), move |_| c.push("fresh"));
        registry.trigger(&my_event(), &String::new());
        assert_eq!(calls.get(), vec!["fresh"]);
    }

    #[test]
    fn hears_calls_handler_on_match() {
        let registry = EventRegistry::<String>::new();
        let calls = Calls::default();

        let c = calls.clone();
        registry.hears(Patterns::any("lo").unwrap(), my_event(), move |arg, m| {
            c.push(&format!("{arg}:{}", m.matched()))
        });

        registry.trigger(&my_event(), &"hello".to_string());
        assert_eq!(calls.get(), vec!["hello:lo"]);
    }

    #[test]
    fn hears_ignores_non_matching_text() {
        let registry = EventRegistry::<String>::new();
        let calls = Calls::default();

        let c = calls.clone();
        registry.hears(Patterns::any("low").unwrap(), my_event(), move |_, _| c.push("heard"));

        registry.trigger(&my_event(), &"hello".to_string());
        assert!(calls.get().is_empty());
    }

    #[test]
    fn hears_stops_only_later_listeners() {
        let registry = EventRegistry::<String>::new();
        let calls = Calls::default();

        let c = calls.clone();
        registry.on(my_event(), move |_| c.push("before"));
        registry.hears(Patterns::any(["hello", "hi"]).unwrap(), my_event(), |_, _| {});
        let c = calls.clone();
        registry.on(my_event(), move |_| c.push("after"));

        registry.trigger(&my_event(), &"hello there".to_string());
        assert_eq!(calls.get(), vec!["before"]);

        registry.trigger(&my_event(), &"goodbye".to_string());
        assert_eq!(calls.get(), vec!["before", "before", "after"]);
    }

    #[test]
    fn custom_hear_test_is_used_and_reset_restores_default() {
        let registry = EventRegistry::<Vec<String>>::new();
        let args = vec!["baseball".to_string(), "football".to_string()];
        let patterns = Patterns::any("ball").unwrap();

        // Both arguments must match
        registry.set_hear_test(Arc::new(|patterns: &Patterns, args: &Vec<String>| {
            let first = patterns.match_text(&args[0])?;
            patterns.match_text(&args[1]).map(|_| first)
        }));
        assert!(registry.hear_test(&patterns, &args).is_some());
        let mixed = vec!["soccer".to_string(), "basketball".to_string()];
        assert!(registry.hear_test(&patterns, &mixed).is_none());

        registry.on(my_event(), |_| {});
        registry.reset();

        assert!(registry.events().is_empty());
        // Default test only looks at the first argument
        let reversed = vec!["basketball".to_string(), "soccer".to_string()];
        assert!(registry.hear_test(&patterns, &reversed).is_some());
        assert!(registry.hear_test(&patterns, &mixed).is_none());
    }

    #[test]
    fn unset_single_listener() {
        let registry = EventRegistry::<String>::new();
        registry.on(my_event(), |_| {});
        let id = registry.on(my_event(), |_| {});

        assert!(registry.unset(&my_event(), Some(id)));
        assert!(!registry.has_listener(&my_event(), id));
        assert_eq!(registry.listener_count(&my_event()), 1);
    }

    #[test]
    fn unset_last_listener_removes_event() {
        let registry = EventRegistry::<String>::new();
        let id = registry.on(my_event(), |_| {});

        registry.unset(&my_event(), Some(id));
        assert!(!registry.has_listeners(&my_event()));
    }

    #[test]
    fn unset_whole_event() {
        let registry = EventRegistry::<String>::new();
        registry.on(my_event(), |_| {});
        registry.on(my_event(), |_| {});

        assert!(registry.unset(&my_event(), None));
        assert!(!registry.has_listeners(&my_event()));
    }

    #[test]
    fn unset_missing_is_false() {
        let registry = EventRegistry::<String>::new();
        assert!(!registry.unset(&my_event(), None));
        assert!(!registry.unset(&my_event(), Some(ListenerId::new())));

        registry.on(my_event(), |_| {});
        assert!(!registry.unset(&my_event(), Some(ListenerId::new())));
    }

    #[test]
    fn listener_removed_mid_trigger_does_not_run() {
        let registry = Arc::new(EventRegistry::<String>::new());
        let calls = Calls::default();

        let late_id = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&registry);
        let id_slot = Arc::clone(&late_id);
        registry.on(my_event(), move |_| {
            if let Some(id) = *id_slot.lock().unwrap() {
                inner.unset(&my_event(), Some(id));
            }
        });
        let c = calls.clone();
        let id = registry.on(my_event(), move |_| c.push("late"));
        *late_id.lock().unwrap() = Some(id);

        registry.trigger(&my_event(), &String::new());
        assert!(calls.get().is_empty());
    }
}
