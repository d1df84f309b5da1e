//! Hook lists keyed by event
//!
//! The registry is shared behind an `Arc`, so dispatch can run without
//! holding whatever lock guards the engine context.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::list::{HookFn, OrderedHookList};

/// Dispatches slower than this are logged
const SLOW_DISPATCH_NS: u64 = 1_000_000;

/// Host events that callbacks can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HookEvent {
    /// Start of a server tick, before the host's own tick code
    PreTick = 0,
    /// End of a server tick
    Tick = 1,
    /// Before a map starts loading
    PreMapLoad = 2,
    /// After a map has loaded
    MapLoad = 3,
}

impl HookEvent {
    pub const ALL: [HookEvent; 4] = [
        HookEvent::PreTick,
        HookEvent::Tick,
        HookEvent::PreMapLoad,
        HookEvent::MapLoad,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            HookEvent::PreTick => "pre_tick",
            HookEvent::Tick => "tick",
            HookEvent::PreMapLoad => "pre_map_load",
            HookEvent::MapLoad => "map_load",
        }
    }

    /// Parse an event name as used in `#[event_hook(event = "...")]`
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    lists: [OrderedHookList; 4],
    ticks: AtomicU64,
    last_tick_ns: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, event: HookEvent) -> &OrderedHookList {
        &self.lists[event as usize]
    }

    pub fn add(&self, event: HookEvent, callback: HookFn) -> bool {
        let added = self.list(event).add(callback);
        if added {
            tracing::debug!("Added {} hook {:#x}", event, callback as usize);
        }
        added
    }

    pub fn remove(&self, event: HookEvent, callback: HookFn) -> bool {
        let removed = self.list(event).remove(callback);
        if removed {
            tracing::debug!("Removed {} hook {:#x}", event, callback as usize);
        }
        removed
    }

    /// Run the callbacks of `event`, returning how many ran
    pub fn invoke(&self, event: HookEvent) -> usize {
        let start = Instant::now();
        let count = self.list(event).invoke_all();

        if event == HookEvent::Tick {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            let elapsed = start.elapsed().as_nanos() as u64;
            self.last_tick_ns.store(elapsed, Ordering::Relaxed);

            if elapsed > SLOW_DISPATCH_NS {
                tracing::warn!(
                    "Tick hooks took {}ms (tick {})",
                    elapsed / 1_000_000,
                    self.ticks.load(Ordering::Relaxed)
                );
            }
        }

        count
    }

    /// Number of `Tick` dispatches so far
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Duration of the last `Tick` dispatch in nanoseconds
    pub fn last_tick_ns(&self) -> u64 {
        self.last_tick_ns.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for list in &self.lists {
            list.clear();
        }
    }
}
