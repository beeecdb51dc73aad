//! Message and byte credit for one subscription.
//!
//! Each dimension has a limit (possibly unlimited) and a count of credit in
//! use. A message can be sent only if both dimensions can cover it. Changes
//! between "has credit" and "out of credit" are published to registered
//! listeners as [`CreditStateChanged`] events, always after the internal lock
//! has been released so that listeners may call back into the manager.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use strum::{Display, EnumString};

/// Value passed to [`CreditManager::add_credit`] meaning "no limit".
pub const UNLIMITED_CREDIT: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allowance {
    Unlimited,
    Limited(u64),
}

impl Allowance {
    /// Prefetch-style limit where 0 means unlimited.
    pub fn from_prefetch(limit: u64) -> Self {
        if limit == 0 {
            Self::Unlimited
        } else {
            Self::Limited(limit)
        }
    }

    fn available(&self, used: u64) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Limited(limit) => Some(limit.saturating_sub(used)),
        }
    }
}

/// When consumed credit comes back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FlowMode {
    /// Credit is a window over unsettled messages: it is returned when a
    /// message is acknowledged as well as when it is released.
    Window,
    /// Credit is granted explicitly by the consumer and only returned for
    /// messages that were not kept.
    Credit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CreditUnit {
    Message,
    Byte,
}

/// Published when a subscription runs out of credit or regains it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreditStateChanged {
    pub has_credit: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(CreditStateChanged) + Send + Sync>;

#[derive(Debug)]
struct CreditState {
    message_limit: Allowance,
    byte_limit: Allowance,
    used_messages: u64,
    used_bytes: u64,
    /// Last state published to listeners.
    reported_credit: bool,
}

impl CreditState {
    fn has_credit(&self) -> bool {
        self.message_limit
            .available(self.used_messages)
            .map_or(true, |n| n > 0)
            && self
                .byte_limit
                .available(self.used_bytes)
                .map_or(true, |n| n > 0)
    }

    fn can_cover(&self, size: u64) -> bool {
        self.message_limit
            .available(self.used_messages)
            .map_or(true, |n| n >= 1)
            && self
                .byte_limit
                .available(self.used_bytes)
                .map_or(true, |n| n >= size)
    }

    /// Returns the event to publish if the reported state flips.
    fn report(&mut self, has_credit: bool) -> Option<CreditStateChanged> {
        if self.reported_credit == has_credit {
            return None;
        }
        self.reported_credit = has_credit;
        Some(CreditStateChanged { has_credit })
    }
}

pub struct CreditManager {
    mode: FlowMode,
    state: Mutex<CreditState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl CreditManager {
    pub fn new(mode: FlowMode, message_limit: Allowance, byte_limit: Allowance) -> Self {
        let state = CreditState {
            message_limit,
            byte_limit,
            used_messages: 0,
            used_bytes: 0,
            reported_credit: true,
        };
        let reported_credit = state.has_credit();

        Self {
            mode,
            state: Mutex::new(CreditState {
                reported_credit,
                ..state
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// A window manager sized by prefetch limits, where 0 means unlimited.
    pub fn prefetch(prefetch_size: u64, prefetch_count: u64) -> Self {
        Self::new(
            FlowMode::Window,
            Allowance::from_prefetch(prefetch_count),
            Allowance::from_prefetch(prefetch_size),
        )
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn has_credit(&self) -> bool {
        self.state.lock().has_credit()
    }

    /// Remaining `(messages, bytes)`; `None` means unlimited.
    pub fn available(&self) -> (Option<u64>, Option<u64>) {
        let state = self.state.lock();
        (
            state.message_limit.available(state.used_messages),
            state.byte_limit.available(state.used_bytes),
        )
    }

    /// Reserves credit for a message of `size` bytes. Fails without
    /// consuming anything if either dimension cannot cover it.
    pub fn use_credit_for_message(&self, size: u64) -> bool {
        let event = {
            let mut state = self.state.lock();
            if !state.can_cover(size) {
                let event = state.report(false);
                drop(state);
                self.publish(event);
                return false;
            }

            state.used_messages += 1;
            state.used_bytes = state.used_bytes.saturating_add(size);
            None
        };

        self.publish(event);
        true
    }

    /// Gives back credit reserved by [`Self::use_credit_for_message`].
    pub fn restore_credit(&self, messages: u64, bytes: u64) {
        let event = {
            let mut state = self.state.lock();
            state.used_messages = state.used_messages.saturating_sub(messages);
            state.used_bytes = state.used_bytes.saturating_sub(bytes);
            let has_credit = state.has_credit();
            state.report(has_credit)
        };

        self.publish(event);
    }

    /// Grants additional credit. [`UNLIMITED_CREDIT`] lifts the limit.
    pub fn add_credit(&self, unit: CreditUnit, value: u64) {
        let event = {
            let mut state = self.state.lock();
            let limit = match unit {
                CreditUnit::Message => &mut state.message_limit,
                CreditUnit::Byte => &mut state.byte_limit,
            };
            *limit = match (*limit, value) {
                (_, UNLIMITED_CREDIT) | (Allowance::Unlimited, _) => Allowance::Unlimited,
                (Allowance::Limited(n), v) => Allowance::Limited(n.saturating_add(v)),
            };
            let has_credit = state.has_credit();
            state.report(has_credit)
        };

        self.publish(event);
    }

    /// Replaces the prefetch limits. Credit already in use stays in use.
    pub fn set_credit_limit(&self, prefetch_size: u64, prefetch_count: u64) {
        let event = {
            let mut state = self.state.lock();
            state.message_limit = Allowance::from_prefetch(prefetch_count);
            state.byte_limit = Allowance::from_prefetch(prefetch_size);
            let has_credit = state.has_credit();
            state.report(has_credit)
        };

        self.publish(event);
    }

    /// Drops all credit. Messages already sent no longer count against it.
    pub fn clear_credit(&self) {
        let event = {
            let mut state = self.state.lock();
            state.message_limit = Allowance::Limited(0);
            state.byte_limit = Allowance::Limited(0);
            state.used_messages = 0;
            state.used_bytes = 0;
            state.report(false)
        };

        self.publish(event);
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(CreditStateChanged) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    fn publish(&self, event: Option<CreditStateChanged>) {
        let Some(event) = event else {
            return;
        };

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for CreditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditManager")
            .field("mode", &self.mode)
            .field("state", &*self.state.lock())
            .finish()
    }
}
