use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::config::EdgeDetect;
use crate::debounce::DebounceState;
use crate::error::EventError;
use crate::gpio::{EventHandler, PinDriver, ValueHandle};

/// A pin under edge detection. Owns the open `value` handle; dropping the record
/// closes it.
pub struct PinRecord {
    pub pin: u32,
    pub exported: bool,
    /// Poller token, unique for the lifetime of the registry.
    pub token: u64,
    pub edge: EdgeDetect,
    pub debounce: DebounceState,
    /// The first notification after (re)registration reports the level, not a change.
    pub ignore_first: bool,
    pub thread_added: bool,
    value: Box<dyn ValueHandle>,
}

impl PinRecord {
    pub fn value(&self) -> &dyn ValueHandle {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> &mut dyn ValueHandle {
        self.value.as_mut()
    }

    /// Points the pin at a different edge mode and bounce interval.
    pub fn reconfigure<D: PinDriver + ?Sized>(
        &mut self,
        driver: &D,
        edge: EdgeDetect,
        bounce_ms: Option<u32>,
    ) -> Result<(), EventError> {
        driver.set_edge(self.pin, edge)?;
        self.edge = edge;
        self.debounce.bounce_ms = bounce_ms;
        self.ignore_first = true;
        Ok(())
    }

    /// Resets the edge mode, closes the value handle and unexports. Every step runs
    /// even when an earlier one fails.
    pub fn release<D: PinDriver + ?Sized>(self, driver: &D) {
        let pin = self.pin;
        if let Err(e) = driver.set_edge(pin, EdgeDetect::None) {
            warn!("reset edge of gpio {pin}: {e}");
        }
        drop(self.value);
        if self.exported
            && let Err(e) = driver.unexport(pin)
        {
            warn!("unexport gpio {pin}: {e}");
        }
        debug!("released gpio {pin}");
    }
}

#[derive(Default)]
pub struct PinRegistry {
    pins: FxHashMap<u32, PinRecord>,
    next_token: u64,
}

impl PinRegistry {
    pub fn get(&self, pin: u32) -> Option<&PinRecord> {
        self.pins.get(&pin)
    }

    pub fn get_mut(&mut self, pin: u32) -> Option<&mut PinRecord> {
        self.pins.get_mut(&pin)
    }

    pub fn get_by_token_mut(&mut self, token: u64) -> Option<&mut PinRecord> {
        self.pins.values_mut().find(|r| r.token == token)
    }

    /// Edge mode of `pin`, `None` when the pin is not registered.
    pub fn edge_of(&self, pin: u32) -> EdgeDetect {
        self.pins.get(&pin).map(|r| r.edge).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.pins.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    /// Exports `pin`, makes it an input, opens its value handle and arms `edge`.
    /// Nothing is left behind when a step fails.
    pub fn create<D: PinDriver + ?Sized>(
        &mut self,
        driver: &D,
        pin: u32,
        edge: EdgeDetect,
        bounce_ms: Option<u32>,
    ) -> Result<&mut PinRecord, EventError> {
        if edge == EdgeDetect::None {
            return Err(EventError::InvalidEdge(format!(
                "gpio {pin} needs an edge other than none"
            )));
        }
        if self.pins.contains_key(&pin) {
            return Err(EventError::AlreadyAdded(format!("gpio {pin} already registered")));
        }
        debug!("new gpio {pin}");

        driver.export(pin)?;
        let unexport = |e: EventError| {
            if let Err(unexport) = driver.unexport(pin) {
                warn!("unexport gpio {pin}: {unexport}");
            }
            e
        };

        if !driver.input_guaranteed() {
            driver.set_direction(pin, true).map_err(unexport)?;
        }
        let value = driver.open_value(pin).map_err(unexport)?;

        let token = self.next_token;
        self.next_token += 1;
        let mut record = PinRecord {
            pin,
            exported: true,
            token,
            edge: EdgeDetect::None,
            debounce: DebounceState::new(bounce_ms),
            ignore_first: true,
            thread_added: false,
            value,
        };

        if let Err(e) = driver.set_edge(pin, edge) {
            record.release(driver);
            return Err(e);
        }
        record.edge = edge;

        Ok(self.pins.entry(pin).or_insert(record))
    }

    /// Detaches the record for `pin`; the caller decides how to release it.
    pub fn take(&mut self, pin: u32) -> Option<PinRecord> {
        self.pins.remove(&pin)
    }
}

#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<(u32, EventHandler)>,
}

impl CallbackRegistry {
    pub fn add(&mut self, pin: u32, handler: EventHandler) -> Result<(), EventError> {
        self.entries
            .try_reserve(1)
            .map_err(|e| EventError::OutOfMemory(format!("callback for gpio {pin}: {e}")))?;
        self.entries.push((pin, handler));
        Ok(())
    }

    pub fn exists(&self, pin: u32) -> bool {
        self.entries.iter().any(|(p, _)| *p == pin)
    }

    /// Handlers for `pin` in registration order.
    pub fn handlers(&self, pin: u32) -> Vec<EventHandler> {
        self.entries
            .iter()
            .filter(|(p, _)| *p == pin)
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub fn remove_all(&mut self, pin: u32) {
        self.entries.retain(|(p, _)| *p != pin);
    }
}

/// "An accepted edge happened and nobody has asked yet", one flag per pin.
pub struct PendingEvents {
    flags: Vec<bool>,
}

impl PendingEvents {
    pub fn new(max_pins: usize) -> Self {
        Self {
            flags: vec![false; max_pins],
        }
    }

    pub fn check(&self, pin: u32) -> Result<usize, EventError> {
        let index = pin as usize;
        if index >= self.flags.len() {
            return Err(EventError::InvalidPin(format!(
                "gpio {pin} is outside 0..{}",
                self.flags.len()
            )));
        }
        Ok(index)
    }

    pub fn set(&mut self, pin: u32) -> Result<(), EventError> {
        let index = self.check(pin)?;
        self.flags[index] = true;
        Ok(())
    }

    pub fn clear(&mut self, pin: u32) {
        if let Ok(index) = self.check(pin) {
            self.flags[index] = false;
        }
    }

    /// Reads and clears the flag.
    pub fn take(&mut self, pin: u32) -> Result<bool, EventError> {
        let index = self.check(pin)?;
        Ok(std::mem::take(&mut self.flags[index]))
    }
}
