// Handler registration with stale-id detection

use std::rc::Rc;

/// Handle returned when registering a callback.
///
/// Slots are reused after removal; the generation makes a removed id stay invalid
/// even when its slot is taken by a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    index: u32,
    generation: u32,
}

struct Slot<F: ?Sized> {
    generation: u32,
    handler: Option<Rc<F>>,
}

/// Arena of callbacks keyed by [`HandlerId`].
pub struct HandlerTable<F: ?Sized> {
    slots: Vec<Slot<F>>,
    free: Vec<u32>,
    live: usize,
}

impl<F: ?Sized> Default for HandlerTable<F> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<F: ?Sized> HandlerTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: Rc<F>) -> HandlerId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.handler = Some(handler);
            return HandlerId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            handler: Some(handler),
        });
        HandlerId {
            index,
            generation: 0,
        }
    }

    /// Returns false for unknown or already removed ids.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.handler.is_some() => {
                slot.handler = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: HandlerId) -> Option<Rc<F>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.handler.clone())
    }

    /// Current handlers, cloned so they can be called without holding the table.
    pub fn snapshot(&self) -> Vec<Rc<F>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
