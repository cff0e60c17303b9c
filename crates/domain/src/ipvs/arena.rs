use crate::ipvs::error::IpvsError;

/// Generation-checked handle into an [`Arena`].
///
/// A handle to a retired slot never resolves, even after the slot index is
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slab allocator with a free list and per-slot generations.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make room for one insertion without allocating in `insert_with`.
    pub fn reserve(&mut self) -> Result<(), IpvsError> {
        if self.free_head.is_some() {
            return Ok(());
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| IpvsError::OutOfMemory("service slot"))
    }

    /// Insert a value built from its own handle.
    ///
    /// Growth uses a fallible reservation so exhaustion surfaces as
    /// [`IpvsError::OutOfMemory`] instead of aborting.
    pub fn insert_with(&mut self, build: impl FnOnce(SlotId) -> T) -> Result<SlotId, IpvsError> {
        if let Some(index) = self.free_head {
            if let Some(&Slot::Vacant {
                generation,
                next_free,
            }) = self.slots.get(index as usize)
            {
                let id = SlotId { index, generation };
                self.free_head = next_free;
                self.slots[index as usize] = Slot::Occupied {
                    generation,
                    value: build(id),
                };
                self.len += 1;
                return Ok(id);
            }
            self.free_head = None;
        }

        self.reserve()?;
        let index = u32::try_from(self.slots.len())
            .map_err(|_| IpvsError::OutOfMemory("service slot"))?;
        let id = SlotId {
            index,
            generation: 0,
        };
        self.slots.push(Slot::Occupied {
            generation: 0,
            value: build(id),
        });
        self.len += 1;
        Ok(id)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Retire a slot and bump its generation.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let next = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, next) else {
            return None;
        };
        self.free_head = Some(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                SlotId {
                    index: u32::try_from(i).ok()?,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }
}
