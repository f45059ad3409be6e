//! Fixed-capacity allocator for small integer handles.

/// Bitmap allocator handing out the lowest free id in `0..capacity`.
#[derive(Debug, Clone)]
pub struct IdPool {
    slots: Vec<bool>,
    in_use: usize,
}

impl IdPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity],
            in_use: 0,
        }
    }

    /// Reserve the lowest free id, or `None` when every slot is taken.
    ///
    /// Slots past the `u16` range are never handed out.
    pub fn alloc(&mut self) -> Option<u16> {
        let idx = self.slots.iter().position(|used| !used)?;
        let id = u16::try_from(idx).ok()?;
        self.slots[idx] = true;
        self.in_use += 1;
        Some(id)
    }

    /// Return an id to the pool. Releasing a free or out-of-range id is a no-op.
    pub fn release(&mut self, id: u16) -> bool {
        match self.slots.get_mut(usize::from(id)) {
            Some(slot) if *slot => {
                *slot = false;
                self.in_use -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_allocated(&self, id: u16) -> bool {
        self.slots.get(usize::from(id)).copied().unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = false);
        self.in_use = 0;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}
