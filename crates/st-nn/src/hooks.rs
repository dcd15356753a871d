// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scoped interception points attached to individual layers.
//!
//! A layer that owns a [`HookPoint`] fires it with its input right before the
//! forward computation and with its output gradient during backward. Each
//! registration returns a [`HookHandle`]; dropping the handle deregisters the
//! hook, so registrations never outlive the scope that created them.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use st_tensor::{PureResult, Tensor};

/// Observer invoked around a layer's forward and backward passes. `layer` is
/// the tag supplied at registration.
pub trait LayerHook {
    fn pre_forward(&self, layer: usize, input: &Tensor) -> PureResult<()>;

    fn post_backward(&self, layer: usize, grad_output: &Tensor) -> PureResult<()>;
}

struct HookSlot {
    id: u64,
    layer: usize,
    hook: Rc<dyn LayerHook>,
}

type SlotList = Rc<RefCell<Vec<HookSlot>>>;

#[derive(Default)]
pub struct HookPoint {
    slots: SlotList,
    next_id: Cell<u64>,
}

impl core::fmt::Debug for HookPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HookPoint(active={})", self.active())
    }
}

impl HookPoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `hook` under the tag `layer` until the handle is dropped.
    pub fn register(&self, layer: usize, hook: Rc<dyn LayerHook>) -> HookHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.slots.borrow_mut().push(HookSlot { id, layer, hook });
        HookHandle {
            slots: Rc::downgrade(&self.slots),
            id,
        }
    }

    /// Number of live registrations.
    pub fn active(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn fire_pre_forward(&self, input: &Tensor) -> PureResult<()> {
        for (layer, hook) in self.snapshot() {
            hook.pre_forward(layer, input)?;
        }
        Ok(())
    }

    pub fn fire_post_backward(&self, grad_output: &Tensor) -> PureResult<()> {
        for (layer, hook) in self.snapshot() {
            hook.post_backward(layer, grad_output)?;
        }
        Ok(())
    }

    // Hooks may register or drop handles on this point while running.
    fn snapshot(&self) -> Vec<(usize, Rc<dyn LayerHook>)> {
        self.slots
            .borrow()
            .iter()
            .map(|slot| (slot.layer, Rc::clone(&slot.hook)))
            .collect()
    }
}

/// Registration guard returned by [`HookPoint::register`].
#[must_use = "dropping the handle removes the hook immediately"]
pub struct HookHandle {
    slots: Weak<RefCell<Vec<HookSlot>>>,
    id: u64,
}

impl core::fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HookHandle(id={})", self.id)
    }
}

impl HookHandle {
    /// Removes the hook now.
    pub fn remove(self) {}
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.borrow_mut().retain(|slot| slot.id != self.id);
        }
    }
}
