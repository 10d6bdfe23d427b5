//! Owning wrapper for raw Vulkan handles
//!
//! Raw `vk::*` handles are plain values with no lifetime information. This
//! module pairs a handle with the closure that destroys it, so every native
//! resource has exactly one owner and is destroyed exactly once. Ownership can
//! be released without destruction when a longer-lived owner takes over.

/// A native Vulkan resource paired with its destructor.
///
/// A handle is either *empty* (no underlying value, dropping is a no-op) or
/// *valid* (the destructor runs exactly once when the handle drops, unless the
/// value was transferred out with [`VulkanHandle::release`]). Handles are
/// move-only; cloning a raw handle without cloning ownership is done through
/// [`VulkanHandle::get`].
pub struct VulkanHandle<T: Copy> {
    value: Option<T>,
    destructor: Option<Box<dyn FnOnce(T) + Send>>,
}

impl<T: Copy> VulkanHandle<T> {
    /// Wrap a raw handle together with the closure that destroys it.
    pub fn new(value: T, destructor: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            value: Some(value),
            destructor: Some(Box::new(destructor)),
        }
    }

    /// Wrap a raw handle that this owner must not destroy (borrowed handles,
    /// e.g. physical devices or queues retrieved from a logical device).
    pub fn borrowed(value: T) -> Self {
        Self {
            value: Some(value),
            destructor: None,
        }
    }

    /// An empty handle. Dropping it is a no-op.
    pub fn empty() -> Self {
        Self {
            value: None,
            destructor: None,
        }
    }

    /// Whether an underlying value is present.
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// The raw handle, if present.
    pub fn get(&self) -> Option<T> {
        self.value
    }

    /// Transfer the raw handle out without running the destructor.
    ///
    /// Used when a longer-lived owner takes over a resource that was created
    /// inside a constructor. The handle becomes empty.
    pub fn release(&mut self) -> Option<T> {
        self.destructor = None;
        self.value.take()
    }
}

impl<T: Copy> Default for VulkanHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Copy> Drop for VulkanHandle<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(destructor)) = (self.value.take(), self.destructor.take()) {
            destructor(value);
        }
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for VulkanHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanHandle")
            .field("value", &self.value)
            .field("owned", &self.destructor.is_some())
            .finish()
    }
}
