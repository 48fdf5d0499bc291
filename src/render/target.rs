use super::{GraphicsBackend, RenderResult};
use crate::vr::{Extent, ImageHandle};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

/// A color attachment wrapping one runtime-owned swapchain image.
pub trait RenderTarget {
    fn image(&self) -> ImageHandle;
    fn extent(&self) -> Extent;
    fn bind(&self);
    fn unbind(&self);
    fn clear(&self, color: [f32; 4]);
}

/// Lazily built render targets keyed by swapchain image identity.
///
/// Runtimes recycle images round-robin, so the pool never exceeds swapchain
/// depth times view count and nothing is evicted until [`Self::clear`].
pub struct RenderTargetPool<T> {
    targets: HashMap<ImageHandle, Arc<T>>,
}

impl<T> Default for RenderTargetPool<T> {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }
}

impl<T> RenderTargetPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_render_target<B>(
        &mut self,
        backend: &mut B,
        image: ImageHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<Arc<T>>
    where
        B: GraphicsBackend<Target = T>,
    {
        if let Some(target) = self.targets.get(&image) {
            return Ok(Arc::clone(target));
        }
        let target = Arc::new(backend.create_target(image, Extent::new(width, height))?);
        log::debug!(
            "[render] wrapped swapchain image {} ({}x{}) for {}",
            image.0,
            width,
            height,
            backend.label()
        );
        self.targets.insert(image, Arc::clone(&target));
        Ok(target)
    }

    pub fn contains(&self, image: ImageHandle) -> bool {
        self.targets.contains_key(&image)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.targets.is_empty() {
            log::debug!("[render] releasing {} swapchain targets", self.targets.len());
        }
        self.targets.clear();
    }
}

/// Records what happened to it instead of touching a GPU.
#[derive(Debug)]
pub struct NullRenderTarget {
    image: ImageHandle,
    extent: Extent,
    bound: Cell<bool>,
    binds: Cell<u32>,
    clears: Cell<u32>,
    last_clear: Cell<[f32; 4]>,
}

impl NullRenderTarget {
    pub fn new(image: ImageHandle, extent: Extent) -> Self {
        Self {
            image,
            extent,
            bound: Cell::new(false),
            binds: Cell::new(0),
            clears: Cell::new(0),
            last_clear: Cell::new([0.0; 4]),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.get()
    }

    pub fn bind_count(&self) -> u32 {
        self.binds.get()
    }

    pub fn clear_count(&self) -> u32 {
        self.clears.get()
    }

    pub fn last_clear_color(&self) -> [f32; 4] {
        self.last_clear.get()
    }
}

impl RenderTarget for NullRenderTarget {
    fn image(&self) -> ImageHandle {
        self.image
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn bind(&self) {
        self.bound.set(true);
        self.binds.set(self.binds.get() + 1);
    }

    fn unbind(&self) {
        self.bound.set(false);
    }

    fn clear(&self, color: [f32; 4]) {
        self.clears.set(self.clears.get() + 1);
        self.last_clear.set(color);
    }
}
