// SPDX-License-Identifier: CEPL-1.0
//! Named models, instance sets and overlays.
//!
//! Every registry counts its own generation. A generation bump means that a
//! buffer handle the recorder would bind has appeared, changed or gone away,
//! so previously recorded command buffers are stale.

use std::collections::BTreeMap;

use bytemuck::Pod;
use tessera_core::{EngineError, Result};
use tessera_math::{InstanceData, OverlayVertex, TransparentVertex, Vertex, WireframeVertex};

use crate::buffer::{BufferAllocator, BufferUpdate, DynamicBuffer, GpuContext};

/// Writes `data` into `buffer` and bumps `generation` if the handle the
/// recorder binds moved. A failed resize can still have retired the old
/// allocation, so the handle is compared on the error path too.
fn upload<T: Pod, A: BufferAllocator>(
    generation: &mut u64,
    buffer: &mut DynamicBuffer<T, A>,
    ctx: &mut GpuContext<'_, A>,
    data: &[T],
) -> Result<BufferUpdate> {
    let before = buffer.handle();
    let result = buffer.set_data(ctx, data);
    let invalidated = match &result {
        Ok(update) => update.invalidates_commands(),
        Err(_) => false,
    };
    if invalidated || buffer.handle() != before {
        *generation += 1;
    }
    result
}

/// Base geometry plus keyed sets of instances drawn against it.
///
/// A model may also carry a translucent layer. It is drawn with the same
/// instance sets after every opaque model and is empty unless set.
pub struct InstancedModel<V: Pod, A: BufferAllocator> {
    base: DynamicBuffer<V, A>,
    transparent: DynamicBuffer<TransparentVertex, A>,
    instance_sets: BTreeMap<String, DynamicBuffer<InstanceData, A>>,
}

impl<V: Pod, A: BufferAllocator> InstancedModel<V, A> {
    fn new() -> Self {
        Self {
            base: DynamicBuffer::vertex(),
            transparent: DynamicBuffer::vertex(),
            instance_sets: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &DynamicBuffer<V, A> {
        &self.base
    }

    pub fn transparent(&self) -> &DynamicBuffer<TransparentVertex, A> {
        &self.transparent
    }

    pub fn instance_sets(&self) -> impl Iterator<Item = (&str, &DynamicBuffer<InstanceData, A>)> {
        self.instance_sets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn has_instance_set(&self, set: &str) -> bool {
        self.instance_sets.contains_key(set)
    }

    fn take_allocations(&mut self) -> Vec<A::Allocation> {
        let mut out: Vec<A::Allocation> = self
            .base
            .take_allocation()
            .into_iter()
            .chain(self.transparent.take_allocation())
            .collect();
        out.extend(
            std::mem::take(&mut self.instance_sets)
                .into_values()
                .filter_map(|mut set| set.take_allocation()),
        );
        out
    }
}

pub struct ModelRegistry<V: Pod, A: BufferAllocator> {
    models: BTreeMap<String, InstancedModel<V, A>>,
    generation: u64,
}

impl<V: Pod, A: BufferAllocator> Default for ModelRegistry<V, A> {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            generation: 0,
        }
    }
}

impl<V: Pod, A: BufferAllocator> ModelRegistry<V, A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `id` or replaces its base geometry. A translucent layer set
    /// earlier is kept.
    pub fn set_model(&mut self, ctx: &mut GpuContext<'_, A>, id: &str, vertices: &[V]) -> Result<()> {
        let created = !self.models.contains_key(id);
        let model = self.models.entry(id.to_owned()).or_insert_with(InstancedModel::new);
        let generation = self.generation;
        let result = upload(&mut self.generation, &mut model.base, ctx, vertices);
        if created && self.generation == generation {
            self.generation += 1;
        }
        result.map(|_| ())
    }

    /// Creates `id` or replaces both its base geometry and its translucent
    /// layer. An empty `transparent` slice drops the layer.
    pub fn set_layered_model(
        &mut self,
        ctx: &mut GpuContext<'_, A>,
        id: &str,
        opaque: &[V],
        transparent: &[TransparentVertex],
    ) -> Result<()> {
        self.set_model(ctx, id, opaque)?;
        let model = self
            .models
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownModel(id.to_owned()))?;
        upload(&mut self.generation, &mut model.transparent, ctx, transparent).map(|_| ())
    }

    /// Removes `id` and retires its base, translucent and instance buffers
    /// together.
    pub fn remove_model(&mut self, ctx: &mut GpuContext<'_, A>, id: &str) -> Result<()> {
        let mut model = self
            .models
            .remove(id)
            .ok_or_else(|| EngineError::UnknownModel(id.to_owned()))?;
        ctx.retire_all(model.take_allocations());
        self.generation += 1;
        Ok(())
    }

    /// Creates or replaces instance set `set` of `model`.
    pub fn set_instances(
        &mut self,
        ctx: &mut GpuContext<'_, A>,
        model: &str,
        set: &str,
        instances: &[InstanceData],
    ) -> Result<BufferUpdate> {
        let entry = self
            .models
            .get_mut(model)
            .ok_or_else(|| EngineError::UnknownModel(model.to_owned()))?;
        let buffer = entry
            .instance_sets
            .entry(set.to_owned())
            .or_insert_with(DynamicBuffer::vertex);
        upload(&mut self.generation, buffer, ctx, instances)
    }

    pub fn remove_instances(&mut self, ctx: &mut GpuContext<'_, A>, model: &str, set: &str) -> Result<()> {
        let entry = self
            .models
            .get_mut(model)
            .ok_or_else(|| EngineError::UnknownModel(model.to_owned()))?;
        let mut buffer = entry
            .instance_sets
            .remove(set)
            .ok_or_else(|| EngineError::UnknownInstanceSet {
                model: model.to_owned(),
                set: set.to_owned(),
            })?;
        if buffer.destroy(ctx) {
            self.generation += 1;
        }
        Ok(())
    }

    /// Like [`remove_instances`](Self::remove_instances) but a missing model
    /// or set is not an error. Returns whether anything was removed.
    pub fn remove_instances_safe(&mut self, ctx: &mut GpuContext<'_, A>, model: &str, set: &str) -> bool {
        self.remove_instances(ctx, model, set).is_ok()
    }

    /// Drops every instance set of every model, keeping base geometry.
    pub fn clear_instances(&mut self, ctx: &mut GpuContext<'_, A>) {
        let retired: Vec<A::Allocation> = self
            .models
            .values_mut()
            .flat_map(|m| std::mem::take(&mut m.instance_sets).into_values())
            .filter_map(|mut set| set.take_allocation())
            .collect();
        if !retired.is_empty() {
            ctx.retire_all(retired);
            self.generation += 1;
        }
    }

    /// Removes every model.
    pub fn clear(&mut self, ctx: &mut GpuContext<'_, A>) {
        let retired: Vec<A::Allocation> = std::mem::take(&mut self.models)
            .into_values()
            .flat_map(|mut m| m.take_allocations())
            .collect();
        ctx.retire_all(retired);
        self.generation += 1;
    }

    pub fn has_model(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// Errors if `model` is unknown.
    pub fn has_instance_set(&self, model: &str, set: &str) -> Result<bool> {
        self.models
            .get(model)
            .map(|m| m.has_instance_set(set))
            .ok_or_else(|| EngineError::UnknownModel(model.to_owned()))
    }

    pub fn get(&self, id: &str) -> Option<&InstancedModel<V, A>> {
        self.models.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InstancedModel<V, A>)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct OverlayRegistry<A: BufferAllocator> {
    entries: BTreeMap<String, DynamicBuffer<OverlayVertex, A>>,
    generation: u64,
}

impl<A: BufferAllocator> Default for OverlayRegistry<A> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            generation: 0,
        }
    }
}

impl<A: BufferAllocator> OverlayRegistry<A> {
    pub fn set(&mut self, ctx: &mut GpuContext<'_, A>, id: &str, vertices: &[OverlayVertex]) -> Result<()> {
        let buffer = self.entries.entry(id.to_owned()).or_insert_with(DynamicBuffer::vertex);
        upload(&mut self.generation, buffer, ctx, vertices).map(|_| ())
    }

    /// Missing ids are ignored. Returns whether an entry was removed.
    pub fn remove(&mut self, ctx: &mut GpuContext<'_, A>, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(mut buffer) => {
                buffer.destroy(ctx);
                self.generation += 1;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, ctx: &mut GpuContext<'_, A>) {
        if self.entries.is_empty() {
            return;
        }
        let retired: Vec<A::Allocation> = std::mem::take(&mut self.entries)
            .into_values()
            .filter_map(|mut b| b.take_allocation())
            .collect();
        ctx.retire_all(retired);
        self.generation += 1;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DynamicBuffer<OverlayVertex, A>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// All drawable state owned by a renderer.
pub struct Scene<A: BufferAllocator> {
    pub models: ModelRegistry<Vertex, A>,
    pub wireframes: ModelRegistry<WireframeVertex, A>,
    pub overlays: OverlayRegistry<A>,
    clear_color: [f32; 4],
    revision: u64,
}

impl<A: BufferAllocator> Default for Scene<A> {
    fn default() -> Self {
        Self {
            models: ModelRegistry::new(),
            wireframes: ModelRegistry::new(),
            overlays: OverlayRegistry::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            revision: 0,
        }
    }
}

impl<A: BufferAllocator> Scene<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        if self.clear_color != rgba {
            self.clear_color = rgba;
            self.revision += 1;
        }
    }

    /// Forces a re-record of every image, e.g. after textures or pipelines changed.
    pub fn invalidate(&mut self) {
        self.revision += 1;
    }

    /// Changes whenever recorded command buffers would differ.
    pub fn generation(&self) -> u64 {
        self.models.generation() + self.wireframes.generation() + self.overlays.generation() + self.revision
    }

    /// Removes every instance set of both model kinds.
    pub fn clear_all_instances(&mut self, ctx: &mut GpuContext<'_, A>) {
        self.models.clear_instances(ctx);
        self.wireframes.clear_instances(ctx);
    }

    /// Retires every buffer in the scene.
    pub fn destroy(&mut self, ctx: &mut GpuContext<'_, A>) {
        self.models.clear(ctx);
        self.wireframes.clear(ctx);
        self.overlays.clear(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SlotId;
    use crate::testing::{Harness, MockAllocator};

    fn tri() -> Vec<Vertex> {
        vec![Vertex::default(); 3]
    }

    #[test]
    fn instances_on_unknown_model_fail() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        let err = models
            .set_instances(&mut h.ctx(&[]), "ghost", "a", &[InstanceData::default()])
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownModel(ref id) if id == "ghost"));
    }

    #[test]
    fn strict_removal_reports_missing_names() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        models.set_model(&mut h.ctx(&[]), "cube", &tri()).unwrap();

        assert!(matches!(
            models.remove_model(&mut h.ctx(&[]), "ghost"),
            Err(EngineError::UnknownModel(_))
        ));
        assert!(matches!(
            models.remove_instances(&mut h.ctx(&[]), "cube", "nope"),
            Err(EngineError::UnknownInstanceSet { .. })
        ));
        assert!(!models.remove_instances_safe(&mut h.ctx(&[]), "cube", "nope"));
        assert!(!models.remove_instances_safe(&mut h.ctx(&[]), "ghost", "nope"));
    }

    #[test]
    fn removing_model_with_frames_in_flight_defers_all_buffers() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        let in_flight = [SlotId(0), SlotId(1)];

        models.set_model(&mut h.ctx(&in_flight), "cube", &tri()).unwrap();
        models
            .set_instances(&mut h.ctx(&in_flight), "cube", "a", &[InstanceData::new(1.0, 0.0, 0.0)])
            .unwrap();
        models
            .set_instances(&mut h.ctx(&in_flight), "cube", "b", &[InstanceData::default(); 2])
            .unwrap();

        models.remove_model(&mut h.ctx(&in_flight), "cube").unwrap();
        assert!(!models.has_model("cube"));
        assert_eq!(h.tracker.pending_count(), 3);

        // a slot that was not in flight at removal time changes nothing
        h.tracker.on_frame_retired(SlotId(2));
        h.tracker.on_frame_retired(SlotId(0));
        assert!(h.released().is_empty());

        h.tracker.on_frame_retired(SlotId(1));
        let mut released = h.released();
        released.sort();
        assert_eq!(released, vec![1, 2, 3]);

        h.tracker.on_frame_retired(SlotId(0));
        h.tracker.on_frame_retired(SlotId(1));
        assert_eq!(h.tracker.released_count(), 3);
    }

    #[test]
    fn generation_tracks_structural_changes_only() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        models.set_model(&mut h.ctx(&[]), "cube", &tri()).unwrap();
        models.set_instances(&mut h.ctx(&[]), "cube", "a", &[InstanceData::default()]).unwrap();
        let before = models.generation();

        let update = models
            .set_instances(&mut h.ctx(&[]), "cube", "a", &[InstanceData::new(2.0, 0.0, 0.0)])
            .unwrap();
        assert_eq!(update, BufferUpdate::InPlace);
        assert_eq!(models.generation(), before);

        models
            .set_instances(&mut h.ctx(&[]), "cube", "a", &[InstanceData::default(); 4])
            .unwrap();
        assert!(models.generation() > before);
    }

    #[test]
    fn empty_instance_set_is_tracked_but_unallocated() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        models.set_model(&mut h.ctx(&[]), "cube", &tri()).unwrap();
        models.set_instances(&mut h.ctx(&[]), "cube", "empty", &[]).unwrap();
        assert!(models.has_instance_set("cube", "empty").unwrap());
        let (_, set) = models.get("cube").unwrap().instance_sets().next().unwrap();
        assert!(set.handle().is_none());
        assert!(models.has_instance_set("ghost", "empty").is_err());
    }

    #[test]
    fn clear_instances_keeps_models() {
        let mut h = Harness::new();
        let mut scene = Scene::<MockAllocator>::new();
        scene.models.set_model(&mut h.ctx(&[]), "cube", &tri()).unwrap();
        scene
            .models
            .set_instances(&mut h.ctx(&[]), "cube", "a", &[InstanceData::default()])
            .unwrap();
        scene
            .wireframes
            .set_model(&mut h.ctx(&[]), "box", &[WireframeVertex::default(); 2])
            .unwrap();
        scene
            .wireframes
            .set_instances(&mut h.ctx(&[]), "box", "a", &[InstanceData::default()])
            .unwrap();

        scene.clear_all_instances(&mut h.ctx(&[SlotId(0)]));
        assert!(scene.models.has_model("cube"));
        assert!(!scene.models.has_instance_set("cube", "a").unwrap());
        assert!(!scene.wireframes.has_instance_set("box", "a").unwrap());
        assert_eq!(h.tracker.pending_count(), 2);
    }

    #[test]
    fn overlay_removal_is_forgiving() {
        let mut h = Harness::new();
        let mut overlays = OverlayRegistry::<MockAllocator>::default();
        overlays
            .set(&mut h.ctx(&[]), "crosshair", &[OverlayVertex::default(); 6])
            .unwrap();
        assert!(overlays.remove(&mut h.ctx(&[]), "crosshair"));
        assert!(!overlays.remove(&mut h.ctx(&[]), "crosshair"));
        assert_eq!(h.released(), vec![1]);
    }

    #[test]
    fn clear_color_change_bumps_generation() {
        let mut scene = Scene::<MockAllocator>::new();
        let g = scene.generation();
        scene.set_clear_color([0.0, 0.0, 0.0, 1.0]);
        assert_eq!(scene.generation(), g);
        scene.set_clear_color([0.2, 0.3, 0.4, 1.0]);
        assert_eq!(scene.generation(), g + 1);
    }

    #[test]
    fn destroy_retires_everything() {
        let mut h = Harness::new();
        let mut scene = Scene::<MockAllocator>::new();
        scene.models.set_model(&mut h.ctx(&[]), "cube", &tri()).unwrap();
        scene
            .overlays
            .set(&mut h.ctx(&[]), "hud", &[OverlayVertex::default(); 3])
            .unwrap();
        scene.destroy(&mut h.ctx(&[]));
        assert_eq!(h.released().len(), 2);
        assert!(scene.models.is_empty());
        assert!(scene.overlays.is_empty());
    }

    #[test]
    fn failed_model_resize_still_invalidates_recorded_commands() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        let in_flight = [SlotId(0)];
        models.set_model(&mut h.ctx(&in_flight), "cube", &tri()).unwrap();
        let before = models.generation();

        h.allocator.fail_allocs = true;
        assert!(models
            .set_model(&mut h.ctx(&in_flight), "cube", &[Vertex::default(); 5])
            .is_err());
        assert!(models.generation() > before);
        assert!(models.get("cube").unwrap().base().handle().is_none());

        h.tracker.on_frame_retired(SlotId(0));
        assert_eq!(h.released(), vec![1]);
    }

    #[test]
    fn failed_instance_and_overlay_resizes_bump_generation() {
        let mut h = Harness::new();
        let in_flight = [SlotId(0)];
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        let mut overlays = OverlayRegistry::<MockAllocator>::default();
        models.set_model(&mut h.ctx(&in_flight), "cube", &tri()).unwrap();
        models
            .set_instances(&mut h.ctx(&in_flight), "cube", "a", &[InstanceData::default()])
            .unwrap();
        overlays
            .set(&mut h.ctx(&in_flight), "hud", &[OverlayVertex::default(); 3])
            .unwrap();
        let (model_gen, overlay_gen) = (models.generation(), overlays.generation());

        h.allocator.fail_allocs = true;
        assert!(models
            .set_instances(&mut h.ctx(&in_flight), "cube", "a", &[InstanceData::default(); 2])
            .is_err());
        assert!(overlays
            .set(&mut h.ctx(&in_flight), "hud", &[OverlayVertex::default(); 6])
            .is_err());
        assert!(models.generation() > model_gen);
        assert!(overlays.generation() > overlay_gen);
        assert_eq!(h.tracker.pending_count(), 2);
    }

    #[test]
    fn failed_first_upload_leaves_generation_alone() {
        let mut h = Harness::new();
        let mut overlays = OverlayRegistry::<MockAllocator>::default();
        h.allocator.fail_allocs = true;
        assert!(overlays
            .set(&mut h.ctx(&[]), "hud", &[OverlayVertex::default(); 3])
            .is_err());
        assert_eq!(overlays.generation(), 0);
    }

    #[test]
    fn translucent_layer_shares_instances_and_retires_with_model() {
        let mut h = Harness::new();
        let in_flight = [SlotId(0)];
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        models
            .set_layered_model(&mut h.ctx(&in_flight), "glass", &tri(), &[TransparentVertex::default(); 6])
            .unwrap();
        models
            .set_instances(&mut h.ctx(&in_flight), "glass", "a", &[InstanceData::default(); 2])
            .unwrap();

        // replacing only the opaque geometry keeps the layer
        models
            .set_model(&mut h.ctx(&in_flight), "glass", &[Vertex::default(); 6])
            .unwrap();
        let glass = models.get("glass").unwrap();
        assert_eq!(glass.transparent().len(), 6);
        assert_eq!(glass.instance_sets().count(), 1);

        models.remove_model(&mut h.ctx(&in_flight), "glass").unwrap();
        // old base, new base, layer, instances
        assert_eq!(h.tracker.pending_count(), 4);
        h.tracker.on_frame_retired(SlotId(0));
        assert_eq!(h.released().len(), 4);
    }

    #[test]
    fn empty_translucent_slice_drops_the_layer() {
        let mut h = Harness::new();
        let mut models = ModelRegistry::<Vertex, MockAllocator>::new();
        models
            .set_layered_model(&mut h.ctx(&[]), "glass", &tri(), &[TransparentVertex::default(); 3])
            .unwrap();
        let before = models.generation();
        models.set_layered_model(&mut h.ctx(&[]), "glass", &tri(), &[]).unwrap();
        assert!(models.get("glass").unwrap().transparent().handle().is_none());
        assert!(models.generation() > before);
        assert_eq!(h.released(), vec![2]);
    }

    #[test]
    fn wireframe_instance_lookup() {
        let mut h = Harness::new();
        let mut scene = Scene::<MockAllocator>::new();
        scene
            .wireframes
            .set_model(&mut h.ctx(&[]), "box", &[WireframeVertex::default(); 24])
            .unwrap();
        scene
            .wireframes
            .set_instances(&mut h.ctx(&[]), "box", "selected", &[InstanceData::default()])
            .unwrap();

        assert!(scene.wireframes.has_instance_set("box", "selected").unwrap());
        assert!(!scene.wireframes.has_instance_set("box", "hovered").unwrap());
        assert!(matches!(
            scene.wireframes.has_instance_set("ghost", "selected"),
            Err(EngineError::UnknownModel(_))
        ));
        // opaque and wireframe names live apart
        assert!(scene.models.has_instance_set("box", "selected").is_err());
    }
}
