// SPDX-License-Identifier: CEPL-1.0
//! Overlay textures and texture arrays by name.
//!
//! Overlay textures live in a descriptor table indexed by a stable slot
//! number; that number is what overlay vertices carry as `tex_id`. The
//! table starts at [`INITIAL_OVERLAY_CAPACITY`] entries and doubles when it
//! fills up. Texture arrays are addressed by name and layer name; exactly
//! one array is bound to the opaque pipeline at a time.

use std::collections::HashMap;

use tessera_core::{EngineError, Result};

use crate::lifetime::{LifetimeTracker, TrackedResource};
use crate::sync::SlotId;

pub const INITIAL_OVERLAY_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureAdded {
    pub index: u32,
    /// The overlay table had to grow; pipelines must be rebuilt.
    pub grew: bool,
}

struct Texture<R> {
    index: u32,
    resource: R,
    info: TextureInfo,
}

struct TextureArray<R> {
    resource: R,
    info: TextureInfo,
    layers: HashMap<String, u32>,
}

pub struct TextureRegistry<R: TrackedResource> {
    slots: Vec<Option<String>>,
    textures: HashMap<String, Texture<R>>,
    arrays: HashMap<String, TextureArray<R>>,
    current_array: Option<String>,
    capacity: usize,
    generation: u64,
}

impl<R: TrackedResource> Default for TextureRegistry<R> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            textures: HashMap::new(),
            arrays: HashMap::new(),
            current_array: None,
            capacity: INITIAL_OVERLAY_CAPACITY,
            generation: 0,
        }
    }
}

impl<R: TrackedResource> TextureRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` or replaces its image. A replaced image keeps its slot and
    /// the old one is retired.
    pub fn add(
        &mut self,
        tracker: &LifetimeTracker<R>,
        in_flight: &[SlotId],
        id: &str,
        resource: R,
        info: TextureInfo,
    ) -> TextureAdded {
        self.generation += 1;

        if let Some(existing) = self.textures.get_mut(id) {
            let old = std::mem::replace(&mut existing.resource, resource);
            existing.info = info;
            tracker.mark_for_destruction(old, in_flight.iter().copied());
            return TextureAdded {
                index: existing.index,
                grew: false,
            };
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(id.to_owned());
                free
            }
            None => {
                self.slots.push(Some(id.to_owned()));
                self.slots.len() - 1
            }
        };

        let mut grew = false;
        while self.slots.len() > self.capacity {
            self.capacity *= 2;
            grew = true;
        }

        self.textures.insert(
            id.to_owned(),
            Texture {
                index: index as u32,
                resource,
                info,
            },
        );
        TextureAdded {
            index: index as u32,
            grew,
        }
    }

    /// Retires `id` and frees its slot for reuse.
    pub fn remove(&mut self, tracker: &LifetimeTracker<R>, in_flight: &[SlotId], id: &str) -> Result<()> {
        let texture = self
            .textures
            .remove(id)
            .ok_or_else(|| EngineError::UnknownTexture(id.to_owned()))?;
        self.slots[texture.index as usize] = None;
        tracker.mark_for_destruction(texture.resource, in_flight.iter().copied());
        self.generation += 1;
        Ok(())
    }

    pub fn index_of(&self, id: &str) -> Result<u32> {
        self.textures
            .get(id)
            .map(|t| t.index)
            .ok_or_else(|| EngineError::UnknownTexture(id.to_owned()))
    }

    pub fn info(&self, id: &str) -> Result<TextureInfo> {
        self.textures
            .get(id)
            .map(|t| t.info)
            .ok_or_else(|| EngineError::UnknownTexture(id.to_owned()))
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.textures.get(id).map(|t| &t.resource)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.textures.contains_key(id)
    }

    /// The overlay descriptor table, `capacity()` entries long. Empty slots
    /// are `None` and should be bound to a placeholder.
    pub fn overlay_table(&self) -> Vec<Option<&R>> {
        (0..self.capacity)
            .map(|i| {
                self.slots
                    .get(i)
                    .and_then(Option::as_ref)
                    .and_then(|id| self.get(id))
            })
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Loads or replaces texture array `id`; `layers` names each layer in
    /// order. The first array loaded becomes current.
    pub fn add_array(
        &mut self,
        tracker: &LifetimeTracker<R>,
        in_flight: &[SlotId],
        id: &str,
        layers: &[String],
        resource: R,
        info: TextureInfo,
    ) {
        let layers = layers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32))
            .collect();
        let array = TextureArray {
            resource,
            info,
            layers,
        };
        if let Some(old) = self.arrays.insert(id.to_owned(), array) {
            tracker.mark_for_destruction(old.resource, in_flight.iter().copied());
        }
        if self.current_array.is_none() {
            self.current_array = Some(id.to_owned());
        }
        self.generation += 1;
    }

    pub fn array_layer(&self, array: &str, layer: &str) -> Result<u32> {
        let entry = self
            .arrays
            .get(array)
            .ok_or_else(|| EngineError::UnknownTextureArray(array.to_owned()))?;
        entry
            .layers
            .get(layer)
            .copied()
            .ok_or_else(|| EngineError::UnknownArrayLayer {
                array: array.to_owned(),
                layer: layer.to_owned(),
            })
    }

    pub fn array_info(&self, id: &str) -> Result<TextureInfo> {
        self.arrays
            .get(id)
            .map(|a| a.info)
            .ok_or_else(|| EngineError::UnknownTextureArray(id.to_owned()))
    }

    pub fn set_current_array(&mut self, id: &str) -> Result<()> {
        if !self.arrays.contains_key(id) {
            return Err(EngineError::UnknownTextureArray(id.to_owned()));
        }
        if self.current_array.as_deref() != Some(id) {
            self.current_array = Some(id.to_owned());
            self.generation += 1;
        }
        Ok(())
    }

    pub fn current_array_name(&self) -> Option<&str> {
        self.current_array.as_deref()
    }

    pub fn current_array(&self) -> Option<&R> {
        self.current_array
            .as_deref()
            .and_then(|id| self.arrays.get(id))
            .map(|a| &a.resource)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Retires every texture and array.
    pub fn clear(&mut self, tracker: &LifetimeTracker<R>, in_flight: &[SlotId]) {
        let textures = std::mem::take(&mut self.textures).into_values().map(|t| t.resource);
        let arrays = std::mem::take(&mut self.arrays).into_values().map(|a| a.resource);
        tracker.mark_all(textures.chain(arrays), in_flight);
        self.slots.clear();
        self.current_array = None;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::tests::Res;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn setup() -> (TextureRegistry<Res>, LifetimeTracker<Res>, Arc<Mutex<Vec<u64>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let tracker = LifetimeTracker::new(move |r: Res| sink.lock().push(r.0));
        (TextureRegistry::new(), tracker, log)
    }

    const INFO: TextureInfo = TextureInfo { width: 16, height: 16 };

    #[test]
    fn slots_are_stable_and_reused() {
        let (mut reg, tracker, _) = setup();
        assert_eq!(reg.add(&tracker, &[], "missing", Res(1), INFO).index, 0);
        assert_eq!(reg.add(&tracker, &[], "font", Res(2), INFO).index, 1);
        assert_eq!(reg.add(&tracker, &[], "icon", Res(3), INFO).index, 2);

        reg.remove(&tracker, &[], "font").unwrap();
        assert_eq!(reg.index_of("icon").unwrap(), 2);
        assert_eq!(reg.add(&tracker, &[], "logo", Res(4), INFO).index, 1);
    }

    #[test]
    fn replacing_texture_retires_old_image() {
        let (mut reg, tracker, log) = setup();
        reg.add(&tracker, &[], "font", Res(1), INFO);
        let added = reg.add(&tracker, &[SlotId(0)], "font", Res(2), TextureInfo { width: 32, height: 8 });
        assert_eq!(added.index, 0);
        assert!(tracker.is_pending(1));
        assert_eq!(reg.info("font").unwrap().width, 32);

        tracker.on_frame_retired(SlotId(0));
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(reg.get("font"), Some(&Res(2)));
    }

    #[test]
    fn unknown_texture_is_an_error() {
        let (mut reg, tracker, _) = setup();
        assert!(matches!(reg.remove(&tracker, &[], "nope"), Err(EngineError::UnknownTexture(_))));
        assert!(reg.index_of("nope").is_err());
    }

    #[test]
    fn overlay_table_doubles_when_full() {
        let (mut reg, tracker, _) = setup();
        for i in 0..INITIAL_OVERLAY_CAPACITY as u64 {
            assert!(!reg.add(&tracker, &[], &format!("t{i}"), Res(i), INFO).grew);
        }
        let added = reg.add(&tracker, &[], "overflow", Res(1000), INFO);
        assert!(added.grew);
        assert_eq!(reg.capacity(), 2 * INITIAL_OVERLAY_CAPACITY);

        let table = reg.overlay_table();
        assert_eq!(table.len(), 64);
        assert_eq!(table[32], Some(&Res(1000)));
        assert!(table[33].is_none());
    }

    #[test]
    fn arrays_resolve_layers_by_name() {
        let (mut reg, tracker, _) = setup();
        let layers = vec!["dirt".to_owned(), "grass_side".to_owned()];
        reg.add_array(&tracker, &[], "blocks", &layers, Res(1), INFO);

        assert_eq!(reg.current_array_name(), Some("blocks"));
        assert_eq!(reg.array_layer("blocks", "grass_side").unwrap(), 1);
        assert!(matches!(
            reg.array_layer("blocks", "stone"),
            Err(EngineError::UnknownArrayLayer { .. })
        ));
        assert!(matches!(
            reg.set_current_array("items"),
            Err(EngineError::UnknownTextureArray(_))
        ));
    }

    #[test]
    fn selecting_array_bumps_generation_once() {
        let (mut reg, tracker, _) = setup();
        reg.add_array(&tracker, &[], "default", &["m".to_owned()], Res(1), INFO);
        reg.add_array(&tracker, &[], "blocks", &["dirt".to_owned()], Res(2), INFO);
        let g = reg.generation();
        reg.set_current_array("blocks").unwrap();
        reg.set_current_array("blocks").unwrap();
        assert_eq!(reg.generation(), g + 1);
        assert_eq!(reg.current_array(), Some(&Res(2)));
    }

    #[test]
    fn clear_retires_textures_and_arrays() {
        let (mut reg, tracker, log) = setup();
        reg.add(&tracker, &[], "a", Res(1), INFO);
        reg.add_array(&tracker, &[], "b", &[], Res(2), INFO);
        reg.clear(&tracker, &[]);
        let mut released = log.lock().clone();
        released.sort();
        assert_eq!(released, vec![1, 2]);
        assert!(reg.current_array().is_none());
    }
}
