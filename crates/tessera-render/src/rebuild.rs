// SPDX-License-Identifier: CEPL-1.0
//! Ordered rebuild of swapchain-dependent GPU state.
//!
//! Each stage names what it invalidates downstream. [`Rebuild::cascade`]
//! expands a request to everything downstream of it and [`ORDER`] is the
//! creation order. A backend walks `ORDER`, recreating the stages in the
//! set, and may widen the set as it goes: a swapchain whose format changed
//! also invalidates the pipelines. Teardown order is left to the backend.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rebuild: u32 {
        const SWAPCHAIN   = 1 << 0;
        const DEPTH       = 1 << 1;
        const SYNC        = 1 << 2;
        const UNIFORMS    = 1 << 3;
        const PIPELINES   = 1 << 4;
        const DESCRIPTORS = 1 << 5;
        const COMMANDS    = 1 << 6;
    }
}

/// Creation order. Every stage comes after everything it depends on.
pub const ORDER: [Rebuild; 7] = [
    Rebuild::SWAPCHAIN,
    Rebuild::DEPTH,
    Rebuild::SYNC,
    Rebuild::UNIFORMS,
    Rebuild::PIPELINES,
    Rebuild::DESCRIPTORS,
    Rebuild::COMMANDS,
];

impl Rebuild {
    /// Stages invalidated when `self` alone is rebuilt.
    fn dependents(self) -> Rebuild {
        if self == Rebuild::SWAPCHAIN {
            Rebuild::DEPTH | Rebuild::SYNC | Rebuild::UNIFORMS | Rebuild::COMMANDS
        } else if self == Rebuild::DEPTH || self == Rebuild::DESCRIPTORS {
            Rebuild::COMMANDS
        } else if self == Rebuild::UNIFORMS {
            Rebuild::DESCRIPTORS
        } else if self == Rebuild::PIPELINES {
            Rebuild::DESCRIPTORS | Rebuild::COMMANDS
        } else {
            Rebuild::empty()
        }
    }

    /// `self` plus everything downstream of it.
    pub fn cascade(self) -> Rebuild {
        let mut all = self;
        loop {
            let next = ORDER
                .iter()
                .filter(|stage| all.contains(**stage))
                .fold(all, |acc, stage| acc | stage.dependents());
            if next == all {
                return all;
            }
            all = next;
        }
    }

    /// Cascaded stages in creation order, for a request that cannot widen
    /// while it runs.
    pub fn stages(self) -> impl Iterator<Item = Rebuild> {
        let all = self.cascade();
        ORDER.into_iter().filter(move |stage| all.contains(*stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_rebuild_reaches_commands() {
        let stages: Vec<Rebuild> = Rebuild::SWAPCHAIN.stages().collect();
        assert_eq!(
            stages,
            vec![
                Rebuild::SWAPCHAIN,
                Rebuild::DEPTH,
                Rebuild::SYNC,
                Rebuild::UNIFORMS,
                Rebuild::DESCRIPTORS,
                Rebuild::COMMANDS
            ]
        );
    }

    #[test]
    fn pipeline_rebuild_leaves_swapchain_alone() {
        let all = Rebuild::PIPELINES.cascade();
        assert_eq!(all, Rebuild::PIPELINES | Rebuild::DESCRIPTORS | Rebuild::COMMANDS);
    }

    #[test]
    fn commands_are_a_leaf() {
        assert_eq!(Rebuild::COMMANDS.cascade(), Rebuild::COMMANDS);
        assert_eq!(Rebuild::empty().stages().count(), 0);
    }

    #[test]
    fn widening_mid_walk_matches_a_cascade_of_the_union() {
        // the walk a backend does when the new swapchain changed format
        let mut pending = Rebuild::SWAPCHAIN.cascade();
        let mut visited = Vec::new();
        for stage in ORDER {
            if pending.contains(stage) {
                visited.push(stage);
                if stage == Rebuild::SWAPCHAIN {
                    pending |= Rebuild::PIPELINES.cascade();
                }
            }
        }
        let expected: Vec<Rebuild> = (Rebuild::SWAPCHAIN | Rebuild::PIPELINES).stages().collect();
        assert_eq!(visited, expected);
        assert_eq!(visited.len(), ORDER.len());
    }

    #[test]
    fn order_is_a_topological_sort() {
        for (i, stage) in ORDER.iter().enumerate() {
            for later in stage.dependents().iter() {
                let j = ORDER.iter().position(|s| *s == later).unwrap();
                assert!(i < j, "{stage:?} must precede {later:?}");
            }
        }
    }
}
