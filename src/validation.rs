// Shadow state model
//
// A backend-independent mirror of every resource's last-known usage state,
// kept in arena-indexed tables keyed by the same slotmap keys the backends
// use. Command buffers record `TrackedOp`s while they are recorded; the
// tracker replays them at submission, in submission order, which is the
// order the GPU executes them in. Findings are reported, never enforced.

use slotmap::SecondaryMap;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::backend::{BufferKey, DescriptorSetKey, TextureKey};
use crate::descriptor::DescriptorBinding;
use crate::types::{Access, BufferUsage, ResourceState, TextureUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferKey),
    Texture(TextureKey),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use slotmap::Key;
        match self {
            ResourceId::Buffer(key) => write!(f, "buffer {:?}", key.data()),
            ResourceId::Texture(key) => write!(f, "texture {:?}", key.data()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Violation {
    #[error("{resource}: transition asserts old state {asserted:?} but the last recorded state is {actual:?}")]
    TransitionMismatch {
        resource: ResourceId,
        asserted: ResourceState,
        actual: ResourceState,
    },
    #[error("{resource}: usage flags {usage} do not permit state {state:?}")]
    IllegalState {
        resource: ResourceId,
        state: ResourceState,
        usage: String,
    },
    #[error("{resource}: {operation} needs {access:?} access but the resource is in state {state:?}")]
    InvalidUse {
        resource: ResourceId,
        access: Access,
        state: ResourceState,
        operation: &'static str,
    },
    #[error("descriptor set {set:?}: binding {binding} was never written before being bound")]
    IncompleteDescriptorSet { set: DescriptorSetKey, binding: u32 },
    #[error("descriptor set {set:?} does not match the pipeline layout: expected {expected:?}, found {found:?}")]
    DescriptorLayoutMismatch {
        set: DescriptorSetKey,
        expected: DescriptorBinding,
        found: Option<DescriptorBinding>,
    },
    #[error("swapchain image {image_index} presented in state {state:?}, expected Present")]
    PresentState {
        image_index: u32,
        state: ResourceState,
    },
    #[error("{resource} is not known to the state model (destroyed?)")]
    UnknownResource { resource: ResourceId },
}

/// An operation recorded into a command buffer, as seen by the state model
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedOp {
    Transition {
        resource: ResourceId,
        old: ResourceState,
        new: ResourceState,
    },
    Use {
        resource: ResourceId,
        access: Access,
        operation: &'static str,
    },
}

/// The asserted old state must be the recorded one. `Undefined` is only a
/// valid old state for a resource that has never been transitioned: D3D12
/// translates it to `COMMON` as the barrier's before-state.
fn transition_matches(asserted: ResourceState, actual: ResourceState) -> bool {
    asserted == actual
}

#[derive(Default)]
pub struct StateTracker {
    buffers: SecondaryMap<BufferKey, ResourceState>,
    textures: SecondaryMap<TextureKey, ResourceState>,
    violations: Vec<Violation>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: ResourceId, state: ResourceState) {
        match resource {
            ResourceId::Buffer(key) => {
                self.buffers.insert(key, state);
            }
            ResourceId::Texture(key) => {
                self.textures.insert(key, state);
            }
        }
    }

    pub fn forget(&mut self, resource: ResourceId) {
        match resource {
            ResourceId::Buffer(key) => {
                self.buffers.remove(key);
            }
            ResourceId::Texture(key) => {
                self.textures.remove(key);
            }
        }
    }

    pub fn state(&self, resource: ResourceId) -> Option<ResourceState> {
        match resource {
            ResourceId::Buffer(key) => self.buffers.get(key).copied(),
            ResourceId::Texture(key) => self.textures.get(key).copied(),
        }
    }

    fn state_mut(&mut self, resource: ResourceId) -> Option<&mut ResourceState> {
        match resource {
            ResourceId::Buffer(key) => self.buffers.get_mut(key),
            ResourceId::Texture(key) => self.textures.get_mut(key),
        }
    }

    /// Replays one op against the model, returning what it found
    pub fn apply(&mut self, op: &TrackedOp) -> Option<Violation> {
        let violation = match *op {
            TrackedOp::Transition { resource, old, new } => match self.state_mut(resource) {
                Some(state) => {
                    let actual = *state;
                    *state = new;
                    (!transition_matches(old, actual)).then_some(Violation::TransitionMismatch {
                        resource,
                        asserted: old,
                        actual,
                    })
                }
                None => Some(Violation::UnknownResource { resource }),
            },
            TrackedOp::Use {
                resource,
                access,
                operation,
            } => match self.state(resource) {
                // first use of a buffer is implicit
                Some(ResourceState::Undefined) if matches!(resource, ResourceId::Buffer(_)) => None,
                Some(state) if state.allows(access) => None,
                Some(state) => Some(Violation::InvalidUse {
                    resource,
                    access,
                    state,
                    operation,
                }),
                None => Some(Violation::UnknownResource { resource }),
            },
        };
        if let Some(v) = &violation {
            self.violations.push(v.clone());
        }
        violation
    }

    /// A swapchain image must be handed to the presentation engine in `Present`
    pub fn check_present(&mut self, image: TextureKey, image_index: u32) -> Option<Violation> {
        let resource = ResourceId::Texture(image);
        let violation = match self.state(resource) {
            Some(ResourceState::Present) => None,
            Some(state) => Some(Violation::PresentState { image_index, state }),
            None => Some(Violation::UnknownResource { resource }),
        };
        if let Some(v) = &violation {
            self.violations.push(v.clone());
        }
        violation
    }

    /// Record a finding made outside of replay (descriptor completeness, usage flags)
    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn take_violations(&mut self) -> Vec<Violation> {
        std::mem::take(&mut self.violations)
    }
}

/// A buffer may only enter states its usage flags allow
pub fn check_buffer_state(key: BufferKey, usage: BufferUsage, state: ResourceState) -> Option<Violation> {
    let required = state.required_buffer_usage();
    (!state.is_buffer_state() || !usage.contains(required)).then(|| Violation::IllegalState {
        resource: ResourceId::Buffer(key),
        state,
        usage: format!("{:?}", usage),
    })
}

/// A texture may only enter states its usage flags allow
pub fn check_texture_state(key: TextureKey, usage: TextureUsage, state: ResourceState) -> Option<Violation> {
    let required = state.required_texture_usage();
    (!state.is_texture_state() || !usage.contains(required)).then(|| Violation::IllegalState {
        resource: ResourceId::Texture(key),
        state,
        usage: format!("{:?}", usage),
    })
}

/// Pure replay of a transition sequence.
///
/// For every resource, the `new` state of each transition must equal the
/// asserted `old` state of the next transition on the same resource. The first
/// transition of a resource is trusted.
pub fn replay_transitions<I>(transitions: I) -> Vec<Violation>
where
    I: IntoIterator<Item = (ResourceId, ResourceState, ResourceState)>,
{
    let mut last: HashMap<ResourceId, ResourceState> = HashMap::new();
    let mut violations = Vec::new();
    for (resource, old, new) in transitions {
        if let Some(&actual) = last.get(&resource) {
            if !transition_matches(old, actual) {
                violations.push(Violation::TransitionMismatch {
                    resource,
                    asserted: old,
                    actual,
                });
            }
        }
        last.insert(resource, new);
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn texture_ids(n: usize) -> Vec<ResourceId> {
        let mut arena: SlotMap<TextureKey, ()> = SlotMap::with_key();
        (0..n).map(|_| ResourceId::Texture(arena.insert(()))).collect()
    }

    #[test]
    fn replay_accepts_a_well_formed_frame() {
        let ids = texture_ids(1);
        let image = ids[0];
        let seq = [
            (image, ResourceState::Present, ResourceState::ColorAttachment),
            (image, ResourceState::ColorAttachment, ResourceState::Present),
            (image, ResourceState::Present, ResourceState::ColorAttachment),
            (image, ResourceState::ColorAttachment, ResourceState::Present),
        ];
        assert!(replay_transitions(seq).is_empty());
    }

    #[test]
    fn replay_flags_a_skipped_edge() {
        let ids = texture_ids(2);
        let (a, b) = (ids[0], ids[1]);
        let seq = [
            (a, ResourceState::Present, ResourceState::ColorAttachment),
            (b, ResourceState::TransferDst, ResourceState::SampledImage),
            // skipped ColorAttachment -> Present
            (a, ResourceState::Present, ResourceState::ColorAttachment),
        ];
        let violations = replay_transitions(seq);
        assert_eq!(
            violations,
            vec![Violation::TransitionMismatch {
                resource: a,
                asserted: ResourceState::Present,
                actual: ResourceState::ColorAttachment,
            }]
        );
    }

    #[test]
    fn undefined_old_state_only_matches_a_fresh_resource() {
        let ids = texture_ids(1);
        let seq = [
            (ids[0], ResourceState::Undefined, ResourceState::TransferDst),
            (ids[0], ResourceState::Undefined, ResourceState::ColorAttachment),
        ];
        assert_eq!(
            replay_transitions(seq),
            vec![Violation::TransitionMismatch {
                resource: ids[0],
                asserted: ResourceState::Undefined,
                actual: ResourceState::TransferDst,
            }]
        );
    }

    #[test]
    fn tracker_rejects_undefined_after_a_transition() {
        let ids = texture_ids(1);
        let mut tracker = StateTracker::new();
        tracker.register(ids[0], ResourceState::Undefined);
        let first = TrackedOp::Transition {
            resource: ids[0],
            old: ResourceState::Undefined,
            new: ResourceState::TransferDst,
        };
        assert_eq!(tracker.apply(&first), None);
        let second = TrackedOp::Transition {
            resource: ids[0],
            old: ResourceState::Undefined,
            new: ResourceState::ColorAttachment,
        };
        assert!(matches!(
            tracker.apply(&second),
            Some(Violation::TransitionMismatch {
                actual: ResourceState::TransferDst,
                ..
            })
        ));
        assert_eq!(tracker.state(ids[0]), Some(ResourceState::ColorAttachment));
    }

    #[test]
    fn tracker_checks_use_against_state() {
        let ids = texture_ids(1);
        let mut tracker = StateTracker::new();
        tracker.register(ids[0], ResourceState::TransferDst);

        let use_op = TrackedOp::Use {
            resource: ids[0],
            access: Access::SampledRead,
            operation: "draw",
        };
        assert!(matches!(tracker.apply(&use_op), Some(Violation::InvalidUse { .. })));

        tracker.apply(&TrackedOp::Transition {
            resource: ids[0],
            old: ResourceState::TransferDst,
            new: ResourceState::SampledImage,
        });
        assert_eq!(tracker.apply(&use_op), None);
        assert_eq!(tracker.violations().len(), 1);
    }

    #[test]
    fn buffers_in_undefined_accept_first_use() {
        let mut arena: SlotMap<BufferKey, ()> = SlotMap::with_key();
        let buffer = ResourceId::Buffer(arena.insert(()));
        let mut tracker = StateTracker::new();
        tracker.register(buffer, ResourceState::Undefined);
        let op = TrackedOp::Use {
            resource: buffer,
            access: Access::VertexInput,
            operation: "draw",
        };
        assert_eq!(tracker.apply(&op), None);
    }

    #[test]
    fn forgotten_resources_are_unknown() {
        let ids = texture_ids(1);
        let mut tracker = StateTracker::new();
        tracker.register(ids[0], ResourceState::Present);
        tracker.forget(ids[0]);
        let op = TrackedOp::Transition {
            resource: ids[0],
            old: ResourceState::Present,
            new: ResourceState::ColorAttachment,
        };
        assert!(matches!(tracker.apply(&op), Some(Violation::UnknownResource { .. })));
    }

    #[test]
    fn usage_flags_gate_states() {
        let mut arena: SlotMap<TextureKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        assert!(check_texture_state(key, TextureUsage::SAMPLED_IMAGE, ResourceState::SampledImage).is_none());
        assert!(check_texture_state(key, TextureUsage::SAMPLED_IMAGE, ResourceState::ColorAttachment).is_some());
        // buffer-only state on a texture
        assert!(check_texture_state(key, TextureUsage::all(), ResourceState::VertexBuffer).is_some());
    }
}
