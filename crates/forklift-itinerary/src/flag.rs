//! Step flags and predicates

use std::ops::{BitAnd, BitOr, BitOrAssign};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A bitmask of step conditions
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(transparent)]
pub struct Flag(pub u32);

impl Flag {
    /// No bits
    pub const NONE: Flag = Flag(0);
    /// The VM has a pre-migration hook
    pub const HAS_PRE_HOOK: Flag = Flag(0x001);
    /// The VM has a post-migration hook
    pub const HAS_POST_HOOK: Flag = Flag(0x002);
    /// The guest must be converted before it can boot on KubeVirt
    pub const REQUIRES_CONVERSION: Flag = Flag(0x004);
    /// Disks are copied by populator workers
    pub const CDI_DISK_COPY: Flag = Flag(0x008);
    /// Disks are copied by the guest converter (OVA)
    pub const VIRT_V2V_DISK_COPY: Flag = Flag(0x010);
    /// Disks arrive as OpenStack images needing format conversion
    pub const OPENSTACK_IMAGE: Flag = Flag(0x020);
    /// The source is vSphere
    pub const VSPHERE: Flag = Flag(0x040);
    /// The source supports snapshot-based change tracking
    pub const NEEDS_SNAPSHOT: Flag = Flag(0x080);
    /// Run preflight inspection
    pub const RUN_PREFLIGHT: Flag = Flag(0x100);

    /// Whether no bits are set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`
    pub fn contains(&self, other: Flag) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clear the bits of `other`
    pub fn without(self, other: Flag) -> Flag {
        Flag(self.0 & !other.0)
    }

    /// Iterate the individual bits that are set
    pub fn bits(self) -> impl Iterator<Item = Flag> {
        (0..u32::BITS)
            .map(|i| 1u32 << i)
            .filter(move |b| self.0 & b != 0)
            .map(Flag)
    }
}

impl BitOr for Flag {
    type Output = Flag;

    fn bitor(self, rhs: Flag) -> Flag {
        Flag(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flag {
    fn bitor_assign(&mut self, rhs: Flag) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flag {
    type Output = Flag;

    fn bitand(self, rhs: Flag) -> Flag {
        Flag(self.0 & rhs.0)
    }
}

/// Evaluates individual flag bits for a VM.
///
/// Implementations must be pure: the itinerary calls `evaluate` repeatedly
/// and expects the same answer each time.
pub trait Predicate {
    /// Whether the single-bit `flag` holds
    fn evaluate(&self, flag: Flag) -> bool;
}

/// A precomputed flag bitmap is the canonical predicate
impl Predicate for Flag {
    fn evaluate(&self, flag: Flag) -> bool {
        self.contains(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_operations() {
        let flags = Flag::HAS_PRE_HOOK | Flag::CDI_DISK_COPY;
        assert!(flags.contains(Flag::HAS_PRE_HOOK));
        assert!(!flags.contains(Flag::HAS_POST_HOOK));
        assert!(flags.contains(Flag::NONE));
        assert_eq!(flags.without(Flag::HAS_PRE_HOOK), Flag::CDI_DISK_COPY);
        assert_eq!(
            flags.bits().collect::<Vec<_>>(),
            vec![Flag::HAS_PRE_HOOK, Flag::CDI_DISK_COPY]
        );
    }

    #[test]
    fn flag_bitmap_is_a_predicate() {
        let flags = Flag::VSPHERE | Flag::REQUIRES_CONVERSION;
        assert!(flags.evaluate(Flag::VSPHERE));
        assert!(!flags.evaluate(Flag::OPENSTACK_IMAGE));
    }
}
