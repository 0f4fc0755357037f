//! Capability set advertised by a source adapter

use std::fmt;
use std::ops::BitOr;

/// Capabilities of a source adapter
///
/// Control bits name operations; trait bits describe how disks reach the
/// destination and whether the guest needs conversion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u32);

impl Capabilities {
    /// No capability
    pub const NONE: Self = Self(0);
    /// Enumerate VMs
    pub const LIST_VMS: Self = Self(1 << 0);
    /// Describe a VM
    pub const INSPECT: Self = Self(1 << 1);
    /// Stop a VM
    pub const POWER_OFF: Self = Self(1 << 2);
    /// Start a VM
    pub const POWER_ON: Self = Self(1 << 3);
    /// Take a snapshot
    pub const SNAPSHOT: Self = Self(1 << 4);
    /// Remove a snapshot
    pub const REMOVE_SNAPSHOT: Self = Self(1 << 5);
    /// Changed-block lists between snapshots
    pub const CHANGES: Self = Self(1 << 6);
    /// Open a disk for reading
    pub const OPEN_DISK: Self = Self(1 << 7);

    /// Guest needs conversion for KubeVirt
    pub const REQUIRES_CONVERSION: Self = Self(1 << 16);
    /// The conversion worker copies disks itself
    pub const CONVERTER_COPIES_DISKS: Self = Self(1 << 17);
    /// Disks arrive as images rather than block devices
    pub const IMAGE_BASED: Self = Self(1 << 18);

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Warm migration requires snapshots, their removal, and change lists
    pub const fn supports_warm(self) -> bool {
        self.contains(Self(
            Self::SNAPSHOT.0 | Self::REMOVE_SNAPSHOT.0 | Self::CHANGES.0,
        ))
    }

    /// Guest needs conversion
    pub const fn requires_conversion(self) -> bool {
        self.contains(Self::REQUIRES_CONVERSION)
    }

    /// Conversion worker copies disks
    pub const fn converter_copies_disks(self) -> bool {
        self.contains(Self::CONVERTER_COPIES_DISKS)
    }

    /// Image based transfer
    pub const fn image_based(self) -> bool {
        self.contains(Self::IMAGE_BASED)
    }

    const NAMES: [(Self, &'static str); 11] = [
        (Self::LIST_VMS, "ListVMs"),
        (Self::INSPECT, "Inspect"),
        (Self::POWER_OFF, "PowerOff"),
        (Self::POWER_ON, "PowerOn"),
        (Self::SNAPSHOT, "Snapshot"),
        (Self::REMOVE_SNAPSHOT, "RemoveSnapshot"),
        (Self::CHANGES, "Changes"),
        (Self::OPEN_DISK, "OpenDisk"),
        (Self::REQUIRES_CONVERSION, "RequiresConversion"),
        (Self::CONVERTER_COPIES_DISKS, "ConverterCopiesDisks"),
        (Self::IMAGE_BASED, "ImageBased"),
    ];
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(c, _)| self.contains(*c))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}
