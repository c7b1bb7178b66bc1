use crate::registrar::ProbeHandle;
use std::fmt;

/// Fingerprint reserved for the base program itself.
///
/// The base program is always resolvable (its probes use absolute addresses,
/// i.e. a load base of zero) and is never subject to module arrive/depart
/// events.
pub const BASE_PROGRAM_FINGERPRINT: u32 = 0;

/// Computes the fingerprint identifying a probe's target module.
///
/// `None` means the base program and maps to [`BASE_PROGRAM_FINGERPRINT`].
/// A named module is identified by the CRC32 of its name bytes: a stable,
/// deterministic, collision-tolerant identity that stays valid while the
/// module itself is not loaded. Collisions between module names are an
/// accepted tradeoff of this scheme, not a security property.
pub fn module_fingerprint(module_name: Option<&str>) -> u32 {
    match module_name {
        None => BASE_PROGRAM_FINGERPRINT,
        Some(name) => crc32fast::hash(name.as_bytes()),
    }
}

/// One instrumentation request and its current resolution state.
///
/// A record lives in exactly one of the tracker's three collections at any
/// time (deferred table, pending set, hit queue); moving it between them is
/// an ownership transfer, so a record can never be observed from two places
/// at once.
#[derive(Debug)]
pub struct ProbeRecord {
    /// Identity of the target module; [`BASE_PROGRAM_FINGERPRINT`] for the
    /// base program.
    pub(crate) fingerprint: u32,
    /// Load base of the target module. Zero while the record is deferred
    /// (and, coincidentally, for the base program).
    pub(crate) base_address: u64,
    /// Address to instrument, relative to `base_address` once known.
    pub(crate) offset: u64,
    /// Handle into the registrar once the probe is armed; `None` while
    /// deferred.
    pub(crate) handle: Option<ProbeHandle>,
    /// Clear-barrier tag: the tracker generation this record was armed in.
    /// A fire completion from an older generation is dropped instead of
    /// resurrecting a cleared record.
    pub(crate) generation: u64,
}

impl ProbeRecord {
    /// Creates a record for a target whose module is not currently present.
    pub(crate) fn deferred(fingerprint: u32, offset: u64) -> Self {
        Self {
            fingerprint,
            base_address: 0,
            offset,
            handle: None,
            generation: 0,
        }
    }

    /// Creates a record whose target is resolvable right away.
    pub(crate) fn resolved(fingerprint: u32, base_address: u64, offset: u64) -> Self {
        Self {
            fingerprint,
            base_address,
            offset,
            handle: None,
            generation: 0,
        }
    }

    /// Resolves a deferred record against the base address its module was
    /// just loaded at.
    pub(crate) fn resolve(&mut self, base_address: u64) {
        self.base_address = base_address;
    }

    /// The absolute address to instrument. Wraps on overflow, matching the
    /// unsigned arithmetic of the address space.
    pub(crate) fn target_address(&self) -> u64 {
        self.base_address.wrapping_add(self.offset)
    }

    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Converts a consumed record into the value handed to the readout
    /// surface. Only the module-relative offset is reported, never a live
    /// absolute address.
    pub(crate) fn into_hit(self) -> HitRecord {
        HitRecord {
            fingerprint: self.fingerprint,
            offset: self.offset,
        }
    }
}

/// A fired probe as delivered to a consumer: the target module's fingerprint
/// and the module-relative offset that was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitRecord {
    pub fingerprint: u32,
    pub offset: u64,
}

impl HitRecord {
    /// Serializes the record in the readout wire format: an 8-hex-digit
    /// fingerprint and a 16-hex-digit relative offset, newline terminated.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "0x{:08x}:0x{:016x}", self.fingerprint, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_program_maps_to_reserved_fingerprint() {
        assert_eq!(module_fingerprint(None), BASE_PROGRAM_FINGERPRINT);
    }

    #[test]
    fn module_fingerprint_is_stable_and_name_sensitive() {
        let a = module_fingerprint(Some("mymod"));
        let b = module_fingerprint(Some("mymod"));
        let c = module_fingerprint(Some("othermod"));
        assert_eq!(a, b, "Same name must always produce the same fingerprint");
        assert_ne!(a, c, "Different names should produce different fingerprints");
        assert_ne!(
            a, BASE_PROGRAM_FINGERPRINT,
            "A named module must not collide with the base-program sentinel"
        );
    }

    #[test]
    fn deferred_record_resolves_to_absolute_target() {
        let mut record = ProbeRecord::deferred(module_fingerprint(Some("mymod")), 0x10);
        assert_eq!(record.target_address(), 0x10, "Unresolved base is zero");

        record.resolve(0x1000);
        assert_eq!(
            record.target_address(),
            0x1010,
            "Target must be base + offset after resolution"
        );
        assert_eq!(record.offset(), 0x10, "Relative offset must be preserved");
    }

    #[test]
    fn target_address_wraps_instead_of_overflowing() {
        let record = ProbeRecord::resolved(0, u64::MAX, 2);
        assert_eq!(record.target_address(), 1);
    }

    #[test]
    fn hit_record_renders_readout_wire_format() {
        let hit = HitRecord {
            fingerprint: 0xdeadbeef,
            offset: 0x10,
        };
        assert_eq!(hit.render(), "0xdeadbeef:0x0000000000000010\n");

        let base = HitRecord {
            fingerprint: BASE_PROGRAM_FINGERPRINT,
            offset: 0xffff_ffff_ffff_ffff,
        };
        assert_eq!(base.render(), "0x00000000:0xffffffffffffffff\n");
    }
}
