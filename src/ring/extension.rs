//! Extension registry and the alignment-first slot packer.

use std::marker::PhantomData;

use crate::errors::{Error, Result};
use crate::util::align_up;

use super::element::RingExtension;

/// Extensions larger than this are a programming error.
pub const MAX_EXTENSION_SIZE: usize = 256;

/// Every slot stride is a multiple of this.
pub const RING_MIN_ALIGNMENT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Packet,
    Fragment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub name: &'static str,
    pub version: u32,
    pub size: usize,
    pub alignment: usize,
    pub kind: ExtensionKind,
}

#[derive(Default, Clone, Debug)]
pub struct ExtensionRegistry {
    specs: Vec<ExtensionSpec>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ExtensionSpec) -> Result<()> {
        if !spec.alignment.is_power_of_two() {
            return Err(Error::InvalidParameter("extension alignment is not a power of two"));
        }
        assert!(
            spec.size <= MAX_EXTENSION_SIZE,
            "extension {} v{} is {} bytes, maximum is {MAX_EXTENSION_SIZE}",
            spec.name,
            spec.version,
            spec.size
        );
        if self.specs.iter().any(|s| {
            s.name == spec.name && s.version == spec.version && s.kind == spec.kind
        }) {
            return Ok(());
        }
        self.specs.push(spec);
        Ok(())
    }

    pub fn register_type<X: RingExtension>(&mut self) -> Result<()> {
        self.register(X::spec())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Lays out every extension of `kind` after `base_offset`.
    ///
    /// The unplaced extension with the largest alignment goes first, at the
    /// next offset satisfying its alignment. Ties go to the larger extension,
    /// then to the name, so the result does not depend on registration order.
    pub fn pack(&self, kind: ExtensionKind, base_offset: usize) -> ExtensionLayout {
        let mut pending: Vec<&ExtensionSpec> =
            self.specs.iter().filter(|s| s.kind == kind).collect();
        pending.sort_by(|a, b| {
            b.alignment
                .cmp(&a.alignment)
                .then(b.size.cmp(&a.size))
                .then(a.name.cmp(b.name))
                .then(a.version.cmp(&b.version))
        });

        let mut offset = base_offset;
        let mut max_alignment = RING_MIN_ALIGNMENT;
        let mut entries = Vec::with_capacity(pending.len());
        for spec in pending {
            offset = align_up(offset, spec.alignment);
            entries.push(AssignedExtension {
                spec: *spec,
                offset,
            });
            offset += spec.size;
            max_alignment = max_alignment.max(spec.alignment);
        }
        let end = align_up(offset, RING_MIN_ALIGNMENT);

        ExtensionLayout {
            kind,
            base_offset,
            size: end - base_offset,
            max_alignment,
            entries,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssignedExtension {
    pub spec: ExtensionSpec,
    pub offset: usize,
}

/// Result of packing: assigned offsets are relative to the start of a slot.
#[derive(Clone, Debug)]
pub struct ExtensionLayout {
    kind: ExtensionKind,
    base_offset: usize,
    size: usize,
    max_alignment: usize,
    entries: Vec<AssignedExtension>,
}

impl ExtensionLayout {
    pub fn empty(kind: ExtensionKind, base_offset: usize) -> Self {
        ExtensionRegistry::new().pack(kind, base_offset)
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Bytes taken by the extensions, rounded to [`RING_MIN_ALIGNMENT`].
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_alignment(&self) -> usize {
        self.max_alignment
    }

    pub fn entries(&self) -> &[AssignedExtension] {
        &self.entries
    }

    /// Highest registered version of `name` that is at least `min_version`.
    pub fn find(&self, name: &str, min_version: u32) -> Option<&AssignedExtension> {
        self.entries
            .iter()
            .filter(|e| e.spec.name == name && e.spec.version >= min_version)
            .max_by_key(|e| e.spec.version)
    }

    pub fn get<X: RingExtension>(&self) -> Option<Extension<X>> {
        if X::KIND != self.kind {
            return None;
        }
        let assigned = self.find(X::NAME, X::VERSION)?;
        if assigned.spec.size < std::mem::size_of::<X>()
            || assigned.spec.alignment < std::mem::align_of::<X>()
        {
            return None;
        }
        Some(Extension {
            offset: assigned.offset,
            _marker: PhantomData,
        })
    }
}

/// Typed handle to an extension's offset inside a slot.
pub struct Extension<X> {
    offset: usize,
    _marker: PhantomData<fn() -> X>,
}

impl<X> Extension<X> {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<X> Clone for Extension<X> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<X> Copy for Extension<X> {}

impl<X> std::fmt::Debug for Extension<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::element::{NetPacketGso, NetPacketTxChecksum};

    fn spec(name: &'static str, size: usize, alignment: usize) -> ExtensionSpec {
        ExtensionSpec {
            name,
            version: 1,
            size,
            alignment,
            kind: ExtensionKind::Packet,
        }
    }

    #[test]
    fn packs_largest_alignment_first() {
        let mut registry = ExtensionRegistry::new();
        registry.register(spec("big", 64, 8)).unwrap();
        registry.register(spec("mid", 16, 4)).unwrap();
        registry.register(spec("small", 8, 8)).unwrap();

        let layout = registry.pack(ExtensionKind::Packet, 0);
        assert_eq!(layout.find("big", 1).unwrap().offset, 0);
        assert_eq!(layout.find("small", 1).unwrap().offset, 64);
        assert_eq!(layout.find("mid", 1).unwrap().offset, 72);
        assert_eq!(layout.size(), 88);
    }

    #[test]
    fn packing_ignores_registration_order() {
        let specs = [spec("big", 64, 8), spec("mid", 16, 4), spec("small", 8, 8)];
        let mut forward = ExtensionRegistry::new();
        let mut backward = ExtensionRegistry::new();
        for s in specs {
            forward.register(s).unwrap();
        }
        for s in specs.iter().rev() {
            backward.register(*s).unwrap();
        }
        let a = forward.pack(ExtensionKind::Packet, 16);
        let b = backward.pack(ExtensionKind::Packet, 16);
        assert_eq!(a.size(), b.size());
        assert_eq!(a.entries(), b.entries());
    }

    #[test]
    fn rounds_to_ring_alignment() {
        let mut registry = ExtensionRegistry::new();
        registry.register(spec("odd", 3, 1)).unwrap();
        let layout = registry.pack(ExtensionKind::Packet, 16);
        assert_eq!(layout.find("odd", 1).unwrap().offset, 16);
        assert_eq!(layout.size(), 8);
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let mut registry = ExtensionRegistry::new();
        assert!(matches!(
            registry.register(spec("bad", 8, 3)),
            Err(Error::InvalidParameter(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic]
    fn oversized_extension_is_fatal() {
        let mut registry = ExtensionRegistry::new();
        let _ = registry.register(spec("huge", MAX_EXTENSION_SIZE + 1, 8));
    }

    #[test]
    fn lookup_matches_minimum_version() {
        let mut registry = ExtensionRegistry::new();
        registry.register(spec("csum", 4, 4)).unwrap();
        registry
            .register(ExtensionSpec {
                version: 3,
                ..spec("csum", 8, 4)
            })
            .unwrap();
        let layout = registry.pack(ExtensionKind::Packet, 0);
        assert_eq!(layout.find("csum", 1).unwrap().spec.version, 3);
        assert_eq!(layout.find("csum", 3).unwrap().spec.version, 3);
        assert!(layout.find("csum", 4).is_none());
        assert_eq!(layout.entries().len(), 2);
    }

    #[test]
    fn typed_lookup_checks_kind() {
        let mut registry = ExtensionRegistry::new();
        registry.register_type::<NetPacketGso>().unwrap();
        let packets = registry.pack(ExtensionKind::Packet, 16);
        let fragments = registry.pack(ExtensionKind::Fragment, 24);
        assert!(packets.get::<NetPacketGso>().is_some());
        assert!(packets.get::<NetPacketTxChecksum>().is_none());
        assert!(fragments.get::<NetPacketGso>().is_none());
    }
}
