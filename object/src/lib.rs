mod header;
mod objects;
mod type_info;
mod value;

pub use header::{
    CONST_MARK_BIT, DUAL_MARKBITS, DUAL_MARKBITS_MASK, Header, InfoTag,
    MarkParity,
};
pub use objects::{
    ArrayHeader, RefSlots, init_array, init_object, object_size, ref_slots, referent_slot,
};
pub use type_info::{ReferenceKind, TypeBuilder, TypeError, TypeFlags, TypeInfo};
pub use value::{OBJECT_ALIGNMENT, ObjRef, align_object_size};

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned scratch memory for building objects outside a heap.
    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    fn pair_type() -> &'static TypeInfo {
        TypeBuilder::object("Pair").fields(2, 1).leak().unwrap()
    }

    // ── ObjRef ─────────────────────────────────────────────────────

    #[test]
    fn null_ref() {
        assert!(ObjRef::NULL.is_null());
        assert_eq!(ObjRef::NULL.addr(), 0);
        assert_eq!(format!("{:?}", ObjRef::NULL), "Null");
    }

    #[test]
    fn align_sizes() {
        assert_eq!(align_object_size(1), 8);
        assert_eq!(align_object_size(16), 16);
        assert_eq!(align_object_size(17), 24);
    }

    // ── TypeInfo ───────────────────────────────────────────────────

    #[test]
    fn object_type_layout() {
        let ty = pair_type();
        assert_eq!(ty.instance_size(), 16 + 3 * 8);
        assert_eq!(ty.ref_offsets(), &[16, 24]);
        assert!(ty.has_refs());
        assert!(!ty.is_array());
    }

    #[test]
    fn type_without_refs_has_no_ref_flag() {
        let ty = TypeBuilder::object("Box").fields(0, 2).build().unwrap();
        assert!(!ty.has_refs());
        assert_eq!(ty.instance_size(), 32);
    }

    #[test]
    fn rejects_out_of_bounds_offset() {
        let err = TypeBuilder::object("Bad")
            .instance_size(24)
            .ref_field(24)
            .build()
            .unwrap_err();
        assert_eq!(err, TypeError::OffsetOutOfBounds(24));

        let err = TypeBuilder::object("Bad")
            .instance_size(32)
            .ref_field(8)
            .build()
            .unwrap_err();
        assert_eq!(err, TypeError::OffsetOutOfBounds(8));
    }

    #[test]
    fn rejects_misaligned_offset() {
        let err = TypeBuilder::object("Bad")
            .instance_size(40)
            .ref_field(20)
            .build()
            .unwrap_err();
        assert_eq!(err, TypeError::MisalignedOffset(20));
    }

    #[test]
    fn array_sizes() {
        let refs = TypeBuilder::array("Object[]", 0, true).build().unwrap();
        assert!(refs.is_ref_array());
        assert_eq!(refs.array_size(0), 24);
        assert_eq!(refs.array_size(3), 24 + 24);

        let bytes = TypeBuilder::array("byte[]", 1, false).build().unwrap();
        assert!(bytes.is_primitive_array());
        assert_eq!(bytes.array_size(1), 32);
        assert_eq!(bytes.array_size(8), 32);
        assert_eq!(bytes.array_size(9), 40);
    }

    #[test]
    fn type_info_is_aligned_for_mark_bit() {
        assert!(align_of::<TypeInfo>() >= 8);
    }

    // ── Header protocol ────────────────────────────────────────────

    #[test]
    fn vt_mark_round_trip() {
        let h = Header::new(pair_type());
        assert!(!h.is_marked_in_vt());
        assert!(h.mark_in_vt());
        assert!(!h.mark_in_vt(), "second mark must report already marked");
        assert!(h.is_marked_in_vt());
        assert_eq!(h.type_info().name(), "Pair");
        h.unmark_in_vt();
        assert!(!h.is_marked_in_vt());
    }

    #[test]
    fn info_bits_survive_engine_updates() {
        let h = Header::new(pair_type());
        let parity = MarkParity::INITIAL;
        h.mark_in_info(parity);
        h.set_info(0xabc0);
        assert_eq!(h.info(), 0xabc0);
        assert!(h.is_marked_in_info(parity));
    }

    #[test]
    fn forwarding_requires_both_bits() {
        let h = Header::new(pair_type());
        let dest = ObjRef::from_addr(0x1000);
        assert!(!h.is_moved());
        h.set_forwarding(dest);
        assert!(h.is_moved());
        assert_eq!(h.forwarding(), dest);
        assert_eq!(h.tag(MarkParity::INITIAL), InfoTag::Forwarded(dest));
    }

    #[test]
    fn stale_mark_reads_as_forward_bit_but_not_moved() {
        let h = Header::new(pair_type());
        let cycle0 = MarkParity::for_cycle(0);
        let cycle1 = MarkParity::for_cycle(1);

        assert!(h.mark_in_info(cycle0));
        // Next cycle the old mark bit is this cycle's forward bit.
        assert!(h.is_forward_bit_set(cycle1));
        assert!(!h.is_moved(), "stale mark must not look forwarded");
        assert_eq!(h.tag(cycle1), InfoTag::Unmarked);
    }

    #[test]
    fn marking_clears_stale_bit() {
        let h = Header::new(pair_type());
        h.mark_in_info(MarkParity::for_cycle(0));
        assert!(h.mark_in_info(MarkParity::for_cycle(1)));
        assert!(!h.is_moved());
        assert_eq!(h.info_raw() & DUAL_MARKBITS, MarkParity::for_cycle(1).mark_bit());
    }

    #[test]
    fn mark_interpretation_alternates_with_parity() {
        let h = Header::new(pair_type());
        for cycle in 0..8 {
            let parity = MarkParity::for_cycle(cycle);
            assert_eq!(parity.mark_bit(), MarkParity::for_cycle(cycle + 2).mark_bit());
            assert_ne!(parity.mark_bit(), parity.forward_bit());

            // Marked last cycle: never counts as marked now.
            assert!(!h.is_marked_in_info(parity), "cycle {cycle}");
            assert!(h.mark_in_info(parity));
            assert!(h.is_marked_in_info(parity));
            assert!(!h.is_moved());
        }
    }

    #[test]
    #[should_panic(expected = "illegal forwarding pointer")]
    fn rejects_null_forwarding() {
        let h = Header::new(pair_type());
        // Forge a header that has both bits but no address.
        h.set_info(0);
        let raw = &h as *const Header as *mut usize;
        unsafe { raw.add(1).write(DUAL_MARKBITS) };
        let _ = h.forwarding();
    }

    #[test]
    fn losing_claim_sees_winners_copy() {
        let h = Header::new(pair_type());
        let parity = MarkParity::INITIAL;
        let seen = h.info_raw();
        let first = ObjRef::from_addr(0x1000);

        assert_eq!(h.try_forward(seen, first), Ok(()));
        let lost = h.try_forward(seen, ObjRef::from_addr(0x2000)).unwrap_err();
        assert_eq!(InfoTag::of(lost, parity), InfoTag::Forwarded(first));
        assert!(h.try_mark_in_info(seen, parity).is_err(), "forwarded objects stay forwarded");
        assert_eq!(h.forwarding(), first);
    }

    #[test]
    fn claim_by_marking_blocks_forwarding() {
        let h = Header::new(pair_type());
        let parity = MarkParity::for_cycle(1);
        let seen = h.info_raw();

        assert_eq!(h.try_mark_in_info(seen, parity), Ok(()));
        let lost = h.try_forward(seen, ObjRef::from_addr(0x1000)).unwrap_err();
        assert_eq!(InfoTag::of(lost, parity), InfoTag::Marked);
        assert!(!h.is_moved());
    }

    #[test]
    fn copied_header_drops_gc_bits() {
        let h = Header::new(pair_type());
        h.mark_in_vt();
        h.set_info(0x40);
        let info = h.info_raw();
        let mut dest = std::mem::MaybeUninit::<Header>::uninit();
        unsafe { h.copy_to(dest.as_mut_ptr(), info | 0b01) };
        let copy = unsafe { dest.assume_init() };
        assert!(!copy.is_marked_in_vt());
        assert_eq!(copy.info_raw(), 0x40);
        assert_eq!(copy.type_info().name(), "Pair");
    }

    #[test]
    fn referent_is_not_a_traced_slot() {
        let ty = TypeBuilder::object("WeakRef")
            .fields(1, 0)
            .referent(ReferenceKind::Weak)
            .leak()
            .unwrap();
        assert_eq!(ty.instance_size(), 32);
        assert_eq!(ty.ref_offsets(), &[16]);
        assert_eq!(ty.referent_offset(), Some(24));
        assert!(ty.is_reference());

        let mut mem = scratch(4);
        let obj = unsafe { init_object(mem.as_mut_ptr().cast(), ty, 32) };
        assert_eq!(unsafe { ref_slots(obj) }.count(), 1);
        assert_eq!(unsafe { referent_slot(obj) }, Some(obj.slot(24)));
        assert_eq!(unsafe { referent_slot(obj) }.map(|s| unsafe { *s }), Some(ObjRef::NULL));
    }

    #[test]
    fn arrays_cannot_be_references() {
        let err = TypeBuilder::array("Weak[]", 8, true)
            .referent(ReferenceKind::Soft)
            .build()
            .unwrap_err();
        assert_eq!(err, TypeError::ArrayReferent);
        assert_eq!(ReferenceKind::from_code(ReferenceKind::Phantom.code()), ReferenceKind::Phantom);
    }

    // ── Objects ────────────────────────────────────────────────────

    #[test]
    fn init_object_zeroes_fields() {
        let ty = pair_type();
        let mut mem = scratch(ty.instance_size() / 8);
        mem.iter_mut().for_each(|w| *w = u64::MAX);
        let obj = unsafe { init_object(mem.as_mut_ptr().cast(), ty, ty.instance_size()) };

        let slots: Vec<_> = unsafe { ref_slots(obj) }.collect();
        assert_eq!(slots.len(), 2);
        for slot in slots {
            assert!(unsafe { *slot }.is_null());
        }
        assert_eq!(unsafe { object_size(obj) }, 40);
    }

    #[test]
    fn ref_array_yields_every_element() {
        let ty = TypeBuilder::array("Object[]", 0, true).leak().unwrap();
        let mut mem = scratch(ty.array_size(5) / 8);
        let obj = unsafe { init_array(mem.as_mut_ptr().cast(), ty, 5) };

        assert_eq!(unsafe { ArrayHeader::length_of(obj) }, 5);
        let slots: Vec<_> = unsafe { ref_slots(obj) }.collect();
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[0] as usize, obj.addr() + ArrayHeader::SIZE);
        assert_eq!(slots[4] as usize - slots[3] as usize, 8);
    }

    #[test]
    fn primitive_array_has_no_slots() {
        let ty = TypeBuilder::array("int[]", 4, false).leak().unwrap();
        let mut mem = scratch(ty.array_size(7) / 8);
        let obj = unsafe { init_array(mem.as_mut_ptr().cast(), ty, 7) };
        assert_eq!(unsafe { ref_slots(obj) }.count(), 0);
        assert_eq!(unsafe { object_size(obj) }, 24 + 32);
    }
}
