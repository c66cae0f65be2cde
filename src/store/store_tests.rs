use super::*;
use crate::descriptor::rights::{KEY_ALL_ACCESS, KEY_READ, KEY_SET_VALUE};
use crate::descriptor::{codec, Ace, Acl, Sid};

fn hive() -> (Hive, NodeHandle) {
    let hive = Hive::new(StoreConfig::default());
    let root = hive.create_root().unwrap();
    (hive, root)
}

fn only_system() -> Descriptor {
    Descriptor {
        owner: Some(Sid::local_system()),
        group: Some(Sid::local_system()),
        dacl: Some(Acl { aces: vec![Ace::allowed(KEY_ALL_ACCESS, Sid::local_system())] }),
        sacl: None,
    }
}

#[test]
fn root_starts_with_private_cell_on_singleton_ring() {
    let (hive, root) = hive();
    assert_eq!(hive.security_ref_count(&root).unwrap(), 1);
    assert_eq!(hive.security_ring_len(&root).unwrap(), 1);
    assert_eq!(hive.live_security_cells(), 1);
    hive.verify_security().unwrap();
}

#[test]
fn inherited_descriptor_dedups_onto_parent_cell() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, None).unwrap();
    let b = hive.create_key(&root, CellType::Stable, None).unwrap();
    assert_eq!(hive.security_cell(&a).unwrap(), hive.security_cell(&root).unwrap());
    assert_eq!(hive.security_cell(&b).unwrap(), hive.security_cell(&root).unwrap());
    assert_eq!(hive.security_ref_count(&root).unwrap(), 3);
    assert_eq!(hive.live_security_cells(), 1);
    assert_eq!(hive.total_security_refs().unwrap(), 3);
    hive.verify_security().unwrap();
}

#[test]
fn distinct_descriptor_gets_its_own_ring_entry() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();
    assert_ne!(hive.security_cell(&a).unwrap(), hive.security_cell(&root).unwrap());
    assert_eq!(hive.live_security_cells(), 2);
    assert_eq!(hive.security_ring_len(&root).unwrap(), 2);
    hive.verify_security().unwrap();
}

#[test]
fn volatile_key_keeps_its_own_singleton_ring() {
    let (hive, root) = hive();
    let v = hive.create_key(&root, CellType::Volatile, None).unwrap();
    // Same bytes as the root, but volatile storage never dedups onto a
    // stable cell.
    assert_ne!(hive.security_cell(&v).unwrap(), hive.security_cell(&root).unwrap());
    assert_eq!(hive.security_ring_len(&v).unwrap(), 1);
    assert_eq!(hive.security_ring_len(&root).unwrap(), 1);
    assert_eq!(hive.live_security_cells(), 2);
    hive.verify_security().unwrap();
}

#[test]
fn identical_update_touches_only_the_write_time() {
    let (hive, root) = hive();
    let cell_before = hive.security_cell(&root).unwrap();
    let t0 = hive.last_write_time(&root).unwrap();
    hive.flush_dirty();

    hive.set_security(&root, FieldSet::ALL, &root_descriptor()).unwrap();
    assert_eq!(hive.security_cell(&root).unwrap(), cell_before);
    assert_eq!(hive.security_ref_count(&root).unwrap(), 1);
    assert_eq!(hive.security_ring_len(&root).unwrap(), 1);
    assert!(hive.last_write_time(&root).unwrap() >= t0);
    // Only the node cell picks up a dirty mark.
    assert_eq!(hive.flush_dirty(), 1);
    hive.verify_security().unwrap();
}

#[test]
fn update_adopts_existing_matching_cell() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();
    assert_eq!(hive.live_security_cells(), 2);

    // Rewriting the root to the same descriptor as `a` merges the cells;
    // the root's old private cell is freed.
    let old = hive.security_cell(&root).unwrap();
    hive.set_security(&root, FieldSet::ALL, &only_system()).unwrap();
    assert_eq!(hive.security_cell(&root).unwrap(), hive.security_cell(&a).unwrap());
    assert_eq!(hive.security_ref_count(&root).unwrap(), 2);
    assert_eq!(hive.live_security_cells(), 1);
    hive.with_arena(|cells| assert!(!cells.is_live(old)));
    hive.verify_security().unwrap();
}

#[test]
fn update_of_shared_cell_splits_off_private_copy() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, None).unwrap();
    assert_eq!(hive.security_ref_count(&root).unwrap(), 2);

    hive.set_security(&a, FieldSet::DACL, &only_system()).unwrap();
    assert_ne!(hive.security_cell(&a).unwrap(), hive.security_cell(&root).unwrap());
    assert_eq!(hive.security_ref_count(&root).unwrap(), 1);
    assert_eq!(hive.security_ref_count(&a).unwrap(), 1);
    assert_eq!(hive.live_security_cells(), 2);
    assert_eq!(hive.security_ring_len(&root).unwrap(), 2);
    assert_eq!(hive.total_security_refs().unwrap(), 2);
    hive.verify_security().unwrap();
}

#[test]
fn same_length_update_rewrites_in_place() {
    let (hive, root) = hive();
    let before = hive.security_cell(&root).unwrap();
    // Both SIDs have two sub-authorities, so the encoded length matches.
    let patch = Descriptor { owner: Some(Sid::new(5, &[32, 545])), ..Default::default() };
    hive.set_security(&root, FieldSet::OWNER, &patch).unwrap();

    assert_eq!(hive.security_cell(&root).unwrap(), before, "cell must not move");
    let owner_bytes = hive.query_security(&root, FieldSet::OWNER).unwrap();
    let owner = codec::parse(&owner_bytes).unwrap().owner;
    assert_eq!(owner, Some(Sid::new(5, &[32, 545])));

    // And again: still no move, no allocation, cache rehashed each time.
    let live = hive.with_arena(|cells| cells.live_count());
    let patch = Descriptor { owner: Some(Sid::new(5, &[32, 546])), ..Default::default() };
    hive.set_security(&root, FieldSet::OWNER, &patch).unwrap();
    assert_eq!(hive.security_cell(&root).unwrap(), before);
    assert_eq!(hive.with_arena(|cells| cells.live_count()), live);
    hive.verify_security().unwrap();
}

#[test]
fn resize_relocates_cell_and_ring_follows() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();
    let before = hive.security_cell(&a).unwrap();

    let bigger = Descriptor {
        dacl: Some(Acl {
            aces: vec![
                Ace::allowed(KEY_ALL_ACCESS, Sid::local_system()),
                Ace::allowed(KEY_READ, Sid::world()),
                Ace::allowed(KEY_READ, Sid::restricted()),
            ],
        }),
        ..Default::default()
    };
    hive.set_security(&a, FieldSet::DACL, &bigger).unwrap();
    assert_ne!(hive.security_cell(&a).unwrap(), before, "resize must relocate");
    assert!(hive.with_arena(|cells| !cells.is_live(before)));
    assert_eq!(hive.security_ring_len(&root).unwrap(), 2);
    assert_eq!(hive.security_ref_count(&a).unwrap(), 1);
    hive.verify_security().unwrap();
}

#[test]
fn delete_releases_descriptor_reference() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();
    assert_eq!(hive.live_security_cells(), 2);

    hive.delete_key(&a).unwrap();
    assert_eq!(hive.live_security_cells(), 1);
    assert_eq!(hive.security_ring_len(&root).unwrap(), 1);
    assert!(a.is_deleted());
    assert_eq!(hive.set_security(&a, FieldSet::ALL, &only_system()), Err(RegError::Deleted));
    assert_eq!(hive.query_security(&a, FieldSet::ALL), Err(RegError::Deleted));
    hive.verify_security().unwrap();
}

#[test]
fn delete_of_shared_referent_only_drops_one_reference() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, None).unwrap();
    assert_eq!(hive.security_ref_count(&root).unwrap(), 2);
    hive.delete_key(&a).unwrap();
    assert_eq!(hive.security_ref_count(&root).unwrap(), 1);
    assert_eq!(hive.live_security_cells(), 1);
    hive.verify_security().unwrap();
}

#[test]
fn delete_refuses_keys_with_subkeys() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, None).unwrap();
    let _b = hive.create_key(&a, CellType::Stable, None).unwrap();
    assert_eq!(hive.delete_key(&a), Err(RegError::NotEmpty));
    assert!(!a.is_deleted());
}

#[test]
fn check_access_consults_the_descriptor() {
    let (hive, root) = hive();
    let world = ActorContext::new(vec![Sid::world()]);
    let system = ActorContext::new(vec![Sid::local_system()]);

    assert!(hive.check_access(&root, &world, KEY_READ, LockContext::Acquire).is_ok());
    assert_eq!(
        hive.check_access(&root, &world, KEY_SET_VALUE, LockContext::Acquire),
        Err(RegError::Denied)
    );
    assert!(hive.check_access(&root, &system, KEY_ALL_ACCESS, LockContext::Acquire).is_ok());
    // Caller attesting to an exclusive hold takes the same decision.
    assert!(hive
        .check_access(&root, &world, KEY_READ, LockContext::CallerHoldsExclusive)
        .is_ok());
}

#[test]
fn subtree_check_short_circuits_on_denial() {
    let (hive, root) = hive();
    let open = hive.create_key(&root, CellType::Stable, None).unwrap();
    let _grand = hive.create_key(&open, CellType::Stable, None).unwrap();
    let secret = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();

    let world = ActorContext::new(vec![Sid::world()]);
    let system = ActorContext::new(vec![Sid::local_system()]);

    assert_eq!(hive.check_subtree_access(&root, &world, KEY_READ, true), Err(RegError::Denied));
    assert!(hive.check_subtree_access(&root, &system, KEY_READ, true).is_ok());
    assert!(hive.check_subtree_access(&open, &world, KEY_READ, true).is_ok());
    // Excluding the root skips its descriptor; the denying key is a leaf,
    // so a rootless walk over it sees nothing to refuse.
    assert_eq!(
        hive.check_subtree_access(&secret, &world, KEY_READ, true),
        Err(RegError::Denied)
    );
    assert!(hive.check_subtree_access(&secret, &world, KEY_READ, false).is_ok());
    assert_eq!(hive.pinned_cells(), 0, "walk must release every pin");
}

#[test]
fn subtree_check_enforces_depth_bound_without_leaking_pins() {
    let config = StoreConfig { max_tree_depth: 2, ..Default::default() };
    let hive = Hive::new(config);
    let root = hive.create_root().unwrap();
    let a = hive.create_key(&root, CellType::Stable, None).unwrap();
    let _b = hive.create_key(&a, CellType::Stable, None).unwrap();

    let system = ActorContext::new(vec![Sid::local_system()]);
    assert_eq!(
        hive.check_subtree_access(&root, &system, KEY_READ, true),
        Err(RegError::TooDeep { depth: 3 })
    );
    assert_eq!(hive.pinned_cells(), 0);
    hive.verify_security().unwrap();
}

#[test]
fn stale_handle_on_reused_slot_still_fails_deleted() {
    let (hive, root) = hive();
    let a = hive.create_key(&root, CellType::Stable, None).unwrap();
    hive.delete_key(&a).unwrap();

    // The freed slot is recycled for the next key; the old handle must
    // keep failing instead of reaching the new occupant.
    let b = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();
    assert_eq!(b.cell(), a.cell(), "arena reuses freed slots");

    let world = ActorContext::new(vec![Sid::world()]);
    assert_eq!(hive.set_security(&a, FieldSet::ALL, &root_descriptor()), Err(RegError::Deleted));
    assert_eq!(hive.query_security(&a, FieldSet::ALL), Err(RegError::Deleted));
    assert_eq!(
        hive.check_access(&a, &world, KEY_READ, LockContext::Acquire),
        Err(RegError::Deleted)
    );
    assert_eq!(hive.security_cell(&a), Err(RegError::Deleted));

    let owner_bytes = hive.query_security(&b, FieldSet::OWNER).unwrap();
    assert_eq!(codec::parse(&owner_bytes).unwrap().owner, Some(Sid::local_system()));
    hive.verify_security().unwrap();
}

#[test]
fn denial_stops_the_walk_before_later_siblings() {
    // The first child denies; its sibling hides a branch deeper than the
    // configured bound. A walk that kept going past the denial would
    // surface TooDeep instead of Denied.
    let config = StoreConfig { max_tree_depth: 2, ..Default::default() };
    let hive = Hive::new(config);
    let root = hive.create_root().unwrap();
    let _secret = hive.create_key(&root, CellType::Stable, Some(&only_system())).unwrap();
    let open = hive.create_key(&root, CellType::Stable, None).unwrap();
    let _deep = hive.create_key(&open, CellType::Stable, None).unwrap();

    let world = ActorContext::new(vec![Sid::world()]);
    let system = ActorContext::new(vec![Sid::local_system()]);

    assert_eq!(hive.check_subtree_access(&root, &world, KEY_READ, true), Err(RegError::Denied));
    // Without the early denial the same walk does reach the deep branch.
    assert_eq!(
        hive.check_subtree_access(&root, &system, KEY_READ, true),
        Err(RegError::TooDeep { depth: 3 })
    );
    assert_eq!(hive.pinned_cells(), 0);
}

#[test]
fn oversized_acl_is_rejected_as_malformed() {
    let (hive, root) = hive();
    let aces: Vec<Ace> =
        (0..4000u32).map(|i| Ace::allowed(KEY_READ, Sid::new(5, &[21, i]))).collect();
    let huge = Descriptor { dacl: Some(Acl { aces }), ..Default::default() };

    let err = hive.set_security(&root, FieldSet::DACL, &huge).unwrap_err();
    assert!(matches!(err, RegError::Malformed { .. }));
    assert!(hive.create_key(&root, CellType::Stable, Some(&huge)).is_err());
    assert_eq!(hive.live_security_cells(), 1);
    hive.verify_security().unwrap();
}

#[test]
fn create_rollback_releases_the_inherited_reference() {
    let (hive, root) = hive();
    let live_before = hive.with_arena(|cells| cells.live_count());
    // One allocation covers the node cell; the subkey list does not fit.
    hive.with_arena(|cells| cells.set_alloc_budget(Some(1)));

    let err = hive.create_key(&root, CellType::Stable, None).unwrap_err();
    assert!(err.is_resource());
    hive.with_arena(|cells| cells.set_alloc_budget(None));

    assert_eq!(hive.security_ref_count(&root).unwrap(), 1);
    assert_eq!(hive.with_arena(|cells| cells.live_count()), live_before);
    assert_eq!(hive.pinned_cells(), 0);
    hive.verify_security().unwrap();
}

#[test]
fn create_rollback_without_log_space_keeps_cells_consistent() {
    let (hive, root) = hive();
    let live_before = hive.with_arena(|cells| cells.live_count());
    hive.flush_dirty();
    // The shared cell's dirty mark consumes the budget; the parent's mark
    // fails, and so does the rollback's attempt to re-mark the shared cell.
    hive.with_arena(|cells| cells.set_dirty_budget(Some(1)));

    let err = hive.create_key(&root, CellType::Stable, None).unwrap_err();
    assert!(err.is_resource());
    hive.with_arena(|cells| cells.set_dirty_budget(None));

    // The extra reference survives the failed rollback; links, cache and
    // counts still agree.
    assert_eq!(hive.security_ref_count(&root).unwrap(), 2);
    assert_eq!(hive.with_arena(|cells| cells.live_count()), live_before);
    hive.verify_security().unwrap();
}

#[test]
fn allocation_failure_surfaces_as_exhausted_and_leaks_nothing() {
    let (hive, root) = hive();
    let live_before = hive.with_arena(|cells| cells.live_count());
    hive.with_arena(|cells| cells.set_alloc_budget(Some(0)));

    let err = hive.create_key(&root, CellType::Stable, None).unwrap_err();
    assert!(err.is_resource());

    hive.with_arena(|cells| cells.set_alloc_budget(None));
    assert_eq!(hive.with_arena(|cells| cells.live_count()), live_before);
    assert_eq!(hive.security_ref_count(&root).unwrap(), 1);
    assert_eq!(hive.pinned_cells(), 0);
    hive.verify_security().unwrap();
}

#[test]
fn dirty_mark_failure_aborts_security_update() {
    let (hive, root) = hive();
    hive.with_arena(|cells| cells.set_dirty_budget(Some(0)));
    let patch = Descriptor { owner: Some(Sid::new(5, &[32, 545])), ..Default::default() };
    let err = hive.set_security(&root, FieldSet::OWNER, &patch).unwrap_err();
    assert!(err.is_resource());
    hive.with_arena(|cells| cells.set_dirty_budget(None));

    assert_eq!(hive.pinned_cells(), 0);
    let owner_bytes = hive.query_security(&root, FieldSet::OWNER).unwrap();
    assert_eq!(codec::parse(&owner_bytes).unwrap().owner, Some(Sid::builtin_admins()));
    hive.verify_security().unwrap();
}

#[test]
fn query_retries_past_the_small_first_buffer() {
    let (hive, root) = hive();
    let aces: Vec<Ace> =
        (0..40).map(|i| Ace::allowed(KEY_READ, Sid::new(5, &[21, i, i + 1]))).collect();
    let wide = Descriptor { dacl: Some(Acl { aces }), ..Default::default() };
    hive.set_security(&root, FieldSet::DACL, &wide).unwrap();

    let bytes = hive.query_security(&root, FieldSet::ALL).unwrap();
    assert!(bytes.len() > 128);
    assert_eq!(codec::parse(&bytes).unwrap().dacl.unwrap().aces.len(), 40);
}

#[test]
fn query_subsets_only_selected_fields() {
    let (hive, root) = hive();
    let bytes = hive.query_security(&root, FieldSet::GROUP).unwrap();
    let parsed = codec::parse(&bytes).unwrap();
    assert_eq!(parsed.group, Some(Sid::local_system()));
    assert!(parsed.owner.is_none() && parsed.dacl.is_none());
}

#[test]
fn last_write_time_advances_on_child_creation() {
    let (hive, root) = hive();
    let before = hive.last_write_time(&root).unwrap();
    let _a = hive.create_key(&root, CellType::Stable, None).unwrap();
    let after = hive.last_write_time(&root).unwrap();
    assert!(after >= before);
}

#[test]
fn flush_covers_touched_cells() {
    let (hive, root) = hive();
    assert!(hive.flush_dirty() > 0);
    assert_eq!(hive.flush_dirty(), 0);
    hive.set_security(&root, FieldSet::DACL, &only_system()).unwrap();
    assert!(hive.flush_dirty() > 0);
}
