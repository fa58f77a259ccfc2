//! View digest algebra under longer mutation sequences.

use flock::{decode, encode, GroupView, WireView};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

#[test]
fn test_digest_depends_only_on_content() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);

    // build a view through adds interleaved with removals
    let mut view = GroupView::new();
    let mut present: Vec<(u64, u16, String)> = Vec::new();
    for rank in 0..64u64 {
        let provider_id = (rank % 4) as u16;
        let address = format!("mem://node-{rank}");
        view.add_member(rank, provider_id, address.clone()).unwrap();
        present.push((rank, provider_id, address));

        if rank % 3 == 0 && !present.is_empty() {
            let victim = present.remove(rng.gen_range(0..present.len()));
            assert!(view.remove_member(&victim.2, victim.1));
        }
    }
    for i in 0..32 {
        view.add_metadata(format!("key-{i}"), format!("value-{i}"));
    }

    // a fresh view holding the same final content in shuffled order must
    // agree on the digest
    let mut rebuilt = GroupView::new();
    let mut shuffled = present.clone();
    shuffled.shuffle(&mut rng);
    for (rank, provider_id, address) in &shuffled {
        rebuilt.add_member(*rank, *provider_id, address.clone()).unwrap();
    }
    let mut keys: Vec<usize> = (0..32).collect();
    keys.shuffle(&mut rng);
    for i in keys {
        rebuilt.add_metadata(format!("key-{i}"), format!("value-{i}"));
    }

    assert_eq!(view.digest(), rebuilt.digest());
    assert_eq!(view.live_count(), rebuilt.live_count());
}

#[test]
fn test_removing_everything_returns_digest_to_zero() {
    let mut view = GroupView::new();
    for rank in 0..20u64 {
        view.add_member(rank, 0, format!("mem://n{rank}")).unwrap();
    }
    for i in 0..10 {
        view.add_metadata(format!("k{i}"), "v");
    }

    for rank in (0..20u64).rev() {
        assert!(view.remove_member(&format!("mem://n{rank}"), 0));
    }
    for i in 0..10 {
        assert!(view.remove_metadata(&format!("k{i}")));
    }

    assert_eq!(view.digest(), 0);
    assert_eq!(view.size(), 0);
}

#[test]
fn test_serialization_round_trip_under_churn() {
    let mut rng = ChaCha20Rng::seed_from_u64(42);
    let mut view = GroupView::new();
    for rank in 0..16u64 {
        view.add_member(rank, rng.gen_range(0..8) as u16, format!("mem://n{rank}"))
            .unwrap();
    }
    view.remove_member("mem://n3", view.find_member_by_rank(3).unwrap().provider_id);
    view.add_metadata("generation", "12");

    let wire = WireView::from_view(&view, "mem", -5);
    let rebuilt = decode(&encode(&wire)).unwrap();

    assert_eq!(rebuilt.credentials, -5);
    assert_eq!(rebuilt.transport, "mem");
    let round = rebuilt.to_view();
    // ranks renumber to positions, so compare identities in order
    let before: Vec<(&str, u16)> = view
        .members()
        .iter()
        .map(|m| (m.address.as_str(), m.provider_id))
        .collect();
    let after: Vec<(&str, u16)> = round
        .members()
        .iter()
        .map(|m| (m.address.as_str(), m.provider_id))
        .collect();
    assert_eq!(before, after);
    assert_eq!(round.find_metadata("generation"), Some("12"));
}
