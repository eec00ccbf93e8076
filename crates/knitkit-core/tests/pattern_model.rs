use knitkit_core::{Direction, KnittingPattern, PatternStep};
use proptest::prelude::*;

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Cw), Just(Direction::Ccw)]
}

fn step() -> impl Strategy<Value = PatternStep> {
    (1u32..500, direction(), 1u32..20)
        .prop_map(|(n, d, r)| PatternStep::new(n, d, r, "").unwrap())
}

proptest! {
    #[test]
    fn total_needles_is_sum_times_repetitions(
        steps in prop::collection::vec(step(), 0..12),
        repetitions in 1u32..10,
    ) {
        let expected: u64 = steps
            .iter()
            .map(|s| u64::from(s.needles()) * u64::from(s.rows()))
            .sum::<u64>()
            * u64::from(repetitions);
        let pattern = KnittingPattern::new("prop", steps, repetitions, "").unwrap();
        prop_assert_eq!(pattern.total_needles(), expected);
    }

    #[test]
    fn json_round_trip_preserves_pattern(
        steps in prop::collection::vec(step(), 0..8),
        repetitions in 1u32..5,
    ) {
        let pattern = KnittingPattern::new("round trip", steps, repetitions, "desc").unwrap();
        let text = pattern.to_json().unwrap();
        prop_assert_eq!(KnittingPattern::from_json(&text).unwrap(), pattern);
    }
}

#[test]
fn edits_never_touch_the_original() {
    let original = KnittingPattern::new(
        "scarf",
        vec![PatternStep::new(48, Direction::Cw, 1, "").unwrap()],
        1,
        "",
    )
    .unwrap();
    let snapshot = original.clone();

    let _ = original.with_step(PatternStep::new(12, Direction::Ccw, 2, "").unwrap());
    let _ = original.without_step(0).unwrap();
    let _ = original.with_repetitions(4).unwrap();

    assert_eq!(original, snapshot);
}
