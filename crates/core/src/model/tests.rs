use super::*;

#[test]
fn phase_order_is_strictly_forward() {
    let mut phase = Phase::Analyze;
    let mut seen = vec![phase];
    while !phase.is_terminal() {
        let next = phase.next();
        assert!(next.ordinal() > phase.ordinal(), "{phase} -> {next}");
        phase = next;
        seen.push(phase);
    }
    assert_eq!(
        seen,
        vec![
            Phase::Analyze,
            Phase::Plan,
            Phase::Transform,
            Phase::Verify,
            Phase::Deploy,
            Phase::Done
        ]
    );
    assert_eq!(Phase::Failed.next(), Phase::Failed);
    assert_eq!(Phase::Cancelled.next(), Phase::Cancelled);
}

#[test]
fn phase_parse_round_trips_names() {
    for phase in Phase::WORK {
        assert_eq!(Phase::parse(phase.as_str()), Some(phase));
    }
    assert_eq!(Phase::parse(" verify "), Some(Phase::Verify));
    assert_eq!(Phase::parse("canceled"), Some(Phase::Cancelled));
    assert_eq!(Phase::parse("unknown"), None);
    assert_eq!(Phase::Verify.previous(), Some(Phase::Transform));
    assert_eq!(Phase::Analyze.previous(), None);
}

#[test]
fn settled_units_are_done_or_fallback() {
    let settled = UnitStatus::ALL
        .iter()
        .copied()
        .filter(|s| s.is_settled())
        .collect::<Vec<_>>();
    assert_eq!(settled, vec![UnitStatus::Done, UnitStatus::Fallback]);
    assert_eq!(UnitStatus::parse("REPAIRING"), Some(UnitStatus::Repairing));
}

#[test]
fn only_fetched_assets_count_as_stored() {
    assert!(AssetStatus::Downloaded.is_stored());
    assert!(AssetStatus::Optimized.is_stored());
    assert!(!AssetStatus::Skipped.is_stored());
    assert!(!AssetStatus::Failed.is_stored());
}
