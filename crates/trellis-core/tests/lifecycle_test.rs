/// Incremental maintenance properties: retraction symmetry, order
/// independence, update-by-diff, and production removal isolation.
use trellis_core::*;

fn noop(name: &str, condition: Condition) -> Production {
    Production::new(name, condition, Action::noop())
}

/// Canonical view of the conflict set: production name plus sorted
/// bindings, sorted overall. Comparable across engines and histories.
fn snapshot(engine: &Engine) -> Vec<String> {
    let mut entries: Vec<String> = engine
        .matches()
        .map(|m| {
            let mut bindings: Vec<String> =
                m.bindings.iter().map(|(k, v)| format!("{k}={v}")).collect();
            bindings.sort();
            format!("{}[{}]", m.production_name, bindings.join(","))
        })
        .collect();
    entries.sort();
    entries
}

fn same_last_name() -> Condition {
    Condition::all(vec![
        Pattern::new().eq("first", "Chris").var("last", "l").into(),
        Pattern::new().eq("first", "John").var("last", "l").into(),
    ])
}

#[test]
fn retraction_restores_the_conflict_set_exactly() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().with("first", "Chris").with("last", "X")).unwrap();
    engine.add_fact(Fact::new().with("first", "John").with("last", "X")).unwrap();
    engine.add_production(noop("pair", same_last_name())).unwrap();

    let before = snapshot(&engine);
    assert_eq!(before.len(), 1);

    let extra = engine.add_fact(Fact::new().with("first", "John").with("last", "X")).unwrap();
    assert_eq!(engine.match_count(), 2);

    engine.remove_fact(extra).unwrap();
    assert_eq!(snapshot(&engine), before);
}

#[test]
fn final_matches_are_independent_of_insertion_order() {
    let facts = [
        Fact::new().with("first", "Chris").with("last", "X"),
        Fact::new().with("first", "John").with("last", "X"),
        Fact::new().with("first", "Jane").with("last", "Y"),
        Fact::new().with("first", "John").with("last", "Y"),
    ];

    let build = |order: &[usize]| {
        let mut engine = Engine::new();
        engine.add_production(noop("pair", same_last_name())).unwrap();
        for index in order {
            engine.add_fact(facts[*index].clone()).unwrap();
        }
        snapshot(&engine)
    };

    let reference = build(&[0, 1, 2, 3]);
    for order in [[3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]] {
        assert_eq!(build(&order), reference);
    }
}

#[test]
fn production_added_before_or_after_facts_agrees() {
    let mut facts_first = Engine::new();
    facts_first.add_fact(Fact::new().with("first", "Chris").with("last", "X")).unwrap();
    facts_first.add_fact(Fact::new().with("first", "John").with("last", "X")).unwrap();
    facts_first.add_production(noop("pair", same_last_name())).unwrap();

    let mut production_first = Engine::new();
    production_first.add_production(noop("pair", same_last_name())).unwrap();
    production_first
        .add_fact(Fact::new().with("first", "Chris").with("last", "X"))
        .unwrap();
    production_first
        .add_fact(Fact::new().with("first", "John").with("last", "X"))
        .unwrap();

    assert_eq!(snapshot(&facts_first), snapshot(&production_first));
}

#[test]
fn update_retracts_old_matches_and_asserts_new_ones() {
    let mut engine = Engine::new();
    let id = engine.add_fact(Fact::new().with("color", "red")).unwrap();
    engine.add_production(noop("red", Pattern::new().eq("color", "red").into())).unwrap();
    engine.add_production(noop("blue", Pattern::new().eq("color", "blue").into())).unwrap();
    assert_eq!(snapshot(&engine), vec!["red[]"]);

    engine.update_fact(id, Fact::new().with("color", "blue")).unwrap();
    assert_eq!(snapshot(&engine), vec!["blue[]"]);

    engine.update_fact(id, Fact::new().with("color", "red")).unwrap();
    assert_eq!(snapshot(&engine), vec!["red[]"]);
}

#[test]
fn update_leaves_matches_on_unchanged_attributes_alive() {
    let mut engine = Engine::new();
    let id = engine
        .add_fact(Fact::new().with("kind", "sensor").with("reading", 10))
        .unwrap();
    engine
        .add_production(noop("sensors", Pattern::new().eq("kind", "sensor").into()))
        .unwrap();

    let before: Vec<Match> = engine.matches().collect();
    assert_eq!(before.len(), 1);

    // Only `reading` changes; the WME diff must not touch `kind`, so the
    // existing match handle stays valid.
    engine
        .update_fact(id, Fact::new().with("kind", "sensor").with("reading", 11))
        .unwrap();
    assert_eq!(engine.match_count(), 1);
    assert!(engine.conflict_set().entry_for(&before[0]).is_some());
}

#[test]
fn removing_a_production_does_not_perturb_others() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().with("color", "red").with("size", 5)).unwrap();
    engine.add_fact(Fact::new().with("color", "red").with("size", 7)).unwrap();

    let shared = noop(
        "red-and-sized",
        Condition::all(vec![
            Pattern::new().eq("color", "red").into(),
            Pattern::new().var("size", "s").into(),
        ]),
    );
    let keep = engine.add_production(shared).unwrap();
    let drop = engine
        .add_production(noop("red-only", Pattern::new().eq("color", "red").into()))
        .unwrap();
    let before: Vec<String> = snapshot(&engine)
        .into_iter()
        .filter(|s| s.starts_with("red-and-sized"))
        .collect();
    assert_eq!(engine.match_count(), 6); // 2x2 joins + 2 singles

    engine.remove_production(drop).unwrap();
    let after: Vec<String> = snapshot(&engine)
        .into_iter()
        .filter(|s| s.starts_with("red-and-sized"))
        .collect();
    assert_eq!(before, after);
    assert_eq!(engine.production_count(), 1);

    // The survivor still matches new facts through the shared prefix
    engine.add_fact(Fact::new().with("color", "red").with("size", 9)).unwrap();
    assert!(engine.matches().count() > after.len());
    let _ = keep;
}

#[test]
fn remove_and_re_add_production_round_trips() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().with("color", "red")).unwrap();
    let condition: Condition = Pattern::new().eq("color", "red").into();

    let id = engine.add_production(noop("red", condition.clone())).unwrap();
    assert_eq!(engine.match_count(), 1);

    engine.remove_production(id).unwrap();
    assert_eq!(engine.match_count(), 0);
    assert_eq!(engine.production_count(), 0);

    engine.add_production(noop("red", condition)).unwrap();
    assert_eq!(engine.match_count(), 1);
}

#[test]
fn network_returns_to_baseline_after_full_teardown() {
    let mut engine = Engine::new();
    let baseline = engine.network_stats();

    let id = engine
        .add_production(noop(
            "pair",
            Condition::all(vec![
                Pattern::new().eq("color", "red").into(),
                Condition::not(Pattern::new().eq("color", "green").into()),
            ]),
        ))
        .unwrap();
    let fact = engine.add_fact(Fact::new().with("color", "red")).unwrap();
    assert_eq!(engine.match_count(), 1);

    engine.remove_fact(fact).unwrap();
    engine.remove_production(id).unwrap();

    let after = engine.network_stats();
    assert_eq!(after.alpha_node_count, baseline.alpha_node_count);
    assert_eq!(after.alpha_memory_count, baseline.alpha_memory_count);
    assert_eq!(after.beta_node_count, baseline.beta_node_count);
    assert_eq!(after.token_count, baseline.token_count);
    assert_eq!(after.match_count, 0);
}
