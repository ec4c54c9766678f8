/// Firing semantics: actions mutating working memory mid-fire, stale
/// matches, action errors, and conflict-set ordering.
use trellis_core::*;

fn noop(name: &str, condition: Condition) -> Production {
    Production::new(name, condition, Action::noop())
}

fn set_light(color: &'static str) -> Action {
    Action::new(&["f"], move |engine, args| {
        let id = args[0]
            .as_fact_ref()
            .ok_or_else(|| anyhow::anyhow!("expected a fact binding"))?;
        engine.update_fact(id, Fact::new().with("light_color", color))?;
        Ok(None)
    })
}

#[test]
fn traffic_light_alternates_over_five_firings() {
    let mut engine = Engine::new();
    let light = engine.add_fact(Fact::new().with("light_color", "red")).unwrap();

    engine
        .add_production(Production::new(
            "to-green",
            Pattern::new().bind("f").eq("light_color", "red").into(),
            set_light("green"),
        ))
        .unwrap();
    engine
        .add_production(Production::new(
            "to-red",
            Pattern::new().bind("f").eq("light_color", "green").into(),
            set_light("red"),
        ))
        .unwrap();

    let mut observed = Vec::new();
    for _ in 0..5 {
        let m = engine.matches().next().expect("one match pending");
        engine.fire(&m).unwrap();
        let color = engine
            .get_fact(light)
            .and_then(|f| f.named.get("light_color"))
            .cloned()
            .expect("light fact present");
        observed.push(color);
    }
    assert_eq!(
        observed,
        vec![
            Value::from("green"),
            Value::from("red"),
            Value::from("green"),
            Value::from("red"),
            Value::from("green"),
        ]
    );
    // Exactly one match pending after each quiescence
    assert_eq!(engine.match_count(), 1);
}

#[test]
fn actions_can_assert_new_facts() {
    let mut engine = Engine::new();
    engine
        .add_production(Production::new(
            "derive-greeting",
            Pattern::new().var("name", "n").into(),
            Action::new(&["n"], |engine, args| {
                let name = args[0].as_str().unwrap_or_default().to_string();
                engine.add_fact(Fact::new().with("greeted", name))?;
                Ok(None)
            }),
        ))
        .unwrap();
    engine
        .add_production(noop("greeted", Pattern::new().wildcard("greeted").into()))
        .unwrap();

    engine.add_fact(Fact::new().with("name", "ada")).unwrap();
    let m = engine
        .matches()
        .find(|m| m.production_name == "derive-greeting")
        .unwrap();
    engine.fire(&m).unwrap();

    // The derived fact propagated fully before fire returned
    assert_eq!(
        engine.matches().filter(|m| m.production_name == "greeted").count(),
        1
    );
    assert_eq!(engine.fact_count(), 2);
}

#[test]
fn fire_returns_the_actions_value() {
    let mut engine = Engine::new();
    engine
        .add_production(Production::new(
            "sum",
            Condition::all(vec![
                Pattern::new().var("value", "a").into(),
                Pattern::new().var("value", "b").into(),
                Condition::test(&["a", "b"], |vals| Ok(vals[0] != vals[1])),
            ]),
            Action::new(&["a", "b"], |_, args| {
                let sum = args[0].as_integer().unwrap_or(0) + args[1].as_integer().unwrap_or(0);
                Ok(Some(Value::from(sum)))
            }),
        ))
        .unwrap();
    engine.add_fact(Fact::new().with("value", 2)).unwrap();
    engine.add_fact(Fact::new().with("value", 3)).unwrap();

    let m = engine.matches().next().unwrap();
    let result = engine.fire(&m).unwrap();
    assert_eq!(result, Some(Value::from(5)));
}

#[test]
fn firing_a_retracted_match_fails() {
    let mut engine = Engine::new();
    let fact = engine.add_fact(Fact::new().with("color", "red")).unwrap();
    engine
        .add_production(noop("red", Pattern::new().eq("color", "red").into()))
        .unwrap();

    let m = engine.matches().next().unwrap();
    engine.remove_fact(fact).unwrap();

    let err = engine.fire(&m).unwrap_err();
    assert_eq!(err.category(), "stale_match");
}

#[test]
fn action_errors_surface_but_keep_prior_mutations() {
    let mut engine = Engine::new();
    engine
        .add_production(Production::new(
            "explode",
            Pattern::new().eq("color", "red").into(),
            Action::new(&[], |engine, _| {
                engine.add_fact(Fact::new().with("partial", true))?;
                Err(anyhow::anyhow!("action failed after mutating"))
            }),
        ))
        .unwrap();
    engine.add_fact(Fact::new().with("color", "red")).unwrap();

    let m = engine.matches().next().unwrap();
    let err = engine.fire(&m).unwrap_err();
    assert_eq!(err.category(), "action");

    // The mutation performed before the error stays committed
    assert_eq!(engine.fact_count(), 2);
}

#[test]
fn a_match_can_fire_repeatedly_without_refraction() {
    let mut engine = Engine::new();
    engine
        .add_production(Production::new(
            "count",
            Pattern::new().eq("color", "red").into(),
            Action::new(&[], |_, _| Ok(Some(Value::from(1)))),
        ))
        .unwrap();
    engine.add_fact(Fact::new().with("color", "red")).unwrap();

    let m = engine.matches().next().unwrap();
    // The core provides no refraction: the same valid match fires again
    assert_eq!(engine.fire(&m).unwrap(), Some(Value::from(1)));
    assert_eq!(engine.fire(&m).unwrap(), Some(Value::from(1)));
}

#[test]
fn conflict_set_iterates_in_insertion_order() {
    let mut engine = Engine::new();
    engine
        .add_production(noop("reds", Pattern::new().bind("f").eq("color", "red").into()))
        .unwrap();

    let first = engine.add_fact(Fact::new().with("color", "red")).unwrap();
    let second = engine.add_fact(Fact::new().with("color", "red")).unwrap();
    let third = engine.add_fact(Fact::new().with("color", "red")).unwrap();

    let bound: Vec<Option<FactId>> =
        engine.matches().map(|m| m.get("f").and_then(Value::as_fact_ref)).collect();
    assert_eq!(bound, vec![Some(first), Some(second), Some(third)]);
}

#[test]
fn actions_can_remove_their_own_support() {
    let mut engine = Engine::new();
    engine
        .add_production(Production::new(
            "consume",
            Pattern::new().bind("f").eq("state", "pending").into(),
            Action::new(&["f"], |engine, args| {
                let id = args[0].as_fact_ref().expect("fact binding");
                engine.remove_fact(id)?;
                Ok(None)
            }),
        ))
        .unwrap();
    engine.add_fact(Fact::new().with("state", "pending")).unwrap();
    engine.add_fact(Fact::new().with("state", "pending")).unwrap();

    // Drain the conflict set the way a driver would
    let mut fired = 0;
    loop {
        let next = engine.matches().next();
        let m = match next {
            Some(m) => m,
            None => break,
        };
        engine.fire(&m).unwrap();
        fired += 1;
        assert!(fired <= 2, "consuming actions must quiesce");
    }
    assert_eq!(fired, 2);
    assert_eq!(engine.fact_count(), 0);
    assert_eq!(engine.match_count(), 0);
}
