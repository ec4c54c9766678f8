/// Core matching behavior: constant patterns, variable joins, functional
/// tests, and path expressions over nested values.
use trellis_core::*;

fn noop(name: &str, condition: Condition) -> Production {
    Production::new(name, condition, Action::noop())
}

#[test]
fn simple_constant_match() {
    let mut engine = Engine::new();
    let red = engine.add_fact(Fact::new().with("color", "red")).unwrap();
    engine.add_fact(Fact::new().with("color", "blue")).unwrap();

    engine
        .add_production(noop("red-things", Pattern::new().bind("f").eq("color", "red").into()))
        .unwrap();

    let matches: Vec<Match> = engine.matches().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].production_name, "red-things");
    assert_eq!(matches[0].get("f"), Some(&Value::FactRef(red)));
}

#[test]
fn variable_equality_across_facts() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().with("first", "Chris").with("last", "X")).unwrap();
    engine.add_fact(Fact::new().with("first", "John").with("last", "X")).unwrap();
    engine.add_fact(Fact::new().with("first", "Jane").with("last", "Y")).unwrap();

    engine
        .add_production(noop(
            "same-last-name",
            Condition::all(vec![
                Pattern::new().eq("first", "Chris").var("last", "l").into(),
                Pattern::new().eq("first", "John").var("last", "l").into(),
            ]),
        ))
        .unwrap();

    let matches: Vec<Match> = engine.matches().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("l"), Some(&Value::from("X")));
}

#[test]
fn functional_test_chain() {
    let mut engine = Engine::new();
    for value in [3, 1, 2] {
        engine.add_fact(Fact::new().with("value", value)).unwrap();
    }

    let greater = |vals: &[Value]| {
        let left = vals[0].as_integer().ok_or_else(|| anyhow::anyhow!("not an integer"))?;
        let right = vals[1].as_integer().ok_or_else(|| anyhow::anyhow!("not an integer"))?;
        Ok(left > right)
    };
    engine
        .add_production(noop(
            "descending-triple",
            Condition::all(vec![
                Pattern::new().var("value", "a").into(),
                Pattern::new().var("value", "b").into(),
                Condition::test(&["a", "b"], greater),
                Pattern::new().var("value", "c").into(),
                Condition::test(&["b", "c"], greater),
            ]),
        ))
        .unwrap();

    let matches: Vec<Match> = engine.matches().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("a"), Some(&Value::from(3)));
    assert_eq!(matches[0].get("b"), Some(&Value::from(2)));
    assert_eq!(matches[0].get("c"), Some(&Value::from(1)));
}

#[test]
fn path_expressions_navigate_nested_values() {
    let mut engine = Engine::new();
    engine
        .add_fact(
            Fact::new().with("name", "rock").with(
                "against",
                Value::object([("scissors", Value::from(1)), ("paper", Value::from(-1))]),
            ),
        )
        .unwrap();
    engine
        .add_fact(
            Fact::new().with("name", "paper").with(
                "against",
                Value::object([("rock", Value::from(1)), ("scissors", Value::from(-1))]),
            ),
        )
        .unwrap();
    engine
        .add_fact(
            Fact::new().with("name", "scissors").with(
                "against",
                Value::object([("paper", Value::from(1)), ("rock", Value::from(-1))]),
            ),
        )
        .unwrap();

    engine
        .add_production(noop(
            "beats-scissors-loses-paper",
            Pattern::new()
                .var("name", "n")
                .eq("against__scissors", 1)
                .eq("against__paper", -1)
                .into(),
        ))
        .unwrap();

    let matches: Vec<Match> = engine.matches().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("n"), Some(&Value::from("rock")));
}

#[test]
fn wildcard_requires_attribute_presence() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().with("color", "red").with("size", 5)).unwrap();
    engine.add_fact(Fact::new().with("color", "blue")).unwrap();

    engine
        .add_production(noop("sized", Pattern::new().bind("f").wildcard("size").into()))
        .unwrap();
    assert_eq!(engine.match_count(), 1);
}

#[test]
fn positional_attributes_match_by_index() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().push("likes").push("alice").push("bob")).unwrap();
    engine.add_fact(Fact::new().push("likes").push("bob").push("carol")).unwrap();

    // Transitive: (likes a b) and (likes b c)
    engine
        .add_production(noop(
            "likes-chain",
            Condition::all(vec![
                Pattern::new().pos_eq(0, "likes").pos_var(1, "a").pos_var(2, "b").into(),
                Pattern::new().pos_eq(0, "likes").pos_var(1, "b").pos_var(2, "c").into(),
            ]),
        ))
        .unwrap();

    let matches: Vec<Match> = engine.matches().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("a"), Some(&Value::from("alice")));
    assert_eq!(matches[0].get("c"), Some(&Value::from("carol")));
}

#[test]
fn same_fact_can_support_multiple_bindings() {
    let mut engine = Engine::new();
    engine.add_fact(Fact::new().with("value", 1)).unwrap();
    engine.add_fact(Fact::new().with("value", 2)).unwrap();

    // Two independent positive conditions over the same attribute give the
    // full cross product, including each fact paired with itself.
    engine
        .add_production(noop(
            "pairs",
            Condition::all(vec![
                Pattern::new().var("value", "a").into(),
                Pattern::new().var("value", "b").into(),
            ]),
        ))
        .unwrap();
    assert_eq!(engine.match_count(), 4);
}

#[test]
fn facts_added_after_the_production_still_match() {
    let mut engine = Engine::new();
    engine
        .add_production(noop("red-things", Pattern::new().eq("color", "red").into()))
        .unwrap();
    assert_eq!(engine.match_count(), 0);

    engine.add_fact(Fact::new().with("color", "red")).unwrap();
    assert_eq!(engine.match_count(), 1);

    engine.add_fact(Fact::new().with("color", "red")).unwrap();
    assert_eq!(engine.match_count(), 2);
}
