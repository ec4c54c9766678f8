use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use trellis_core::{Action, Condition, Engine, Fact, Pattern, Production, Value};

fn generate_test_facts(count: usize) -> Vec<Fact> {
    (0..count)
        .map(|i| {
            Fact::new()
                .with("entity_id", i as i64)
                .with("status", if i % 2 == 0 { "active" } else { "idle" })
                .with("category", format!("cat_{}", i % 10))
                .with("score", (i % 100) as i64)
        })
        .collect()
}

fn standard_productions() -> Vec<Production> {
    let mut productions = vec![Production::new(
        "active",
        Pattern::new().eq("status", "active").into(),
        Action::noop(),
    )];
    for category in 0..5 {
        productions.push(Production::new(
            format!("category-{category}"),
            Condition::all(vec![
                Pattern::new()
                    .eq("category", format!("cat_{category}"))
                    .var("score", "s")
                    .into(),
                Condition::test(&["s"], |vals| {
                    Ok(vals[0].as_integer().unwrap_or(0) > 50)
                }),
            ]),
            Action::noop(),
        ));
    }
    productions
}

fn bench_fact_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("fact_insertion");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for size in [1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("add_facts", size), size, |b, &size| {
            b.iter_batched(
                || {
                    let mut engine = Engine::new();
                    for production in standard_productions() {
                        engine.add_production(production).unwrap();
                    }
                    (engine, generate_test_facts(size))
                },
                |(mut engine, facts)| {
                    for fact in facts {
                        black_box(engine.add_fact(fact).unwrap());
                    }
                    black_box(engine.match_count())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_update");
    group.sample_size(20);

    group.bench_function("update_one_fact_in_10k", |b| {
        let mut engine = Engine::new();
        for production in standard_productions() {
            engine.add_production(production).unwrap();
        }
        let ids: Vec<_> = generate_test_facts(10_000)
            .into_iter()
            .map(|fact| engine.add_fact(fact).unwrap())
            .collect();
        let target = ids[ids.len() / 2];
        let mut flip = false;

        b.iter(|| {
            flip = !flip;
            let status = if flip { "idle" } else { "active" };
            let fact = Fact::new()
                .with("entity_id", target as i64)
                .with("status", status)
                .with("category", "cat_3")
                .with("score", Value::from(99));
            engine.update_fact(target, fact).unwrap();
            black_box(engine.match_count())
        });
    });
    group.finish();
}

fn bench_join_heavy(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_heavy");
    group.sample_size(10);

    group.bench_function("two_way_join_200", |b| {
        b.iter_batched(
            || {
                let mut engine = Engine::new();
                engine
                    .add_production(Production::new(
                        "same-category",
                        Condition::all(vec![
                            Pattern::new().var("category", "c").var("entity_id", "a").into(),
                            Pattern::new().var("category", "c").var("entity_id", "b").into(),
                        ]),
                        Action::noop(),
                    ))
                    .unwrap();
                (engine, generate_test_facts(200))
            },
            |(mut engine, facts)| {
                for fact in facts {
                    engine.add_fact(fact).unwrap();
                }
                black_box(engine.match_count())
            },
            criterion::BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_fact_insertion,
    bench_incremental_update,
    bench_join_heavy
);
criterion_main!(benches);
