use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ledger_import::data::Row;
use ledger_import::fingerprint::{compare, fingerprint, ImportSnapshot};
use ledger_import::schema::{DecimalSpec, EntitySchema, FieldDescriptor, FieldKind};

fn entry_schema() -> EntitySchema {
    EntitySchema::new(
        "entry",
        vec![
            FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
            FieldDescriptor::new("account", FieldKind::Relation("account".into())),
            FieldDescriptor::new("amount", FieldKind::Decimal(DecimalSpec::new(12, 2).expect("decimal spec"))),
            FieldDescriptor::new("memo", FieldKind::String).nullable(),
            FieldDescriptor::new("posted_on", FieldKind::Date),
            FieldDescriptor::new("created_at", FieldKind::DateTime).auto_timestamp(),
        ],
    )
}

fn generate_entries(rows: usize) -> Vec<Row> {
    (0..rows)
        .map(|i| {
            let day = (i % 28) + 1;
            Row::new(format!("e{i}"), "Entries", i + 2)
                .with_field("id", i as i64 + 1)
                .with_field("account_id", (i % 40) as i64 + 1)
                .with_field("amount", format!("{}.{:02}", i % 5000, i % 100))
                .with_field("memo", format!("Invoice   {i}  settlement"))
                .with_field("posted_on", format!("2024-03-{day:02}"))
        })
        .collect()
}

fn bench_fingerprint(c: &mut Criterion) {
    let schema = entry_schema();
    let mut group = c.benchmark_group("fingerprint");
    for rows in [1_000usize, 10_000] {
        let entries = generate_entries(rows);
        group.bench_with_input(BenchmarkId::new("table", rows), &entries, |b, entries| {
            b.iter(|| fingerprint(&schema, entries))
        });

        let history = (0..5)
            .map(|n| {
                let previous = fingerprint(&schema, &entries[n * 10..]);
                ImportSnapshot::from_fingerprint("acme", "entry", &previous, None, 1000, None)
            })
            .collect::<Vec<_>>();
        let current = fingerprint(&schema, &entries);
        group.bench_with_input(BenchmarkId::new("compare", rows), &current, |b, current| {
            b.iter(|| compare(current, &history, 1000))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fingerprint);
criterion_main!(benches);
