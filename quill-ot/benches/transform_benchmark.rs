use criterion::{criterion_group, criterion_main, Criterion};
use quill_ot::{apply, diff, transform, transform_sequence, ClientSession, Operation, Snapshot};
use std::hint::black_box;
use uuid::Uuid;

fn bench_transform_pair(c: &mut Criterion) {
    let (a_id, b_id) = (Uuid::from_u128(1), Uuid::from_u128(2));
    let a = Operation::delete(10, 40);
    let b = Operation::insert(25, "concurrent");

    c.bench_function("transform_delete_vs_insert", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), a_id, black_box(&b), b_id)))
    });
}

fn bench_rebase_over_log(c: &mut Criterion) {
    let me = Uuid::from_u128(7);
    let others: Vec<Uuid> = (0..8).map(|i| Uuid::from_u128(100 + i)).collect();
    // A full retained log of interleaved remote edits
    let log: Vec<(Operation, Uuid)> = (0..200)
        .map(|i| {
            let op = if i % 3 == 0 {
                Operation::delete(i % 50, 2)
            } else {
                Operation::insert(i % 80, "ab")
            };
            (op, others[i % others.len()])
        })
        .collect();

    c.bench_function("rebase_over_200_entries", |bench| {
        bench.iter(|| {
            black_box(transform_sequence(
                Operation::insert(500, "x"),
                me,
                log.iter().map(|(op, client)| (op, *client)),
            ))
        })
    });
}

fn bench_apply_large(c: &mut Criterion) {
    let content = "lorem ipsum dolor sit amet ".repeat(400);
    let op = Operation::insert(5_000, "inserted");

    c.bench_function("apply_insert_10k_chars", |bench| {
        bench.iter(|| black_box(apply(black_box(&content), black_box(&op))))
    });
}

fn bench_diff_large(c: &mut Criterion) {
    let old = "lorem ipsum dolor sit amet ".repeat(400);
    let new = apply(&old, &Operation::insert(5_000, "typed"));

    c.bench_function("diff_10k_chars", |bench| {
        bench.iter(|| black_box(diff(black_box(&old), black_box(&new))))
    });
}

fn bench_session_typing(c: &mut Criterion) {
    c.bench_function("session_type_100_chars", |bench| {
        bench.iter(|| {
            let mut session = ClientSession::new(
                Uuid::from_u128(1),
                Snapshot { content: String::new(), revision: 0 },
            );
            for i in 0..100 {
                let _ = session.apply_local(Operation::insert(i, "k"));
            }
            black_box(session.pending_len())
        })
    });
}

criterion_group!(
    benches,
    bench_transform_pair,
    bench_rebase_over_log,
    bench_apply_large,
    bench_diff_large,
    bench_session_typing,
);
criterion_main!(benches);
