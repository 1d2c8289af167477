use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mixclient::{
    BlameAssigner, ChainParams, Denomination, OutputCommitment, PairRequest, PairedSessions,
    PeerId, PhaseBudgets, RunContext, Session, SessionId, SessionRun,
};
use rand::Rng;
use tokio::time::Instant;

const TIP: u32 = 1000;

fn requests(n: usize) -> Vec<PairRequest> {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| {
            PairRequest::new(
                PeerId(rng.random()),
                vec![OutputCommitment(rng.random()), OutputCommitment(rng.random())],
                Denomination(100_000),
                TIP + 10,
            )
            .unwrap()
        })
        .collect()
}

fn bench_form_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("form_session");

    for size in 2..=7 {
        let n = 1 << size;
        let reqs = requests(n);
        let local = reqs[0].id();

        group.bench_with_input(BenchmarkId::from_parameter(n), &reqs, |b, reqs| {
            b.iter(|| {
                let mut pool =
                    PairedSessions::new(2, ChainParams::new(Duration::from_secs(150)), TIP);
                for r in reqs {
                    pool.accept(r.clone(), false).unwrap();
                }
                pool.form_session(&local).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_session_id(c: &mut Criterion) {
    let reqs = requests(64);
    c.bench_function("session_id/64", |b| b.iter(|| Session::derive_id(&reqs)));
}

fn bench_blame_timeout(c: &mut Criterion) {
    let mut group = c.benchmark_group("blame_timeout");
    let budgets = PhaseBudgets::uniform(Duration::from_secs(1));

    for size in 2..=7 {
        let n = 1usize << size;
        let participants: Vec<PeerId> = (0..n).map(|i| PeerId([i as u8; 32])).collect();
        let ctx = RunContext {
            session_id: SessionId([1; 32]),
            epoch: 0,
            local: participants[0],
            participants,
        };
        let start = Instant::now();
        let mut run = SessionRun::new(ctx, budgets, start);
        run.expire(start + budgets.total());

        group.bench_with_input(BenchmarkId::from_parameter(n), &run, |b, run| {
            b.iter(|| BlameAssigner.assign(run));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_form_session, bench_session_id, bench_blame_timeout);
criterion_main!(benches);
