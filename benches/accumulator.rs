use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mrtsqr::accumulator::{Reduction, RowAccumulator};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ROWS: usize = 20_000;
const COLS: usize = 10;

fn random_rows() -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x75_0Au64);
    Array2::from_shape_fn((ROWS, COLS), |_| rng.sample(Standard))
}

fn stream(rows: &Array2<f64>, reduction: Reduction, blocksize: usize) -> Array2<f64> {
    let mut accumulator = RowAccumulator::new(reduction, blocksize, Some(COLS));
    for row in rows.rows() {
        accumulator.observe(row.as_slice().unwrap()).unwrap();
    }
    accumulator.finalize().unwrap().0
}

fn benchmark_accumulator(c: &mut Criterion) {
    let rows = random_rows();
    let mut group = c.benchmark_group("row_accumulator");
    group.throughput(Throughput::Elements((ROWS * COLS) as u64));

    for blocksize in [1_usize, 3, 30, 300] {
        group.bench_with_input(BenchmarkId::new("qr", blocksize), &blocksize, |b, &size| {
            b.iter(|| black_box(stream(black_box(&rows), Reduction::Qr, size)));
        });
        group.bench_with_input(BenchmarkId::new("gram", blocksize), &blocksize, |b, &size| {
            b.iter(|| black_box(stream(black_box(&rows), Reduction::Gram, size)));
        });
    }
    group.finish();
}

criterion_group!(accumulator, benchmark_accumulator);
criterion_main!(accumulator);
