use bitarray::BitArray;
use criterion::{criterion_group, criterion_main, Criterion};
use cv_localize::descriptor::{GraphIndex, LinearIndex};
use cv_localize::matching::match_pair;
use rand::{rngs::SmallRng, Rng, SeedableRng};

type Descriptor = BitArray<64>;

fn descriptors(rng: &mut SmallRng, count: usize) -> Vec<Descriptor> {
    (0..count)
        .map(|_| {
            let mut descriptor = Descriptor::zeros();
            for byte in descriptor.bytes_mut().iter_mut() {
                *byte = rng.gen();
            }
            descriptor
        })
        .collect()
}

/// A copy of `descriptors` with a few bits flipped in each.
fn perturbed(rng: &mut SmallRng, descriptors: &[Descriptor]) -> Vec<Descriptor> {
    descriptors
        .iter()
        .map(|descriptor| {
            let mut descriptor = descriptor.clone();
            for _ in 0..8 {
                let bit = rng.gen_range(0..512);
                descriptor.bytes_mut()[bit / 8] ^= 1 << (bit % 8);
            }
            descriptor
        })
        .collect()
}

fn matching(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(0);
    let a = descriptors(&mut rng, 2000);
    let b = perturbed(&mut rng, &a);
    c.bench_function("match_pair linear", |bench| {
        bench.iter(|| match_pair::<_, LinearIndex<Descriptor>>(&a, &b, 0.6))
    });
    c.bench_function("match_pair graph", |bench| {
        bench.iter(|| match_pair::<_, GraphIndex<Descriptor>>(&a, &b, 0.6))
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = matching
);
criterion_main!(benches);
