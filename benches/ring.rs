//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
use bencher::{benchmark_group, benchmark_main, Bencher};

use ngsdispatch::{BlockRing, LapRing};

fn blockring_push_pop(b: &mut Bencher) {
    let ring = BlockRing::new(8192, 3);
    b.iter(|| {
        ring.push(1u32);
        ring.pop().unwrap()
    });
}

fn blockring_burst_64(b: &mut Bencher) {
    let ring = BlockRing::new(8192, 3);
    b.iter(|| {
        for i in 0..64u32 {
            ring.push(i);
        }
        let mut sum = 0;
        while let Some(value) = ring.pop() {
            sum += value;
        }
        sum
    });
}

fn lapring_push_pop(b: &mut Bencher) {
    let ring = LapRing::new(1024);
    b.iter(|| {
        ring.push(1u32);
        ring.pop().unwrap()
    });
}

fn lapring_pop_if(b: &mut Bencher) {
    let ring = LapRing::new(1024);
    b.iter(|| {
        ring.push(1u32);
        ring.pop_if(|&x| x == 1).unwrap()
    });
}

benchmark_group!(
    benches,
    blockring_push_pop,
    blockring_burst_64,
    lapring_push_pop,
    lapring_pop_if
);
benchmark_main!(benches);
