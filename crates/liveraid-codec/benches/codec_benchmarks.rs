use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use liveraid_codec::{AlignedBlock, CauchyCodec};

fn bench_encode(c: &mut Criterion) {
    let nd = 4;
    let np = 2;
    let block = 64 * 1024;
    let codec = CauchyCodec::new(nd, np).unwrap();

    let mut data: Vec<AlignedBlock> = (0..nd).map(|_| AlignedBlock::zeroed(block)).collect();
    for (d, b) in data.iter_mut().enumerate() {
        for (i, byte) in b.iter_mut().enumerate() {
            *byte = (i.wrapping_mul(d + 3) & 0xff) as u8;
        }
    }
    let mut parity: Vec<AlignedBlock> = (0..np).map(|_| AlignedBlock::zeroed(block)).collect();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes((nd * block) as u64));
    group.bench_function("4+2_64k", |bench| {
        bench.iter(|| {
            let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_ref()).collect();
            let mut parity_refs: Vec<&mut [u8]> =
                parity.iter_mut().map(|b| b.as_mut()).collect();
            codec.encode(&data_refs, &mut parity_refs).unwrap();
        })
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let nd = 4;
    let np = 2;
    let block = 64 * 1024;
    let codec = CauchyCodec::new(nd, np).unwrap();

    let data: Vec<Vec<u8>> = (0..nd)
        .map(|d| (0..block).map(|i| (i.wrapping_mul(d + 7) & 0xff) as u8).collect())
        .collect();
    let mut parity = vec![vec![0u8; block]; np];
    {
        let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_slice()).collect();
        let mut parity_refs: Vec<&mut [u8]> =
            parity.iter_mut().map(|b| b.as_mut_slice()).collect();
        codec.encode(&data_refs, &mut parity_refs).unwrap();
    }

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes((2 * block) as u64));
    group.bench_function("4+2_two_failures", |bench| {
        bench.iter(|| {
            let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_slice()).collect();
            let parity_refs: Vec<&[u8]> = parity.iter().map(|b| b.as_slice()).collect();
            let mut out = vec![vec![0u8; block]; 2];
            let mut out_refs: Vec<&mut [u8]> =
                out.iter_mut().map(|b| b.as_mut_slice()).collect();
            codec
                .decode(&data_refs, &parity_refs, &[1, 3], &mut out_refs)
                .unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
