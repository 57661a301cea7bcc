use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use st2110_codec::{rfc4175, rtp::RtpHeader};

fn criterion_benchmark(c: &mut Criterion) {
    let mut bytes = BytesMut::with_capacity(1500);

    let rtp = RtpHeader {
        marker: false,
        payload_type: 112,
        sequence: 0,
        timestamp: 0,
        ssrc: 0x0badcafe,
    };

    let payload = rfc4175::PayloadHeader {
        ext_sequence: 0,
        row: rfc4175::RowDescriptor {
            length: 1200,
            number: 540,
            offset: 480,
            second_field: false,
            continuation: false,
        },
        second_row: None,
    };

    let mut encoded = BytesMut::with_capacity(64);
    rtp.encode(&mut encoded);
    payload.encode(&mut encoded);

    let mut headers_criterion = c.benchmark_group("headers");

    headers_criterion.throughput(Throughput::Elements(1));
    headers_criterion.bench_function("encode_st20_head", |bencher| {
        bencher.iter(|| {
            bytes.clear();
            rtp.encode(&mut bytes);
            payload.encode(&mut bytes);
        })
    });

    headers_criterion.bench_function("decode_st20_head", |bencher| {
        bencher.iter(|| {
            let rtp = RtpHeader::decode(&encoded).unwrap();
            rfc4175::PayloadHeader::decode(&encoded[RtpHeader::SIZE..]).unwrap();
            rtp
        })
    });

    headers_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
