use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::Ipv4Addr;

use netsentry::packet::{proto, Ipv4Header, Ipv4Packet, TcpFlags, TcpSegment, Transport};

fn syn_packet(payload: usize) -> Vec<u8> {
    let ip = Ipv4Header {
        version: 4,
        ihl: 5,
        dscp: 0,
        ecn: 0,
        total_length: 0,
        identification: 0x1234,
        reserved_flag: false,
        dont_fragment: true,
        more_fragments: false,
        fragment_offset: 0,
        ttl: 64,
        protocol: proto::TCP,
        checksum: 0,
        computed_checksum: 0,
        source: Ipv4Addr::new(10, 1, 10, 1),
        destination: Ipv4Addr::new(93, 184, 216, 34),
        options: Vec::new(),
    };
    let tcp = TcpSegment {
        source_port: 40000,
        destination_port: 443,
        sequence: 1000,
        acknowledgement: 0,
        data_offset: 5,
        reserved: 0,
        flags: TcpFlags::SYN | TcpFlags::ACK,
        window: 65535,
        checksum: 0,
        computed_checksum: 0,
        urgent_pointer: 0,
        options: Vec::new(),
        payload: vec![0xab; payload],
    };
    Ipv4Packet {
        ip,
        transport: Transport::Tcp(tcp),
    }
    .encode()
    .to_vec()
}

fn bench_decode(c: &mut Criterion) {
    let small = syn_packet(0);
    let large = syn_packet(1400);

    c.bench_function("decode_tcp_syn", |b| {
        b.iter(|| black_box(Ipv4Packet::decode(black_box(&small))));
    });

    c.bench_function("decode_validate_tcp_1400", |b| {
        b.iter(|| {
            let packet = Ipv4Packet::decode(black_box(&large)).unwrap();
            black_box(packet.validate())
        });
    });

    let decoded = Ipv4Packet::decode(&large).unwrap();
    c.bench_function("encode_tcp_1400", |b| {
        b.iter(|| black_box(decoded.encode()));
    });
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
