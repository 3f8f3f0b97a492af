use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tun_gateway::packet::{ipv4, tcp};

fn sample_ipv4_tcp_packet() -> Vec<u8> {
    let payload = vec![0x41u8; 512];
    let tcp_hdr = tcp::TcpHeader {
        src_port: 54321,
        dst_port: 443,
        seq: 1,
        ack: 1,
        data_offset: 5,
        flags: tcp::TcpFlags {
            fin: false,
            syn: false,
            rst: false,
            psh: true,
            ack: true,
            urg: false,
        },
        window: 65535,
        checksum: 0,
        urgent_pointer: 0,
        options: tcp::TcpOptions::default(),
    };
    let mut tcp_bytes = vec![0u8; 20];
    let pseudo = tun_gateway::packet::checksum::ipv4_pseudo_header(
        "10.0.0.2".parse().unwrap(),
        "10.0.0.1".parse().unwrap(),
        6,
        (20 + payload.len()) as u16,
    );
    tcp_hdr.serialize(&mut tcp_bytes, &pseudo, &payload);

    let ip_hdr = ipv4::Ipv4Header {
        ihl: 5,
        tos: 0,
        total_length: (20 + 20 + payload.len()) as u16,
        identification: 7,
        flags: 0,
        fragment_offset: 0,
        ttl: 64,
        protocol: 6,
        checksum: 0,
        src: "10.0.0.1".parse().unwrap(),
        dst: "10.0.0.2".parse().unwrap(),
        options: vec![],
    };
    let mut ip_bytes = vec![0u8; 20];
    ip_hdr.serialize(&mut ip_bytes);

    let mut packet = ip_bytes;
    packet.extend_from_slice(&tcp_bytes);
    packet.extend_from_slice(&payload);
    packet
}

fn bench_parse_ip(c: &mut Criterion) {
    let packet = sample_ipv4_tcp_packet();
    c.bench_function("parse_ip/ipv4+tcp/512B payload", |b| {
        b.iter(|| {
            let (hdr, rest) = tun_gateway::packet::parse_ip(black_box(&packet)).unwrap();
            black_box((hdr, rest));
        });
    });
}

fn bench_checksum(c: &mut Criterion) {
    let payload = vec![0xABu8; 1460];
    let pseudo = tun_gateway::packet::checksum::ipv4_pseudo_header(
        "10.0.0.2".parse().unwrap(),
        "10.0.0.1".parse().unwrap(),
        6,
        payload.len() as u16,
    );
    c.bench_function("checksum_with_pseudo_header/1460B", |b| {
        b.iter(|| {
            black_box(tun_gateway::packet::checksum::checksum_with_pseudo_header(
                black_box(&pseudo),
                black_box(&payload),
            ));
        });
    });
}

criterion_group!(benches, bench_parse_ip, bench_checksum);
criterion_main!(benches);
