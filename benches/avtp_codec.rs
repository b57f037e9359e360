use avb_streamer::avtp::{
    is_avtp_packet, AvtpPacket, CrfPull, CrfType, PacketTemplate, TalkerFormat, TS_PACKET_SIZE,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn mpegts_frame() -> Vec<u8> {
    let mut template = PacketTemplate::new(TalkerFormat::Mpegts);
    template.write_static_header();
    template.set_stream_id_valid(true);
    template.set_stream_id(0x0011_2233_4455_0001);
    template.set_packet_size(7).unwrap();
    template.set_dynamic_header(0x1234_5678);
    template.fill_payload(&[0x47; 7 * TS_PACKET_SIZE], 7).unwrap();
    template.as_frame().to_vec()
}

fn crf_frame() -> Vec<u8> {
    let mut template = PacketTemplate::new(TalkerFormat::Crf {
        crf_type: CrfType::AudioSample,
        pull: CrfPull::One,
        base_frequency: 48_000,
        timestamp_interval: 160,
    });
    template.write_static_header();
    template.set_packet_size(6).unwrap();
    template.set_dynamic_header(0);
    let timestamps: Vec<u8> = (0..6u64)
        .flat_map(|i| (1_000_000 + i * 3_333_333).to_be_bytes())
        .collect();
    template.fill_payload(&timestamps, 6).unwrap();
    template.as_frame().to_vec()
}

fn parse_benchmark(c: &mut Criterion) {
    let frame = mpegts_frame();
    let mut out = vec![0u8; 2048];

    let mut group = c.benchmark_group("mpegts");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("is_avtp_packet", |b| {
        b.iter(|| is_avtp_packet(black_box(&frame)))
    });
    group.bench_function("parse_and_extract", |b| {
        b.iter(|| {
            let packet = AvtpPacket::parse(black_box(&frame)).unwrap();
            packet.extract_payload(&mut out).unwrap()
        })
    });
    group.finish();

    let crf = crf_frame();
    c.bench_function("crf_first_timestamp", |b| {
        b.iter(|| {
            let packet = AvtpPacket::parse(black_box(&crf)).unwrap();
            packet.crf_timestamps().next()
        })
    });
}

fn build_benchmark(c: &mut Criterion) {
    let mut template = PacketTemplate::new(TalkerFormat::Mpegts);
    template.write_static_header();
    template.set_packet_size(7).unwrap();
    let source = vec![0x47u8; 7 * TS_PACKET_SIZE];
    let mut pts = 0u32;

    c.bench_function("mpegts_fill_frame", |b| {
        b.iter(|| {
            pts = pts.wrapping_add(250_000);
            template.set_dynamic_header(pts);
            template.fill_payload(black_box(&source), 7).unwrap()
        })
    });
}

criterion_group!(benches, parse_benchmark, build_benchmark);
criterion_main!(benches);
