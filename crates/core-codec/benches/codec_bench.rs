use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::lzma::{CompressionSettings, StreamWriter};
use core_codec::record::{StringTable, read_record, write_record};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::io::Write;

fn sample_tokens() -> Vec<String> {
    let alphabet = ["load", "store", "add", "mul", "jump", "call", "ret"];
    (0..512)
        .map(|i| alphabet[i % alphabet.len()].to_string())
        .collect()
}

fn bench_record_round_trip(c: &mut Criterion) {
    let tokens = sample_tokens();
    c.bench_function("record_write_read_512_tokens", |b| {
        b.iter(|| {
            let mut table = StringTable::new();
            let mut out = ByteWriter::new(Vec::new());
            write_record(&mut out, 0x42, 2, |body| {
                table.write_sequence(body, &tokens)
            })
            .unwrap();
            let bytes = out.into_inner();
            let mut input = ByteReader::new(bytes.as_slice());
            let record = read_record(&mut input).unwrap();
            let mut reader = record.reader();
            black_box(table.read_sequence(&mut reader).unwrap())
        })
    });
}

fn bench_lzma_encode(c: &mut Criterion) {
    let payload: Vec<u8> = sample_tokens().join("\n").repeat(64).into_bytes();
    let settings = CompressionSettings {
        level: 6,
        extreme: false,
        threads: 1,
    };
    c.bench_function("lzma_encode_repetitive", |b| {
        b.iter(|| {
            let mut writer = StreamWriter::new(Vec::new(), settings).unwrap();
            writer.write_all(&payload).unwrap();
            black_box(writer.finish().unwrap())
        })
    });
}

criterion_group!(benches, bench_record_round_trip, bench_lzma_encode);
criterion_main!(benches);
