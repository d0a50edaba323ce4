use binscript::schema::Schema;
use criterion::{criterion_group, criterion_main, Criterion};

fn gen_schema(field_count: usize) -> Schema {
    let mut script = String::new();
    for i in 0..field_count {
        script.push_str(&format!("ushort f{i}; "));
    }
    Schema::compile(&script).unwrap()
}

fn gen_packet(total_bytes: usize) -> Vec<u8> {
    // Deterministic but non-trivial pattern
    (0..total_bytes).map(|i| (i * 31 % 256) as u8).collect()
}

fn bench_compile(c: &mut Criterion) {
    let script = "long header; chunk [_]{ int length; int type; byte[length] data; int crc; }";
    c.bench_function("compile_chunked_schema", |b| {
        b.iter(|| {
            let _ = Schema::compile(script).unwrap();
        })
    });
}

fn bench_parse_flat(c: &mut Criterion) {
    for &field_count in &[1usize, 10, 50, 100] {
        let schema = gen_schema(field_count);
        let packet = gen_packet(field_count * 2);

        c.bench_function(&format!("parse_{}_fields", field_count), |b| {
            b.iter(|| {
                let _ = schema.parse(&packet).unwrap();
            })
        });
    }
}

fn bench_parse_chunked(c: &mut Criterion) {
    let schema =
        Schema::compile("long header; chunk [_]{ int length; int type; byte[length] data; int crc; }")
            .unwrap();

    let mut packet = gen_packet(8);
    for _ in 0..64 {
        packet.extend([0, 0, 0, 16]);
        packet.extend([0, 0, 0, 1]);
        packet.extend(gen_packet(16));
        packet.extend([0, 0, 0, 0]);
    }

    c.bench_function("parse_64_chunks", |b| {
        b.iter(|| {
            let _ = schema.parse(&packet).unwrap();
        })
    });
}

criterion_group!(benches, bench_compile, bench_parse_flat, bench_parse_chunked);
criterion_main!(benches);
