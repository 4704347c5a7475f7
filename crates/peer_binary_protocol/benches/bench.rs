use criterion::{Criterion, criterion_group, criterion_main};
use peerswarm_peer_protocol::{Message, MessageBorrowed, Piece, Request};

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut request = Vec::new();
    Message::<&[u8]>::Request(Request::new(1, 16384, 16384)).serialize(&mut request);

    let block = vec![42u8; 16384];
    let mut piece = Vec::new();
    Message::<&[u8]>::Piece(Piece::from_data(1, 16384, &block[..])).serialize(&mut piece);

    c.bench_function("Message::deserialize request", |b| {
        b.iter(|| std::hint::black_box(MessageBorrowed::deserialize(&request)))
    });

    c.bench_function("Message::deserialize piece", |b| {
        b.iter(|| std::hint::black_box(MessageBorrowed::deserialize(&piece)))
    });

    c.bench_function("Message::serialize piece", |b| {
        let mut out = Vec::with_capacity(piece.len());
        b.iter(|| {
            out.clear();
            Message::<&[u8]>::Piece(Piece::from_data(1, 16384, &block[..])).serialize(&mut out);
            std::hint::black_box(&out);
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
