use keyshard_core::ShardConfig;
use keyshard_crypto::{decrypt_from, encrypt_to, join, split_with, Keypair};

fn make_secret(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn quorum(total_shards: u8) -> ShardConfig {
    ShardConfig::new((total_shards / 2 + 1).min(5), total_shards).unwrap()
}

#[divan::bench(args = [3, 5, 10])]
fn bench_split(bencher: divan::Bencher, total_shards: u8) {
    let config = quorum(total_shards);
    let secret = make_secret(64);
    bencher
        .counter(divan::counter::BytesCount::new(secret.len()))
        .bench(|| split_with(divan::black_box(&secret), divan::black_box(&config)).unwrap());
}

#[divan::bench(args = [3, 5, 10])]
fn bench_join(bencher: divan::Bencher, total_shards: u8) {
    let config = quorum(total_shards);
    let shards = split_with(&make_secret(64), &config).unwrap();
    bencher.bench(|| join(divan::black_box(&shards), config.threshold()).unwrap());
}

#[divan::bench(args = [256, 4096])]
fn bench_encrypt_to(bencher: divan::Bencher, size: usize) {
    let sender = Keypair::try_generate().unwrap();
    let recipient = Keypair::try_generate().unwrap().public();
    let data = make_secret(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            encrypt_to(
                divan::black_box(&sender),
                divan::black_box(&recipient),
                divan::black_box(&data),
            )
            .unwrap()
        });
}

#[divan::bench(args = [256, 4096])]
fn bench_decrypt_from(bencher: divan::Bencher, size: usize) {
    let sender = Keypair::try_generate().unwrap();
    let recipient = Keypair::try_generate().unwrap();
    let ciphertext = encrypt_to(&sender, &recipient.public(), &make_secret(size)).unwrap();
    let sender_pub = sender.public();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            decrypt_from(
                divan::black_box(&recipient),
                divan::black_box(&sender_pub),
                divan::black_box(&ciphertext),
            )
            .unwrap()
        });
}

fn main() {
    divan::main();
}
