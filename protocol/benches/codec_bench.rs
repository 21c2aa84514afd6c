// Wire codec benchmarks for the Bazaar protocol.
//
// Covers envelope encode/decode for small liveness messages, signed offer
// announcements and large trade messages, plus framed stream decoding.

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

use bazaar_protocol::config::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use bazaar_protocol::crypto::NodeKeypair;
use bazaar_protocol::network::codec::{decode_envelope, encode_envelope};
use bazaar_protocol::network::{
    Envelope, EnvelopeCodec, InboundFrame, Message, NodeAddress, TradeMessage, TradePayload,
};
use bazaar_protocol::offer::overlay::sign_add;
use bazaar_protocol::offer::{Offer, OfferDirection, OfferPayload, Price};
use bazaar_protocol::payment::{PaymentAccount, PaymentMethod};

fn sample_offer(keypair: &NodeKeypair) -> Offer {
    Offer::new(OfferPayload {
        id: "5a0e6c1e-bench-offer".into(),
        direction: OfferDirection::Sell,
        base_currency: "BTC".into(),
        counter_currency: "EUR".into(),
        created_at: 1_700_000_000_000,
        protocol_version: PROTOCOL_VERSION,
        maker_address: NodeAddress::localhost(9860),
        maker_pub_key: keypair.public_key(),
        min_amount: 50_000,
        amount: 100_000,
        price: Price::Fixed(6_000_000),
        payment_method: PaymentMethod::Sepa,
        accepted_country_codes: Some(vec!["DE".into(), "FR".into(), "AT".into()]),
        accepted_bank_ids: None,
        arbitrators: vec![NodeAddress::localhost(9870)],
        security_deposit: 20_000,
        offer_fee_tx_id: Some("f".repeat(64)),
    })
}

fn deposit_request(size: usize) -> Message {
    Message::Trade(TradeMessage {
        trade_id: "5a0e6c1e-bench-offer".into(),
        sender: NodeAddress::localhost(9860),
        uid: "b3a1".into(),
        payload: TradePayload::PublishDepositTxRequest {
            maker_payout_address: "bz1qbenchpayoutaddress".into(),
            maker_payment_account: PaymentAccount {
                id: "sepa-main".into(),
                method: PaymentMethod::Sepa,
                holder_name: "Bench Holder".into(),
                currencies: vec!["EUR".into()],
                country_code: Some("DE".into()),
                bank_id: None,
            },
            prepared_deposit_tx: vec![0xab; size],
        },
    })
}

fn messages() -> Vec<(&'static str, Envelope)> {
    let keypair = NodeKeypair::generate();
    let offer = sample_offer(&keypair);
    vec![
        ("ping", Envelope::new(PROTOCOL_VERSION, Message::Ping { nonce: 42 })),
        (
            "add_offer",
            Envelope::new(PROTOCOL_VERSION, Message::AddOffer(sign_add(&keypair, &offer, 1))),
        ),
        (
            "deposit_request_4k",
            Envelope::new(PROTOCOL_VERSION, deposit_request(4 * 1024)),
        ),
        (
            "deposit_request_64k",
            Envelope::new(PROTOCOL_VERSION, deposit_request(64 * 1024)),
        ),
    ]
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/encode");
    for (name, envelope) in messages() {
        let size = encode_envelope(&envelope, MAX_MESSAGE_SIZE).unwrap().len();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &envelope, |b, env| {
            b.iter(|| encode_envelope(env, MAX_MESSAGE_SIZE).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/decode");
    for (name, envelope) in messages() {
        let bytes = encode_envelope(&envelope, MAX_MESSAGE_SIZE).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| decode_envelope(bytes, MAX_MESSAGE_SIZE).unwrap());
        });
    }
    group.finish();
}

fn bench_framed_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/framed_stream");
    for count in [10usize, 100, 1_000] {
        let mut encoder = EnvelopeCodec::new(MAX_MESSAGE_SIZE);
        let mut stream = BytesMut::new();
        for i in 0..count {
            let envelope = Envelope::new(PROTOCOL_VERSION, Message::Ping { nonce: i as u64 });
            encoder.encode(envelope, &mut stream).unwrap();
        }
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut codec = EnvelopeCodec::new(MAX_MESSAGE_SIZE);
                let mut buf = stream.clone();
                let mut decoded = 0;
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    if let InboundFrame::Envelope { .. } = frame {
                        decoded += 1;
                    }
                }
                assert_eq!(decoded, count);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_framed_stream);
criterion_main!(benches);
