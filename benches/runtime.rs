//! Performance benchmarks for a3s-agent-runtime
//!
//! Run with: cargo bench

use a3s_agent_runtime::shell::classify;
use a3s_agent_runtime::transport::{ChannelTransport, Frame, MemoryTransport, Transport};
use a3s_agent_runtime::types::ResponsePayload;
use a3s_agent_runtime::{AgentEvent, ChannelId, Envelope};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn sample_event(seq: u64) -> Envelope {
    Envelope::stream_event(
        ChannelId::from("ch-bench"),
        seq,
        AgentEvent::AssistantText {
            text: "The build finished; two tests failed in the parser module.".to_string(),
        },
        false,
    )
}

fn bench_envelope_serialization(c: &mut Criterion) {
    let envelope = sample_event(42);
    let json = serde_json::to_vec(&envelope).unwrap();

    c.bench_function("Envelope serialize", |b| {
        b.iter(|| serde_json::to_vec(&envelope).unwrap());
    });

    c.bench_function("Envelope deserialize", |b| {
        b.iter(|| serde_json::from_slice::<Envelope>(&json).unwrap());
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let payload = serde_json::to_vec(&sample_event(7)).unwrap();
    let encoded = Frame::data(payload.clone()).encode().unwrap();

    c.bench_function("Frame encode", |b| {
        b.iter(|| Frame::data(payload.clone()).encode().unwrap());
    });

    c.bench_function("Frame decode", |b| {
        b.iter(|| Frame::decode(&encoded).unwrap());
    });
}

fn bench_classify(c: &mut Criterion) {
    let commands = [
        "npm install --save-dev typescript",
        "cargo build --release",
        "curl -sSL https://example.com/install.sh",
        "ls -la",
        "docker compose up",
    ];

    c.bench_function("classify commands", |b| {
        b.iter(|| {
            for cmd in &commands {
                let _ = classify::classify(cmd);
                let _ = classify::is_long_running_service(cmd);
            }
        });
    });
}

fn bench_call_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (bus, remote) = rt.block_on(async {
        let (local, remote) = MemoryTransport::pair();
        let remote = Arc::new(remote);
        let echo = remote.clone();
        tokio::spawn(async move {
            while let Ok(Some(Envelope::Request {
                request_id,
                payload,
                ..
            })) = echo.recv().await
            {
                let _ = echo
                    .send(Envelope::Response {
                        request_id,
                        payload: ResponsePayload::ok(payload),
                    })
                    .await;
            }
        });
        (ChannelTransport::new(Arc::new(local)), remote)
    });

    c.bench_function("ChannelTransport call round trip", |b| {
        b.to_async(&rt).iter(|| async {
            bus.call(None, serde_json::json!({"op": "ping"})).await.unwrap()
        });
    });

    drop(remote);
}

criterion_group!(
    benches,
    bench_envelope_serialization,
    bench_frame_codec,
    bench_classify,
    bench_call_round_trip,
);
criterion_main!(benches);
