/// EventQueue benchmarks using Criterion
///
/// Run with: cargo bench --bench event_queue_benchmark
///
/// - publish + drain throughput with mixed priorities
/// - async consumer fed by several producers
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vigil_core::event::{VisionAnalysis, VoiceInput};
use vigil_core::{AnalysisEvent, BehaviorCode, EventQueue};

fn make_event(i: u64) -> AnalysisEvent {
    if i % 4 == 0 {
        AnalysisEvent::Voice(VoiceInput {
            text: format!("utterance {i}"),
            tags: vec![],
            timestamp_ms: i as i64,
            placeholder_id: None,
        })
    } else {
        AnalysisEvent::Vision(VisionAnalysis {
            text: format!("observation {i}"),
            code: BehaviorCode::Work,
            image_urls: vec![],
            display_frame: None,
            timestamp_ms: i as i64,
            placeholder_id: None,
        })
    }
}

fn bench_publish_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_queue_publish_drain");
    for count in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let q = EventQueue::new();
                for i in 0..count {
                    q.publish(make_event(i));
                }
                let mut drained = 0;
                while let Some(item) = q.try_recv() {
                    black_box(item.seq);
                    drained += 1;
                }
                assert_eq!(drained, count);
            });
        });
    }
    group.finish();
}

fn bench_concurrent_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_queue_concurrent_producers");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for producers in [2u64, 4, 8] {
        let per_producer = 500u64;
        group.throughput(Throughput::Elements(producers * per_producer));
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    rt.block_on(async {
                        let q = EventQueue::new();
                        let consumer = {
                            let q = q.clone();
                            tokio::spawn(async move {
                                let mut n = 0u64;
                                while q.recv().await.is_some() {
                                    n += 1;
                                }
                                n
                            })
                        };
                        let mut handles = Vec::new();
                        for p in 0..producers {
                            let q = q.clone();
                            handles.push(tokio::spawn(async move {
                                for i in 0..per_producer {
                                    q.publish(make_event(p * per_producer + i));
                                }
                            }));
                        }
                        for h in handles {
                            h.await.unwrap();
                        }
                        q.close();
                        let n = consumer.await.unwrap();
                        assert_eq!(n, producers * per_producer);
                    })
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_publish_drain, bench_concurrent_producers);
criterion_main!(benches);
