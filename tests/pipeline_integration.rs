//! End-to-end runs of a pipeline built from config: delivery, shutdown
//! events, error propagation and resuming from the commit log.

mod common;

use common::builders::{records, transform, PipelineFixture};
use common::{collecting_emit, wait_until};
use serde_json::json;
use std::time::Duration;
use transit::adaptor::memory::MemoryAdaptor;
use transit::error::ErrorLevel;
use transit::events::Event;
use transit::offset::{LogManager, OffsetManager};
use transit::state::{FileStore, Identifier, Store};
use transit::PipelineBuilder;

#[test]
fn test_delivers_to_every_sink_and_exits_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = MemoryAdaptor::sink();
    let b = MemoryAdaptor::sink();
    let fixture = PipelineFixture::new(MemoryAdaptor::source(records(20)))
        .sink("a", &a)
        .sink("b", &b);
    let (emit, log) = collecting_emit();

    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .emit(emit)
        .build()
        .unwrap();
    pipeline.run().unwrap();
    pipeline.stop();
    pipeline.stop();

    assert_eq!(a.written().len(), 20);
    assert_eq!(b.written().records(), records(20));

    assert_eq!(log.kinds().first(), Some(&"boot"));
    assert_eq!(log.kinds().last(), Some(&"exit"));
    assert_eq!(log.count("boot"), 1);
    assert_eq!(log.count("exit"), 1);
    assert_eq!(
        log.final_metrics(3),
        vec![
            ("in".to_string(), 20),
            ("in/a".to_string(), 20),
            ("in/b".to_string(), 20),
        ]
    );

    match &log.events()[0] {
        Event::Boot { version, endpoints, .. } => {
            assert_eq!(version, "test");
            assert_eq!(endpoints.len(), 3);
            assert_eq!(endpoints["a"], "a");
        }
        other => panic!("expected boot, got {:?}", other),
    }
}

#[test]
fn test_stop_during_run_is_graceful() {
    let dir = tempfile::tempdir().unwrap();
    let slow = MemoryAdaptor::sink().with_delay(Duration::from_millis(30));
    let fixture = PipelineFixture::new(MemoryAdaptor::source(records(200))).sink("slow", &slow);
    let (emit, log) = collecting_emit();

    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .emit(emit)
        .build()
        .unwrap();
    let result = std::thread::scope(|s| {
        let run = s.spawn(|| pipeline.run());
        assert!(wait_until(|| slow.written().len() >= 5));
        pipeline.stop();
        run.join().unwrap()
    });

    assert!(result.is_ok(), "run() after stop: {:?}", result);
    assert!(slow.written().len() < 200);
    assert_eq!(log.count("exit"), 1);
    assert_eq!(log.kinds().last(), Some(&"exit"));
    let finals = log.final_metrics(2);
    let paths: Vec<_> = finals.iter().map(|(path, _)| path.as_str()).collect();
    assert_eq!(paths, vec!["in", "in/slow"]);
    assert!(finals[1].1 < 200);
}

#[test]
fn test_transforms_shape_what_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let picked = MemoryAdaptor::sink();
    let filtered = MemoryAdaptor::sink();
    let fixture = PipelineFixture::new(MemoryAdaptor::source(records(6)))
        .sink_with("picked", &picked, vec![transform("pick", json!({"fields": ["_id"]}))])
        .sink_with(
            "filtered",
            &filtered,
            vec![transform("skip", json!({"field": "_id", "operator": "gte", "match": 4}))],
        );
    let (emit, log) = collecting_emit();

    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .emit(emit)
        .build()
        .unwrap();
    pipeline.run().unwrap();
    pipeline.stop();

    let written = picked.written().records();
    assert_eq!(written.len(), 6);
    assert!(written.iter().all(|r| r.document.len() == 1));
    let ids: Vec<_> = filtered.written().records().iter().filter_map(|r| r.id()).collect();
    assert_eq!(ids, vec!["4", "5"]);

    // Dropped records are not counted, but their offsets are committed.
    assert!(log.final_metrics(3).contains(&("in/filtered".to_string(), 2)));
    drop(pipeline);
    let offsets = LogManager::open(dir.path(), "filtered").unwrap();
    assert_eq!(offsets.offset_map().get("test.items"), Some(&5));
}

#[test]
fn test_fatal_error_stops_run() {
    let dir = tempfile::tempdir().unwrap();
    let bad = MemoryAdaptor::sink().failing(ErrorLevel::Critical);
    let fixture = PipelineFixture::new(MemoryAdaptor::source(records(5))).sink("bad", &bad);
    let (emit, log) = collecting_emit();

    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .emit(emit)
        .build()
        .unwrap();
    let err = pipeline.run().unwrap_err();
    pipeline.stop();

    let adaptor_err = err.as_adaptor().expect("adaptor error");
    assert_eq!(adaptor_err.level, ErrorLevel::Critical);
    assert_eq!(adaptor_err.path, "in/bad");

    let errors: Vec<_> = log
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Error { path, record, .. } => Some((path, record)),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "in/bad");
    assert_eq!(errors[0].1.get("_id").map(String::as_str), Some("0"));
    assert_eq!(log.count("exit"), 1);
}

#[test]
fn test_warning_does_not_stop_run() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = MemoryAdaptor::sink().failing(ErrorLevel::Warning);
    let good = MemoryAdaptor::sink();
    let fixture = PipelineFixture::new(MemoryAdaptor::source(records(4)))
        .sink("flaky", &flaky)
        .sink("good", &good);
    let (emit, log) = collecting_emit();

    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .emit(emit)
        .build()
        .unwrap();
    pipeline.run().unwrap();
    pipeline.stop();

    assert_eq!(good.written().len(), 4);
    assert!(flaky.written().is_empty());
    assert_eq!(log.count("error"), 4);
    assert_eq!(log.count("exit"), 1);
}

#[test]
fn test_restart_replays_only_missing_records() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryAdaptor::source(records(10));

    // First run: one sink, small segments so the log spans several files.
    let a = MemoryAdaptor::sink();
    let first = PipelineFixture::new(source.clone())
        .sink("a", &a)
        .state_interval_ms(20)
        .max_segment_bytes(128);
    let (emit, _) = collecting_emit();
    let pipeline = PipelineBuilder::new(first.config(dir.path()), first.registry())
        .emit(emit)
        .build()
        .unwrap();
    pipeline.run().unwrap();
    pipeline.stop();
    drop(pipeline);
    assert_eq!(a.written().len(), 10);

    let states = FileStore::open(dir.path()).unwrap().all().unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].identifier, Identifier::Int(9));

    // Second run: same source and data dir, plus a new sink. The source
    // resumes past everything it already read; `a` is up to date and `b`
    // is replayed from the commit log.
    let a2 = MemoryAdaptor::sink();
    let b = MemoryAdaptor::sink();
    let second = PipelineFixture::new(source)
        .sink("a", &a2)
        .sink("b", &b)
        .state_interval_ms(20)
        .max_segment_bytes(128);
    let (emit, log) = collecting_emit();
    let pipeline = PipelineBuilder::new(second.config(dir.path()), second.registry())
        .emit(emit)
        .build()
        .unwrap();
    assert!(pipeline.tree().root().commit_log().unwrap().segments().len() > 1);
    pipeline.run().unwrap();
    pipeline.stop();

    assert!(a2.written().is_empty());
    assert_eq!(b.written().records(), records(10));
    assert_eq!(
        log.final_metrics(3),
        vec![
            ("in".to_string(), 0),
            ("in/a".to_string(), 0),
            ("in/b".to_string(), 10),
        ]
    );

    drop(pipeline);
    let offsets = LogManager::open(dir.path(), "b").unwrap();
    assert_eq!(offsets.newest_offset(), Some(9));
}

#[test]
fn test_restart_without_state_store_skips_logged_records() {
    let dir = tempfile::tempdir().unwrap();
    let run = |source: MemoryAdaptor, sink: &MemoryAdaptor| {
        let fixture = PipelineFixture::new(source).sink("a", sink);
        let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
            .build()
            .unwrap();
        pipeline.run().unwrap();
        pipeline.stop();
        pipeline.tree().root().commit_log().unwrap().newest_offset()
    };

    let a = MemoryAdaptor::sink();
    assert_eq!(run(MemoryAdaptor::source(records(10)), &a), 10);
    assert_eq!(a.written().len(), 10);
    assert!(!dir.path().join("transit_state.json").exists());

    // Nothing new at the source: the log already holds all of it.
    let a2 = MemoryAdaptor::sink();
    assert_eq!(run(MemoryAdaptor::source(records(10)), &a2), 10);
    assert!(a2.written().is_empty());

    // Only the records after the last logged one are read.
    let a3 = MemoryAdaptor::sink();
    assert_eq!(run(MemoryAdaptor::source(records(12)), &a3), 12);
    assert_eq!(a3.written().records(), records(12)[10..].to_vec());
}

#[test]
fn test_compaction_runs_on_interval() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryAdaptor::source(records(10));
    let a = MemoryAdaptor::sink();
    let fixture = PipelineFixture::new(source.clone())
        .sink("a", &a)
        .max_segment_bytes(128);
    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .build()
        .unwrap();
    pipeline.run().unwrap();
    pipeline.stop();
    drop(pipeline);

    // Second run reads nothing new; the ticker keeps going until stop().
    let a2 = MemoryAdaptor::sink();
    let fixture = PipelineFixture::new(source)
        .sink("a", &a2)
        .max_segment_bytes(128)
        .compaction_interval_ms(5);
    let pipeline = PipelineBuilder::new(fixture.config(dir.path()), fixture.registry())
        .build()
        .unwrap();
    pipeline.run().unwrap();

    let log = pipeline.tree().root().commit_log().unwrap().clone();
    let offsets = || {
        let mut reader = log.reader_from_start();
        let mut out = Vec::new();
        while let Some((offset, _)) = reader.next_entry().unwrap() {
            out.push(offset);
        }
        out
    };
    assert!(wait_until(|| offsets().len() < 10));
    pipeline.stop();

    let kept = offsets();
    assert!(kept.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(kept.last(), Some(&9));
    assert_eq!(log.newest_offset(), 10);
    assert!(a2.written().is_empty());
}
