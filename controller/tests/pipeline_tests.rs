//! Integration tests for the pipeline control layer.
//!
//! These run against the loopback engine so they need no GStreamer
//! installation.

use crossbeam_channel::{unbounded, Receiver};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use streamctl::engine::{Engine, LoopbackEngine};
use streamctl::pipeline::{ExclusiveArbiter, ResourceArbiter};
use streamctl::{
    check_element_availability, register_custom_condition, register_custom_filter, Capability,
    ElementKind, Pipeline, PipelineBuilder, PipelineError, PipelineEvent, PipelineState,
    PropertyValue, PushMode, SourceCallbacks, TensorInfo, TensorType, TensorsData, TensorsInfo,
};
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

const SRC_TO_SINK: &str =
    "appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! queue ! appsink name=sink";

/// Helper to create a loopback engine usable both as the trait object and
/// through its test hooks.
fn loopback() -> (Arc<LoopbackEngine>, Arc<dyn Engine>) {
    let loopback = Arc::new(LoopbackEngine::new());
    let engine: Arc<dyn Engine> = loopback.clone();
    (loopback, engine)
}

fn construct(description: &str) -> Pipeline {
    let (_, engine) = loopback();
    Pipeline::construct(&engine, description).unwrap()
}

fn play(pipeline: &Pipeline) {
    pipeline.start().unwrap();
    pipeline.wait_state(PipelineState::Playing, WAIT).unwrap();
}

/// Forward everything reaching `sink` into a channel.
fn collect_sink(pipeline: &Pipeline, sink: &str) -> Receiver<TensorsData> {
    let (tx, rx) = unbounded();
    pipeline
        .get_element(sink)
        .unwrap()
        .attach_sink_callback(move |data| {
            let _ = tx.send(data.clone());
            Ok(())
        })
        .unwrap();
    rx
}

fn uint8_info(len: u32) -> TensorsInfo {
    TensorsInfo::single(TensorInfo::new(TensorType::Uint8, vec![len]))
}

// ============================================================================
// Construction and teardown
// ============================================================================

#[test]
fn test_construct_reaches_ready() {
    let pipeline = construct(SRC_TO_SINK);

    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert_eq!(pipeline.pending_state(), None);
    assert_eq!(pipeline.description(), SRC_TO_SINK);
    assert_eq!(
        pipeline.element_names(),
        vec!["sink".to_string(), "src".to_string()]
    );

    pipeline.destroy().unwrap();
}

#[test]
fn test_construct_rejects_bad_descriptions() {
    let (_, engine) = loopback();

    assert!(matches!(
        Pipeline::construct(&engine, ""),
        Err(PipelineError::InvalidParameter(_))
    ));
    assert!(matches!(
        Pipeline::construct(&engine, "appsrc ! no_such_factory"),
        Err(PipelineError::PluginUnavailable(_))
    ));
    assert!(matches!(
        Pipeline::construct(&engine, "appsrc ! ! appsink"),
        Err(PipelineError::Construction(_))
    ));
}

#[test]
fn test_construct_rejects_oversized_caps() {
    let (loopback, engine) = loopback();
    assert!(matches!(
        Pipeline::construct(
            &engine,
            "appsrc caps=other/tensor,dimension=4294967295:4294967295:4294967295,type=float64 \
             ! appsink",
        ),
        Err(PipelineError::Construction(_))
    ));
    assert_eq!(loopback.graph_count(), 0);
}

#[test]
fn test_construct_destroy_is_leak_free() {
    let (loopback, engine) = loopback();
    let arbiter = Arc::new(ExclusiveArbiter::new());

    for _ in 0..20 {
        let pipeline = PipelineBuilder::new(SRC_TO_SINK)
            .resource("camera")
            .arbiter(arbiter.clone())
            .build(&engine)
            .unwrap();
        assert_eq!(arbiter.holder("camera"), Some(pipeline.id()));
        let _rx = collect_sink(&pipeline, "sink");
        play(&pipeline);

        pipeline.destroy().unwrap();
        assert!(pipeline.is_destroyed());
        assert_eq!(arbiter.holder("camera"), None);
    }
    assert_eq!(loopback.graph_count(), 0);
}

#[test]
fn test_dropping_last_handle_tears_down() {
    let (loopback, engine) = loopback();
    let pipeline = Pipeline::construct(&engine, SRC_TO_SINK).unwrap();
    assert_eq!(loopback.graph_count(), 1);

    drop(pipeline);
    assert_eq!(loopback.graph_count(), 0);
}

#[test]
fn test_failed_construction_releases_resources() {
    let (_, engine) = loopback();
    let arbiter = Arc::new(ExclusiveArbiter::new());

    let result = PipelineBuilder::new("appsrc ! no_such_factory")
        .resource("npu")
        .arbiter(arbiter.clone())
        .build(&engine);
    assert!(matches!(result, Err(PipelineError::PluginUnavailable(_))));
    assert_eq!(arbiter.holder("npu"), None);
}

#[test]
fn test_exclusive_resource_is_refused_to_second_pipeline() {
    let (_, engine) = loopback();
    let arbiter = Arc::new(ExclusiveArbiter::new());
    let build = || {
        PipelineBuilder::new(SRC_TO_SINK)
            .resource("camera")
            .arbiter(arbiter.clone())
            .build(&engine)
    };

    let first = build().unwrap();
    assert!(matches!(build(), Err(PipelineError::Resource(_))));

    first.destroy().unwrap();
    let second = build().unwrap();
    second.destroy().unwrap();
}

#[test]
fn test_registered_resources_follow_pipeline() {
    let pipeline = construct(SRC_TO_SINK);
    let arbiter = ExclusiveArbiter::new();

    let handle = arbiter.acquire("gpu", pipeline.id()).unwrap();
    pipeline.register_resource("gpu", handle).unwrap();
    assert_eq!(pipeline.resource_types(), vec!["gpu".to_string()]);

    let duplicate = ExclusiveArbiter::new().acquire("gpu", pipeline.id()).unwrap();
    assert!(matches!(
        pipeline.register_resource("gpu", duplicate),
        Err(PipelineError::InvalidParameter(_))
    ));

    pipeline.release_all_resources();
    assert!(pipeline.resource_types().is_empty());
    assert_eq!(arbiter.holder("gpu"), None);

    let handle = arbiter.acquire("gpu", pipeline.id()).unwrap();
    pipeline.register_resource("gpu", handle).unwrap();
    pipeline.destroy().unwrap();
    assert_eq!(arbiter.holder("gpu"), None);
}

#[test]
fn test_destroy_twice_is_harmless() {
    let pipeline = construct(SRC_TO_SINK);
    let clone = pipeline.clone();

    pipeline.destroy().unwrap();
    clone.destroy().unwrap();
}

#[test]
fn test_operations_after_destroy_fail() {
    let pipeline = construct(SRC_TO_SINK);
    let src = pipeline.get_element("src").unwrap();
    pipeline.destroy().unwrap();

    assert!(matches!(
        pipeline.get_element("src"),
        Err(PipelineError::InvalidState(_))
    ));
    assert!(matches!(
        pipeline.set_state(PipelineState::Playing),
        Err(PipelineError::InvalidState(_))
    ));
    assert!(src.push(TensorsData::single(vec![1, 2, 3, 4])).is_err());
    assert!(src
        .attach_source_feed(SourceCallbacks::new())
        .is_err());
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn test_state_notifications_in_order() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            if let PipelineEvent::StateChanged { new, .. } = event {
                let _ = tx.send(*new);
            }
            Ok(())
        })
        .unwrap();

    for target in [
        PipelineState::Playing,
        PipelineState::Paused,
        PipelineState::Ready,
        PipelineState::Null,
    ] {
        pipeline.set_state(target).unwrap();
        pipeline.wait_state(target, WAIT).unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        seen.push(rx.recv_timeout(WAIT).unwrap());
    }
    assert_eq!(
        seen,
        vec![
            PipelineState::Paused,
            PipelineState::Playing,
            PipelineState::Paused,
            PipelineState::Ready,
            PipelineState::Null,
        ]
    );
    assert!(rx.recv_timeout(QUIET).is_err());

    pipeline.destroy().unwrap();
}

#[test]
fn test_set_state_to_current_is_noop() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        })
        .unwrap();

    pipeline.set_state(PipelineState::Ready).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
    pipeline.destroy().unwrap();
}

#[test]
fn test_pending_transition_policy() {
    let loopback = Arc::new(LoopbackEngine::new().with_transition_delay(Duration::from_millis(60)));
    let engine: Arc<dyn Engine> = loopback.clone();
    let pipeline = Pipeline::construct(&engine, SRC_TO_SINK).unwrap();

    pipeline.set_state(PipelineState::Playing).unwrap();
    assert_eq!(pipeline.pending_state(), Some(PipelineState::Playing));

    // Same target again is accepted, a different one has to wait
    pipeline.set_state(PipelineState::Playing).unwrap();
    let err = pipeline.set_state(PipelineState::Null).unwrap_err();
    assert!(err.is_transient());

    pipeline.wait_state(PipelineState::Playing, WAIT).unwrap();
    let deadline = std::time::Instant::now() + WAIT;
    while pipeline.pending_state().is_some() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pipeline.pending_state(), None);

    pipeline.set_state(PipelineState::Paused).unwrap();
    pipeline.wait_state(PipelineState::Paused, WAIT).unwrap();
    pipeline.destroy().unwrap();
    assert_eq!(loopback.graph_count(), 0);
}

#[test]
fn test_wait_state_times_out() {
    let engine: Arc<dyn Engine> =
        Arc::new(LoopbackEngine::new().with_transition_delay(Duration::from_millis(500)));
    let pipeline = Pipeline::construct(&engine, SRC_TO_SINK).unwrap();

    pipeline.set_state(PipelineState::Playing).unwrap();
    let err = pipeline
        .wait_state(PipelineState::Playing, Duration::from_millis(20))
        .unwrap_err();
    assert!(matches!(err, PipelineError::TryAgain(_)));

    pipeline.destroy().unwrap();
}

#[test]
fn test_engine_error_is_terminal() {
    let (loopback, engine) = loopback();
    let pipeline = Pipeline::construct(&engine, SRC_TO_SINK).unwrap();
    let mut events = pipeline.subscribe_events();

    loopback.post_error("device lost");
    let err = pipeline
        .wait_state(PipelineState::Playing, WAIT)
        .unwrap_err();
    assert!(matches!(err, PipelineError::ErrorState(_)));
    assert_eq!(pipeline.fault().as_deref(), Some("device lost"));

    assert!(matches!(
        pipeline.get_element("src"),
        Err(PipelineError::ErrorState(_))
    ));
    assert!(matches!(
        pipeline.set_state(PipelineState::Playing),
        Err(PipelineError::ErrorState(_))
    ));

    let event = loop {
        let event = events.blocking_recv().unwrap();
        if let PipelineEvent::Error { .. } = event {
            break event;
        }
    };
    assert!(matches!(event, PipelineEvent::Error { ref error, .. } if error == "device lost"));
    assert!(event.is_terminal());

    pipeline.destroy().unwrap();
    assert_eq!(loopback.graph_count(), 0);
}

#[test]
fn test_flush_drops_queued_data_and_restarts() {
    let pipeline = construct(SRC_TO_SINK);
    let rx = collect_sink(&pipeline, "sink");
    let src = pipeline.get_element("src").unwrap();

    pipeline.set_state(PipelineState::Paused).unwrap();
    pipeline.wait_state(PipelineState::Paused, WAIT).unwrap();
    src.push(TensorsData::single(vec![9, 9, 9, 9])).unwrap();

    pipeline.flush(true).unwrap();
    pipeline.wait_state(PipelineState::Playing, WAIT).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());

    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().tensors, vec![vec![1, 2, 3, 4]]);
    pipeline.destroy().unwrap();
}

// ============================================================================
// Elements
// ============================================================================

#[test]
fn test_element_lookup() {
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! identity name=id ! appsink name=sink",
    );

    let src = pipeline.get_element("src").unwrap();
    assert_eq!(src.kind(), ElementKind::AppSrc);
    assert_eq!(src.name(), "src");

    // Common elements are looked up lazily, the handle is then shared
    let id = pipeline.get_element("id").unwrap();
    assert_eq!(id.kind(), ElementKind::Common);
    let again = pipeline.get_element("id").unwrap();
    id.set_property("silent", true).unwrap();
    assert_eq!(again.property("silent").unwrap(), PropertyValue::Bool(true));

    assert!(matches!(
        pipeline.get_element("missing"),
        Err(PipelineError::NotFound(_))
    ));
    assert!(matches!(
        pipeline.get_element(""),
        Err(PipelineError::InvalidParameter(_))
    ));
    assert!(matches!(
        pipeline.get_element_as("sink", Capability::Source),
        Err(PipelineError::TypeMismatch { .. })
    ));
    assert!(pipeline.get_element_as("sink", Capability::Sink).is_ok());
    assert!(pipeline.get_element_as("id", Capability::Any).is_ok());

    pipeline.destroy().unwrap();
}

#[test]
fn test_properties() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();

    sink.set_property("sync", false).unwrap();
    assert_eq!(sink.property("sync").unwrap(), PropertyValue::Bool(false));
    assert!(matches!(
        sink.set_property("no-such-property", 1u64),
        Err(PipelineError::InvalidParameter(_))
    ));
    assert!(matches!(
        sink.property("no-such-property"),
        Err(PipelineError::InvalidParameter(_))
    ));
    assert_eq!(
        sink.property("name").unwrap(),
        PropertyValue::String("sink".to_string())
    );

    pipeline.destroy().unwrap();
}

#[test]
fn test_metadata_of_negotiated_stream() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();

    assert_eq!(sink.tensors_info().unwrap(), Some(uint8_info(4)));
    assert!(!sink.is_media().unwrap());
    assert_eq!(sink.buffer_size().unwrap(), Some(4));

    let media = construct("appsrc name=src caps=video/x-raw ! appsink name=sink");
    let sink = media.get_element("sink").unwrap();
    assert!(sink.is_media().unwrap());
    assert_eq!(sink.tensors_info().unwrap(), None);

    pipeline.destroy().unwrap();
    media.destroy().unwrap();
}

#[test]
fn test_remove_element_runs_destroy_hook() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = destroyed.clone();
    sink.set_custom_destroy(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    pipeline.remove_element("sink").unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        sink.attach_sink_callback(|_| Ok(())),
        Err(PipelineError::NotFound(_))
    ));
    assert!(matches!(
        pipeline.remove_element("sink"),
        Err(PipelineError::NotFound(_))
    ));

    // A fresh handle can be looked up again
    let sink = pipeline.get_element("sink").unwrap();
    assert_eq!(sink.client_count(), 0);

    pipeline.destroy().unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_hook_runs_on_teardown() {
    let pipeline = construct(SRC_TO_SINK);
    let destroyed = Arc::new(AtomicBool::new(false));
    let flag = destroyed.clone();
    pipeline
        .get_element("src")
        .unwrap()
        .set_custom_destroy(move || flag.store(true, Ordering::SeqCst))
        .unwrap();

    pipeline.destroy().unwrap();
    assert!(destroyed.load(Ordering::SeqCst));
}

#[test]
fn test_concurrent_lookup_and_destroy() {
    for _ in 0..10 {
        let pipeline = construct(SRC_TO_SINK);
        let worker = {
            let pipeline = pipeline.clone();
            thread::spawn(move || loop {
                match pipeline.get_element("sink") {
                    Ok(sink) => {
                        let _ = sink.client_count();
                    }
                    Err(e) => return e,
                }
            })
        };

        thread::sleep(Duration::from_millis(5));
        pipeline.destroy().unwrap();
        let err = worker.join().unwrap();
        assert!(matches!(
            err,
            PipelineError::InvalidState(_) | PipelineError::NotFound(_)
        ));
    }
}

// ============================================================================
// Data flow
// ============================================================================

#[test]
fn test_push_reaches_sink_callback() {
    let pipeline = construct(SRC_TO_SINK);
    let rx = collect_sink(&pipeline, "sink");
    play(&pipeline);

    pipeline
        .get_element("src")
        .unwrap()
        .push(TensorsData::single(vec![1, 2, 3, 4]))
        .unwrap();

    let data = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data.tensors, vec![vec![1, 2, 3, 4]]);
    assert_eq!(data.info, Some(uint8_info(4)));
    assert_eq!(data.total_size(), 4);

    pipeline.destroy().unwrap();
}

#[test]
fn test_push_preconditions() {
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! valve name=v ! appsink name=sink",
    );
    let src = pipeline.get_element("src").unwrap();

    assert!(matches!(
        pipeline
            .get_element("sink")
            .unwrap()
            .push(TensorsData::single(vec![1, 2, 3, 4])),
        Err(PipelineError::NotSupported(_))
    ));
    assert!(matches!(
        pipeline
            .get_element("v")
            .unwrap()
            .push(TensorsData::single(vec![1, 2, 3, 4])),
        Err(PipelineError::NotSupported(_))
    ));

    // READY does not accept data
    assert!(matches!(
        src.push(TensorsData::single(vec![1, 2, 3, 4])),
        Err(PipelineError::InvalidState(_))
    ));

    pipeline.set_state(PipelineState::Paused).unwrap();
    pipeline.wait_state(PipelineState::Paused, WAIT).unwrap();

    assert!(matches!(
        src.push(TensorsData::default()),
        Err(PipelineError::InvalidParameter(_))
    ));
    assert!(matches!(
        src.push(TensorsData::new(vec![vec![0u8; 4]; 17])),
        Err(PipelineError::InvalidParameter(_))
    ));
    assert!(matches!(
        src.push(TensorsData::single(vec![1, 2, 3])),
        Err(PipelineError::TypeMismatch { .. })
    ));
    assert!(matches!(
        src.push(TensorsData::new(vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]])),
        Err(PipelineError::TypeMismatch { .. })
    ));
    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();

    pipeline.destroy().unwrap();
}

#[test]
fn test_flexible_stream_takes_given_metadata() {
    let pipeline =
        construct("appsrc name=src caps=other/tensors,format=flexible ! appsink name=sink");
    let rx = collect_sink(&pipeline, "sink");
    let src = pipeline.get_element("src").unwrap();
    play(&pipeline);

    // Without any metadata the shape of the data is unknown
    assert!(matches!(
        src.push(TensorsData::single(vec![1, 2])),
        Err(PipelineError::TypeMismatch { .. })
    ));

    let info = TensorsInfo::flexible(vec![TensorInfo::new(TensorType::Uint16, vec![3])]);
    src.push(TensorsData::with_info(vec![vec![0u8; 6]], info.clone()))
        .unwrap();
    let data = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data.tensors, vec![vec![0u8; 6]]);
    assert_eq!(data.info, Some(info.clone()));

    // Later pushes reuse the metadata given first
    src.push(TensorsData::single(vec![1u8; 6])).unwrap();
    let data = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data.info, Some(info));

    pipeline.destroy().unwrap();
}

#[test]
fn test_fail_fast_push_on_full_queue() {
    let (_, engine) = loopback();
    let pipeline = PipelineBuilder::new(
        "appsrc name=src max-buffers=2 caps=other/tensor,dimension=4,type=uint8 ! appsink name=sink",
    )
    .push_mode(PushMode::FailFast)
    .build(&engine)
    .unwrap();
    let src = pipeline.get_element("src").unwrap();
    let (tx, rx) = unbounded();
    src.attach_source_feed(SourceCallbacks::new().enough_data(move || {
        let _ = tx.send(());
        Ok(())
    }))
    .unwrap();

    // PAUSED does not drain the queue
    pipeline.set_state(PipelineState::Paused).unwrap();
    pipeline.wait_state(PipelineState::Paused, WAIT).unwrap();

    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    rx.recv_timeout(WAIT).unwrap();

    let err = src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap_err();
    assert!(matches!(err, PipelineError::TryAgain(_)));
    assert!(err.is_transient());

    pipeline.destroy().unwrap();
}

#[test]
fn test_need_data_fires_when_source_runs_dry() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    pipeline
        .get_element("src")
        .unwrap()
        .attach_source_feed(SourceCallbacks::new().need_data(move |hint| {
            let _ = tx.send(hint);
            Ok(())
        }))
        .unwrap();

    play(&pipeline);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);

    pipeline.destroy().unwrap();
}

#[test]
fn test_end_of_stream() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            if let PipelineEvent::Eos { .. } = event {
                let _ = tx.send(());
            }
            Ok(())
        })
        .unwrap();
    play(&pipeline);

    let src = pipeline.get_element("src").unwrap();
    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    src.end_of_stream().unwrap();

    rx.recv_timeout(WAIT).unwrap();
    assert!(pipeline.is_eos());
    assert!(rx.recv_timeout(QUIET).is_err());

    // Going back through READY re-arms the stream
    pipeline.set_state(PipelineState::Ready).unwrap();
    pipeline.wait_state(PipelineState::Ready, WAIT).unwrap();
    play(&pipeline);
    assert!(!pipeline.is_eos());

    pipeline.destroy().unwrap();
}

// ============================================================================
// Client callbacks
// ============================================================================

#[test]
fn test_callbacks_run_in_registration_order() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = unbounded();

    for label in ["A", "B"] {
        let calls = calls.clone();
        let tx = tx.clone();
        sink.attach_sink_callback(move |_| {
            calls.lock().unwrap().push(label);
            let _ = tx.send(());
            Ok(())
        })
        .unwrap();
    }
    assert_eq!(sink.client_count(), 2);

    play(&pipeline);
    pipeline
        .get_element("src")
        .unwrap()
        .push(TensorsData::single(vec![1, 2, 3, 4]))
        .unwrap();
    rx.recv_timeout(WAIT).unwrap();
    rx.recv_timeout(WAIT).unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["A", "B"]);
    pipeline.destroy().unwrap();
}

#[test]
fn test_client_ids_are_not_reused() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();

    let first = sink.attach_sink_callback(|_| Ok(())).unwrap();
    let second = sink.attach_sink_callback(|_| Ok(())).unwrap();
    assert_ne!(first.id(), second.id());

    let first_id = first.id();
    first.detach().unwrap();
    let third = sink.attach_sink_callback(|_| Ok(())).unwrap();
    assert_ne!(third.id(), first_id);
    assert_ne!(third.id(), second.id());
    assert_eq!(sink.client_count(), 2);

    pipeline.destroy().unwrap();
}

#[test]
fn test_no_callback_after_detach() {
    let pipeline = construct(SRC_TO_SINK);
    let counter = Arc::new(AtomicUsize::new(0));
    let client = {
        let counter = counter.clone();
        pipeline
            .get_element("sink")
            .unwrap()
            .attach_sink_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                Ok(())
            })
            .unwrap()
    };
    play(&pipeline);

    let running = Arc::new(AtomicBool::new(true));
    let pusher = {
        let src = pipeline.get_element("src").unwrap();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if src.push(TensorsData::single(vec![1, 2, 3, 4])).is_err() {
                    break;
                }
            }
        })
    };

    while counter.load(Ordering::SeqCst) < 5 {
        thread::sleep(Duration::from_millis(1));
    }
    client.detach().unwrap();
    let after_detach = counter.load(Ordering::SeqCst);

    thread::sleep(QUIET);
    assert_eq!(counter.load(Ordering::SeqCst), after_detach);

    running.store(false, Ordering::SeqCst);
    pusher.join().unwrap();
    pipeline.destroy().unwrap();
}

#[test]
fn test_callback_can_detach_itself() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();
    let slot = Arc::new(Mutex::new(None::<streamctl::ClientHandle>));
    let (tx, rx) = unbounded();

    let client = {
        let slot = slot.clone();
        sink.attach_sink_callback(move |_| {
            if let Some(client) = slot.lock().unwrap().take() {
                client.detach()?;
            }
            let _ = tx.send(());
            Ok(())
        })
        .unwrap()
    };
    *slot.lock().unwrap() = Some(client);

    play(&pipeline);
    let src = pipeline.get_element("src").unwrap();
    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    rx.recv_timeout(WAIT).unwrap();

    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(sink.client_count(), 0);

    pipeline.destroy().unwrap();
}

#[test]
fn test_failing_callback_does_not_stop_others() {
    let pipeline = construct(SRC_TO_SINK);
    let sink = pipeline.get_element("sink").unwrap();
    sink.attach_sink_callback(|_| anyhow::bail!("subscriber failure"))
        .unwrap();
    sink.attach_sink_callback(|_| panic!("subscriber panic"))
        .unwrap();
    let rx = collect_sink(&pipeline, "sink");

    play(&pipeline);
    let src = pipeline.get_element("src").unwrap();
    for _ in 0..2 {
        src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
        rx.recv_timeout(WAIT).unwrap();
    }

    pipeline.destroy().unwrap();
}

#[test]
fn test_destroy_from_callback_is_rejected() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    {
        let handle = pipeline.clone();
        pipeline
            .set_state_change_subscriber(move |_| {
                let _ = tx.send(handle.destroy());
                Ok(())
            })
            .unwrap();
    }

    pipeline.start().unwrap();
    let result = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(result, Err(PipelineError::InvalidState(_))));
    assert!(!pipeline.is_destroyed());

    pipeline.destroy().unwrap();
}

#[test]
fn test_wait_state_from_callback_is_rejected() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    {
        let handle = pipeline.clone();
        pipeline
            .set_state_change_subscriber(move |_| {
                let _ = tx.send(handle.wait_state(PipelineState::Playing, WAIT));
                Ok(())
            })
            .unwrap();
    }

    pipeline.start().unwrap();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(PipelineError::InvalidState(_))
    ));
    pipeline.destroy().unwrap();
}

#[test]
fn test_no_notification_after_destroy() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        })
        .unwrap();
    play(&pipeline);
    while rx.recv_timeout(QUIET).is_ok() {}

    pipeline.destroy().unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_cleared_subscriber_is_not_called() {
    let pipeline = construct(SRC_TO_SINK);
    let (tx, rx) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        })
        .unwrap();
    pipeline.clear_state_change_subscriber();

    play(&pipeline);
    assert!(rx.recv_timeout(QUIET).is_err());
    pipeline.destroy().unwrap();
}

// ============================================================================
// Valves and switches
// ============================================================================

#[test]
fn test_valve_toggle() {
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! valve name=v ! appsink name=sink",
    );
    let rx = collect_sink(&pipeline, "sink");
    let src = pipeline.get_element("src").unwrap();
    let valve = pipeline.get_element_as("v", Capability::Valve).unwrap();
    play(&pipeline);

    valve.set_valve_open(false).unwrap();
    assert!(!valve.is_valve_open().unwrap());
    src.push(TensorsData::single(vec![1, 1, 1, 1])).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());

    valve.set_valve_open(true).unwrap();
    assert!(valve.is_valve_open().unwrap());
    src.push(TensorsData::single(vec![2, 2, 2, 2])).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().tensors, vec![vec![2, 2, 2, 2]]);

    assert!(matches!(
        src.set_valve_open(true),
        Err(PipelineError::NotSupported(_))
    ));
    pipeline.destroy().unwrap();
}

#[test]
fn test_output_switch_routes_to_selected_branch() {
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! output-selector name=sel \
         sel. ! queue ! appsink name=a  sel. ! queue ! appsink name=b",
    );
    let rx_a = collect_sink(&pipeline, "a");
    let rx_b = collect_sink(&pipeline, "b");
    let sel = pipeline.get_element_as("sel", Capability::Switch).unwrap();
    assert_eq!(sel.kind(), ElementKind::SwitchOutput);
    assert_eq!(
        sel.switch_pads().unwrap(),
        vec!["src_0".to_string(), "src_1".to_string()]
    );
    play(&pipeline);

    sel.switch_select("src_1").unwrap();
    assert_eq!(sel.active_pad().unwrap().as_deref(), Some("src_1"));
    pipeline
        .get_element("src")
        .unwrap()
        .push(TensorsData::single(vec![1, 2, 3, 4]))
        .unwrap();
    rx_b.recv_timeout(WAIT).unwrap();
    assert!(rx_a.recv_timeout(QUIET).is_err());

    assert!(matches!(
        sel.switch_select("src_9"),
        Err(PipelineError::InvalidParameter(_))
    ));
    pipeline.destroy().unwrap();
}

#[test]
fn test_input_switch_selects_source() {
    let pipeline = construct(
        "appsrc name=a caps=other/tensor,dimension=4,type=uint8 ! sel.sink_0 \
         appsrc name=b caps=other/tensor,dimension=4,type=uint8 ! sel.sink_1 \
         input-selector name=sel ! appsink name=sink",
    );
    let rx = collect_sink(&pipeline, "sink");
    let sel = pipeline.get_element("sel").unwrap();
    play(&pipeline);

    sel.switch_select("sink_1").unwrap();
    pipeline
        .get_element("a")
        .unwrap()
        .push(TensorsData::single(vec![1, 1, 1, 1]))
        .unwrap();
    pipeline
        .get_element("b")
        .unwrap()
        .push(TensorsData::single(vec![2, 2, 2, 2]))
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap().tensors, vec![vec![2, 2, 2, 2]]);
    assert!(rx.recv_timeout(QUIET).is_err());
    pipeline.destroy().unwrap();
}

// ============================================================================
// Custom filters and conditions
// ============================================================================

#[test]
#[serial]
fn test_custom_filter_transforms_data() {
    let filter = register_custom_filter("test-double", uint8_info(4), uint8_info(4), |input| {
        let doubled = input.tensors[0].iter().map(|v| v * 2).collect::<Vec<u8>>();
        Ok(TensorsData::new(vec![doubled]))
    })
    .unwrap();

    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 \
         ! tensor_filter framework=custom-easy model=test-double ! appsink name=sink",
    );
    assert_eq!(filter.ref_count(), 1);
    let rx = collect_sink(&pipeline, "sink");
    play(&pipeline);

    pipeline
        .get_element("src")
        .unwrap()
        .push(TensorsData::single(vec![1, 2, 3, 4]))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().tensors, vec![vec![2, 4, 6, 8]]);

    // Still referenced by a live pipeline
    assert!(matches!(
        filter.unregister(),
        Err(PipelineError::InvalidState(_))
    ));
    pipeline.destroy().unwrap();
    assert_eq!(filter.ref_count(), 0);
    filter.unregister().unwrap();
}

#[test]
#[serial]
fn test_unregistered_filter_fails_construction() {
    assert!(matches!(
        Pipeline::construct(
            &loopback().1,
            "appsrc ! tensor_filter framework=custom-easy model=test-missing ! appsink",
        ),
        Err(PipelineError::Construction(_))
    ));
}

#[test]
#[serial]
fn test_custom_condition_routes_branches() {
    let condition =
        register_custom_condition("test-first-positive", |input| Ok(input.tensors[0][0] > 0))
            .unwrap();

    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 \
         ! tensor_if name=cond compared-value=CUSTOM compared-value-option=test-first-positive \
         cond.src_0 ! queue ! appsink name=then  cond.src_1 ! queue ! appsink name=else",
    );
    let rx_then = collect_sink(&pipeline, "then");
    let rx_else = collect_sink(&pipeline, "else");
    play(&pipeline);

    let src = pipeline.get_element("src").unwrap();
    src.push(TensorsData::single(vec![1, 0, 0, 0])).unwrap();
    src.push(TensorsData::single(vec![0, 0, 0, 0])).unwrap();

    assert_eq!(rx_then.recv_timeout(WAIT).unwrap().tensors, vec![vec![1, 0, 0, 0]]);
    assert_eq!(rx_else.recv_timeout(WAIT).unwrap().tensors, vec![vec![0, 0, 0, 0]]);

    pipeline.destroy().unwrap();
    condition.unregister().unwrap();
}

#[test]
#[serial]
fn test_failing_custom_filter_posts_warning() {
    let filter = register_custom_filter("test-fails", uint8_info(4), uint8_info(4), |_| {
        anyhow::bail!("model not loaded")
    })
    .unwrap();
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 \
         ! tensor_filter framework=custom-easy model=test-fails ! appsink name=sink",
    );
    let (tx, rx) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            if let PipelineEvent::Warning { source, .. } = event {
                let _ = tx.send(source.clone());
            }
            Ok(())
        })
        .unwrap();
    play(&pipeline);

    pipeline
        .get_element("src")
        .unwrap()
        .push(TensorsData::single(vec![1, 2, 3, 4]))
        .unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap().is_some());
    assert_eq!(pipeline.fault(), None);

    pipeline.destroy().unwrap();
    filter.unregister().unwrap();
}

#[test]
#[serial]
fn test_panicking_custom_filter_keeps_stream_alive() {
    let first = Arc::new(AtomicBool::new(true));
    let flag = first.clone();
    let filter = register_custom_filter("test-panics-once", uint8_info(4), uint8_info(4), move |d| {
        if flag.swap(false, Ordering::SeqCst) {
            panic!("first buffer is poisoned");
        }
        Ok(d.clone())
    })
    .unwrap();
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 \
         ! tensor_filter framework=custom-easy model=test-panics-once ! appsink name=sink",
    );
    let (tx, warnings) = unbounded();
    pipeline
        .set_state_change_subscriber(move |event| {
            if let PipelineEvent::Warning { source, .. } = event {
                let _ = tx.send(source.clone());
            }
            Ok(())
        })
        .unwrap();
    let rx = collect_sink(&pipeline, "sink");
    play(&pipeline);

    let src = pipeline.get_element("src").unwrap();
    src.push(TensorsData::single(vec![1, 2, 3, 4])).unwrap();
    assert!(warnings.recv_timeout(WAIT).unwrap().is_some());

    src.push(TensorsData::single(vec![5, 6, 7, 8])).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().tensors, vec![vec![5, 6, 7, 8]]);
    assert_eq!(pipeline.fault(), None);

    pipeline.destroy().unwrap();
    filter.unregister().unwrap();
}

#[test]
#[serial]
fn test_panicking_custom_condition_drops_only_that_buffer() {
    let condition = register_custom_condition("test-panics-on-zero", |input| {
        if input.tensors[0][0] == 0 {
            panic!("zero is not handled");
        }
        Ok(true)
    })
    .unwrap();
    let pipeline = construct(
        "appsrc name=src caps=other/tensor,dimension=4,type=uint8 \
         ! tensor_if name=cond compared-value=CUSTOM compared-value-option=test-panics-on-zero \
         cond.src_0 ! queue ! appsink name=then  cond.src_1 ! queue ! fakesink",
    );
    let rx = collect_sink(&pipeline, "then");
    play(&pipeline);

    let src = pipeline.get_element("src").unwrap();
    src.push(TensorsData::single(vec![0, 0, 0, 0])).unwrap();
    src.push(TensorsData::single(vec![9, 0, 0, 0])).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().tensors, vec![vec![9, 0, 0, 0]]);
    assert!(rx.recv_timeout(QUIET).is_err());

    pipeline.destroy().unwrap();
    condition.unregister().unwrap();
}

// ============================================================================
// Graph access, availability and event streams
// ============================================================================

#[test]
fn test_graph_lease_blocks_destroy_on_same_thread() {
    let pipeline = construct(SRC_TO_SINK);
    {
        let graph = pipeline.graph().unwrap();
        assert_eq!(graph.nodes().len(), 3);
        assert!(matches!(
            pipeline.destroy(),
            Err(PipelineError::InvalidState(_))
        ));
    }
    pipeline.destroy().unwrap();
    assert!(pipeline.graph().is_err());
}

#[test]
fn test_element_availability() {
    let (_, engine) = loopback();

    check_element_availability(engine.as_ref(), "appsrc").unwrap();
    check_element_availability(engine.as_ref(), "tensor_filter").unwrap();
    assert!(matches!(
        check_element_availability(engine.as_ref(), "no_such_factory"),
        Err(PipelineError::PluginUnavailable(_))
    ));
    assert!(matches!(
        check_element_availability(engine.as_ref(), ""),
        Err(PipelineError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn test_event_stream_reports_transitions() {
    let pipeline = construct(SRC_TO_SINK);
    let events = pipeline.event_stream();
    tokio::pin!(events);

    pipeline.start().unwrap();

    let mut reached_playing = false;
    while !reached_playing {
        let event = tokio::time::timeout(WAIT, events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.pipeline_id(), pipeline.id());
        if let PipelineEvent::StateChanged { new, .. } = event {
            reached_playing = new == PipelineState::Playing;
        }
    }

    tokio::task::spawn_blocking(move || pipeline.destroy())
        .await
        .unwrap()
        .unwrap();
}
