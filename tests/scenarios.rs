
use std::sync::Arc;
use std::time::Duration;

use imagegen_sync::sanitize::QUOTA_MESSAGE;
use imagegen_sync::sse::{CompleteEvent, ImageEvent, StartEvent};
use imagegen_sync::*;
use serde_json::json;
use test_helpers::*;

fn loading_count(batch: &BatchResult) -> usize {
    batch.images.iter().filter(|s| s.is_loading()).count()
}

#[tokio::test(start_paused = true)]
async fn test_sync_single_shows_immediately() {
    let backend = FakeBackend::new();
    backend.script_submit(
        "cat",
        Duration::from_millis(300),
        Ok(json!({"status": "success", "image_url": "http://x/cat.png"})),
    );
    let config = test_config();
    let registry = TaskRegistry::new(backend.clone(), &config, Arc::new(LogSink));
    let (generator, mut events) = AsyncGenerator::new(backend.clone(), registry, &config);
    let mut view = GenerationView::new(GenerationType::Create);

    view.add_pending(generator.start_generation(GenerateRequest::new("cat").count(1)));
    let items = view.display_items();
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0].content, DisplayContent::Pending { .. }));

    let event = events.recv().await.unwrap();
    let needs_reload = view.apply_generation_event(event);
    assert!(needs_reload);

    let items = view.display_items();
    assert_eq!(items.len(), 1);
    match &items[0].content {
        DisplayContent::SessionBatch { batch } => {
            assert_eq!(batch.status, BatchStatus::Completed);
            assert_eq!(batch.images.len(), 1);
            assert_eq!(batch.images[0].url(), Some("http://x/cat.png"));
            assert_eq!(batch.prompt, "cat");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(view.pending().is_empty());

    // The reload replaces the session copy with the persisted record.
    backend.set_history(vec![history_record(
        11,
        "2026-03-01T10:00:00Z",
        json!({"prompt": "cat", "image_url": "http://x/cat.png"}),
    )]);
    view.reload_history(backend.as_ref(), config.history_page_size).await.unwrap();
    let items = view.display_items();
    assert_eq!(items.len(), 1);
    match &items[0].content {
        DisplayContent::Single { record } => assert_eq!(record.image_url, "http://x/cat.png"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_sse_batch_fills_in_place() {
    let mut view = GenerationView::new(GenerationType::Create);
    let placeholder = GenerationItem::pending("dog", 3, GenerationType::Create);
    let local_id = placeholder.id.clone();
    view.add_pending(placeholder);

    let mut handler = BatchHandler::new(Some(local_id.clone()));
    handler.apply(StreamEvent::Start(StartEvent {
        task_id: None,
        batch_id: "b1".into(),
        count: 3,
        prompt: "dog".into(),
        ref_images: Vec::new(),
    }));
    view.update_stream(handler.streaming_batch().unwrap(), Some(&local_id));

    handler.apply(StreamEvent::Image(ImageEvent {
        batch_id: Some("b1".into()),
        index: 1,
        image_url: Some("u1".into()),
        error: None,
        completed: Some(1),
        total: Some(3),
    }));
    view.update_stream(handler.streaming_batch().unwrap(), Some(&local_id));

    // The placeholder is hidden behind the streaming batch.
    let items = view.display_items();
    assert_eq!(items.len(), 1);
    match &items[0].content {
        DisplayContent::Streaming { batch } => {
            assert_eq!(batch.images.len(), 3);
            assert!(batch.images[0].is_loading());
            assert_eq!(batch.images[1].url(), Some("u1"));
            assert!(batch.images[2].is_loading());
            assert_eq!(loading_count(batch), 2);
        }
        other => panic!("unexpected {:?}", other),
    }

    let outcome = handler
        .apply(StreamEvent::Complete(CompleteEvent {
            status: Default::default(),
            task_id: None,
            batch_id: Some("b1".into()),
            images: ["u0", "u1", "u2"]
                .iter()
                .map(|u| WireImage {
                    image_url: Some(u.to_string()),
                    ..Default::default()
                })
                .collect(),
            ref_images: None,
            success_count: Some(3),
            total_count: Some(3),
        }))
        .unwrap();
    assert!(view.finish_stream(&outcome));

    assert!(view.pending().is_empty());
    assert!(view.streaming_batches().is_empty());
    let items = view.display_items();
    assert_eq!(items.len(), 1);
    match &items[0].content {
        DisplayContent::SessionBatch { batch } => {
            assert_eq!(batch.status, BatchStatus::Completed);
            let urls: Vec<_> = batch.images.iter().filter_map(|s| s.url()).collect();
            assert_eq!(urls, vec!["u0", "u1", "u2"]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_run_stream_partial_failure() {
    let mut view = GenerationView::new(GenerationType::Create);
    let placeholder = GenerationItem::pending("fox", 2, GenerationType::Create);
    let local_id = placeholder.id.clone();
    view.add_pending(placeholder);

    let events: Vec<Result<StreamEvent>> = vec![
        Ok(StreamEvent::Start(StartEvent {
            task_id: None,
            batch_id: "b2".into(),
            count: 2,
            prompt: "fox".into(),
            ref_images: Vec::new(),
        })),
        Ok(StreamEvent::Image(ImageEvent {
            batch_id: Some("b2".into()),
            index: 0,
            image_url: Some("f0".into()),
            error: None,
            completed: Some(1),
            total: Some(2),
        })),
        Err(SyncError::Stream("connection reset".into())),
    ];
    let stream: EventStream = Box::pin(futures_util::stream::iter(events));

    let outcome = view.run_stream(stream, Some(local_id)).await.unwrap();
    assert_eq!(outcome.batch.status, BatchStatus::Failed);
    assert!(outcome.reload_history);
    assert!(view.pending().is_empty());
    assert!(view.streaming_batches().is_empty());

    let batch = &view.session_batches()[0];
    assert_eq!(batch.images[0].url(), Some("f0"));
    assert_eq!(batch.images[1].error(), Some("Stream error: connection reset"));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_recovers_then_fails() {
    let backend = FakeBackend::new();
    backend.set_processing(vec![task_with("t3", "processing", json!({"prompt": "owl"}))]);
    backend.script_status(
        "t3",
        vec![
            StatusReply::Task(task("t3", "processing")),
            StatusReply::Task(task_with(
                "t3",
                "failed",
                json!({"prompt": "owl", "error_msg": "upstream: Token quota exhausted [sk-9f]"}),
            )),
        ],
    );
    let mut view = GenerationView::new(GenerationType::Create);

    view.begin_recovery();
    let (recovery, mut events) = TaskRecovery::mount(backend.clone(), &test_config());
    assert!(recovery.is_recovering());
    assert!(view.is_recovering());

    let event = events.recv().await.unwrap();
    view.apply_recovery_event(event);
    assert!(!recovery.is_recovering());
    assert!(!view.is_recovering());

    let items = view.display_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, "recovering-t3");

    let event = events.recv().await.unwrap();
    assert!(!view.apply_recovery_event(event));

    let items = view.display_items();
    assert_eq!(items.len(), 1);
    match &items[0].content {
        DisplayContent::Failed { failure } => {
            assert_eq!(failure.id, "failed-task-t3");
            assert_eq!(failure.prompt, "owl");
            assert_eq!(failure.error_message, QUOTA_MESSAGE);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(view.last_error().unwrap().is_quota_error);
}

#[test]
fn test_failed_multi_image_task_becomes_failed_batch() {
    let mut view = GenerationView::new(GenerationType::Create);
    let task = task_with("t4", "failed", json!({"image_count": 4, "error_msg": "nsfw"}));
    view.on_task_failed(&task);

    assert!(view.failed_generations().is_empty());
    let batch = &view.session_batches()[0];
    assert_eq!(batch.batch_id, "failed-task-t4");
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.images.len(), 4);
    assert!(batch.images.iter().all(|s| s.error() == Some("nsfw")));
}

#[test]
fn test_history_reload_filters_type_and_clears_session() {
    let mut view = GenerationView::new(GenerationType::ProductScene);
    view.on_task_failed(&task_with("t8", "failed", json!({"image_count": 2})));
    assert_eq!(view.session_batches().len(), 1);

    view.set_history(vec![
        history_record(1, "2026-03-01T10:00:00Z", json!({"type": "product_scene"})),
        history_record(2, "2026-03-01T10:01:00Z", json!({})),
        history_record(3, "2026-03-01T10:02:00Z", json!({"type": "create"})),
    ]);
    assert!(view.session_batches().is_empty());
    assert_eq!(view.history().len(), 1);
    assert_eq!(view.history()[0].id, 1);
}

#[test]
fn test_merged_batch_group_with_missing_records() {
    let mut view = GenerationView::new(GenerationType::Create);
    view.set_history(vec![
        history_record(
            21,
            "2026-03-01T10:00:02Z",
            json!({"batch_id": "g1", "batch_index": 2, "batch_total": 4}),
        ),
        history_record(
            20,
            "2026-03-01T10:00:01Z",
            json!({"batch_id": "g1", "batch_index": 0, "batch_total": 4}),
        ),
    ]);
    let items = view.display_items();
    assert_eq!(items.len(), 1);
    match &items[0].content {
        DisplayContent::Batch {
            batch_total,
            full_batch_items,
            ..
        } => {
            assert_eq!(*batch_total, 4);
            let present: Vec<bool> = full_batch_items.iter().map(Option::is_some).collect();
            assert_eq!(present, vec![true, false, true, false]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_task_seen_by_generator_and_recovery_shows_once() {
    let backend = FakeBackend::new();
    backend.script_submit("cat", Duration::ZERO, Ok(json!({"task_id": "t1"})));
    backend.set_processing(vec![task_with("t1", "processing", json!({"prompt": "cat"}))]);
    backend.script_status(
        "t1",
        vec![
            StatusReply::Task(task_with("t1", "processing", json!({"prompt": "cat"}))),
            StatusReply::Task(task_with(
                "t1",
                "completed",
                json!({"prompt": "cat", "image_url": "http://x/t1.png"}),
            )),
        ],
    );
    let config = test_config();
    let registry = TaskRegistry::new(backend.clone(), &config, Arc::new(LogSink));
    let (generator, mut generation_events) = AsyncGenerator::new(backend.clone(), registry, &config);
    let mut view = GenerationView::new(GenerationType::Create);

    view.add_pending(generator.start_generation(GenerateRequest::new("cat")));
    let event = generation_events.recv().await.unwrap();
    assert!(matches!(event, GenerationEvent::Processing { .. }));
    view.apply_generation_event(event);

    view.begin_recovery();
    let (_recovery, mut recovery_events) = TaskRecovery::mount(backend.clone(), &config);
    let event = recovery_events.recv().await.unwrap();
    assert!(matches!(event, RecoveryEvent::Recovered { .. }));
    view.apply_recovery_event(event);

    let event = recovery_events.recv().await.unwrap();
    assert!(matches!(event, RecoveryEvent::Completed { .. }));
    assert!(view.apply_recovery_event(event));

    let event = generation_events.recv().await.unwrap();
    assert!(matches!(
        event,
        GenerationEvent::Completed {
            result: GenerationResult::Task { .. },
            ..
        }
    ));
    assert!(!view.apply_generation_event(event));

    let keys: Vec<String> = view.display_items().into_iter().map(|i| i.key).collect();
    assert_eq!(keys, vec!["task-t1".to_string()]);
    assert!(view.pending().is_empty());
    assert!(view.recovering_tasks().is_empty());
}

#[test]
fn test_uncorrelated_stream_removes_placeholder_by_batch() {
    let mut view = GenerationView::new(GenerationType::Create);
    let mut placeholder = GenerationItem::pending("owl", 2, GenerationType::Create);
    placeholder.batch_id = Some("b9".into());
    view.add_pending(placeholder);

    let mut handler = BatchHandler::new(None);
    handler.apply(StreamEvent::Start(StartEvent {
        task_id: None,
        batch_id: "b9".into(),
        count: 2,
        prompt: "owl".into(),
        ref_images: Vec::new(),
    }));
    view.update_stream(handler.streaming_batch().unwrap(), None);
    let keys: Vec<String> = view.display_items().into_iter().map(|i| i.key).collect();
    assert_eq!(keys, vec!["streaming-b9".to_string()]);

    let outcome = handler
        .apply(StreamEvent::Complete(CompleteEvent {
            status: Default::default(),
            task_id: None,
            batch_id: Some("b9".into()),
            images: ["o0", "o1"]
                .iter()
                .map(|u| WireImage {
                    image_url: Some(u.to_string()),
                    ..Default::default()
                })
                .collect(),
            ref_images: None,
            success_count: Some(2),
            total_count: Some(2),
        }))
        .unwrap();
    assert!(outcome.correlation_id.is_none());
    assert!(view.finish_stream(&outcome));

    assert!(view.pending().is_empty());
    let keys: Vec<String> = view.display_items().into_iter().map(|i| i.key).collect();
    assert_eq!(keys, vec!["b9".to_string()]);
}
