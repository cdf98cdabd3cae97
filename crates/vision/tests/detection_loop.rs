//! Camera to overlay, against a mock detection service.

use std::{sync::Arc, time::Duration};

use video_ingest::{Resolution, StreamEvent, TestPatternBackend};
use vision::{
    DiscardReason, DrawCommand, HttpDetectionService, Orchestrator, PipelineConfig, PipelineEvent,
    Settled,
};

const BOTTLE: &str = r#"[{"label":"bottle","confidence":0.93,"box":[50,60,180,300]}]"#;

#[tokio::test]
async fn test_first_sample_is_drawn_and_late_response_is_discarded() {
    let mut server = mockito::Server::new_async().await;
    let detect = server
        .mock("POST", "/detect")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(BOTTLE)
        .expect(1)
        .create_async()
        .await;

    let service = HttpDetectionService::new(server.url(), Duration::from_secs(10)).unwrap();
    let (mut orch, handle) = Orchestrator::new(
        Arc::new(TestPatternBackend::new(Resolution::HD)),
        Arc::new(service),
        PipelineConfig::default(),
    );
    let mut events = handle.subscribe();

    let session = orch.start_session().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(10), orch.next_stream_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        StreamEvent::MetadataReady {
            session,
            resolution: Resolution::HD,
        }
    );
    orch.on_stream_event(event);

    let feed = orch.session().unwrap().feed().clone();
    while feed.latest().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    orch.on_tick();
    assert!(orch.client().in_flight());
    let settled = orch.next_settled().await.unwrap();
    assert_eq!((settled.session, settled.sequence), (session, 1));
    orch.on_settled(settled);
    detect.assert_async().await;

    let renderer = orch.renderer().unwrap();
    assert_eq!(renderer.surface().dimensions(), (1280, 720));
    let boxes: Vec<_> = renderer
        .commands()
        .iter()
        .filter(|c| matches!(c, DrawCommand::StrokeRect { .. }))
        .collect();
    assert_eq!(boxes.len(), 1);
    assert!(matches!(
        boxes[0],
        DrawCommand::StrokeRect { x1, y1, x2, y2, .. }
            if (*x1, *y1, *x2, *y2) == (50.0, 60.0, 180.0, 300.0)
    ));
    assert!(renderer.commands().iter().any(|c| matches!(
        c,
        DrawCommand::Text { text, .. } if text == "BOTTLE 93%"
    )));

    let applied = handle.preview();
    assert_eq!(applied.result.as_ref().unwrap().sequence, 1);

    // A response for an earlier frame arriving late must not replace it.
    orch.on_settled(Settled {
        session,
        sequence: 0,
        outcome: Ok(Vec::new()),
    });
    let after = handle.preview();
    assert_eq!(after.result, applied.result);
    assert_eq!(after.detections().len(), 1);

    let mut saw_applied = false;
    let mut saw_discard = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::ResultApplied(result) => {
                saw_applied = result.sequence == 1 && result.detections[0].label == "bottle";
            }
            PipelineEvent::ResultDiscarded {
                sequence: 0,
                reason: DiscardReason::OutOfOrder,
                ..
            } => saw_discard = true,
            _ => {}
        }
    }
    assert!(saw_applied);
    assert!(saw_discard);

    assert_eq!(orch.stop_session(), Some(session));
}
