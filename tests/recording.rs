//! Capture -> detect -> record, driven frame by frame on one thread

mod common;

use common::{harness, session_events};
use hornet_watch::capture::{FrameSource, TestPattern, TestPatternSource};
use hornet_watch::pipeline::{BrightnessMonitor, CloseReason, MonitorDecision, PipelineEvent};
use hornet_watch::{BrightnessConfig, RecordingConfig};

fn run_to_end(source: &mut TestPatternSource, mut each: impl FnMut(hornet_watch::capture::Frame)) {
    while let Ok(frame) = source.read() {
        each(frame);
    }
}

#[test]
fn hit_on_frame_ten_records_until_duration_cutoff() {
    let recording = RecordingConfig {
        max_duration_secs: 2,
        ..RecordingConfig::default()
    };
    let mut h = harness(|seq| seq == 10, true, recording);
    let mut source =
        TestPatternSource::new(640, 480, 25.0, TestPattern::Solid { luma: 120 }).with_limit(100);

    run_to_end(&mut source, |frame| {
        h.processor.process(frame);
    });
    assert_eq!(h.processor.processed(), 100);

    // 2 s at 25 fps starting from frame 10
    let clips = h.factory.clips();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].frames, (10..60).collect::<Vec<_>>());
    assert_eq!((clips[0].width, clips[0].height), (640, 480));
    assert_eq!(clips[0].closes, 1);

    let events = session_events(&h.events);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], PipelineEvent::SessionOpened(_)));
    assert!(matches!(
        events[1],
        PipelineEvent::SessionClosed {
            frames: 50,
            reason: CloseReason::DurationElapsed,
            ..
        }
    ));

    // Nothing left for shutdown to close
    assert_eq!(h.processor.controller_mut().shutdown().unwrap(), None);
}

#[test]
fn hit_on_frame_ten_closed_by_shutdown_at_stream_end() {
    let mut h = harness(|seq| seq == 10, true, RecordingConfig::default());
    let mut source =
        TestPatternSource::new(640, 480, 25.0, TestPattern::Solid { luma: 120 }).with_limit(100);

    run_to_end(&mut source, |frame| {
        h.processor.process(frame);
    });
    assert!(h.processor.controller().is_recording());
    let closed = h.processor.controller_mut().shutdown().unwrap();
    assert!(matches!(
        closed,
        Some(hornet_watch::pipeline::Transition::SessionClosed {
            frames: 91,
            reason: CloseReason::Shutdown,
            ..
        })
    ));

    let clips = h.factory.clips();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].frames, (10..=100).collect::<Vec<_>>());
    assert_eq!(clips[0].closes, 1);
}

#[test]
fn dark_scene_never_records() {
    let mut h = harness(|_| true, false, RecordingConfig::default());
    let mut monitor = BrightnessMonitor::new(
        h.latest.clone(),
        h.gate.clone(),
        &BrightnessConfig::default(),
    );
    let mut source =
        TestPatternSource::new(64, 48, 25.0, TestPattern::Solid { luma: 10 }).with_limit(60);

    run_to_end(&mut source, |frame| {
        h.processor.process(frame);
        monitor.sample();
    });
    assert!(!h.gate.is_armed());
    assert!(h.factory.clips().is_empty());
}

fn dusk(seq: u64) -> u8 {
    if seq <= 30 {
        200
    } else {
        10
    }
}

/// Frames 1..=30 are bright, the rest dark. A hit on frame 5 opens a session;
/// the monitor samples every 10th frame.
fn run_dusk(recording: RecordingConfig) -> common::Harness {
    let mut h = harness(|seq| seq == 5, false, recording);
    let mut monitor = BrightnessMonitor::new(
        h.latest.clone(),
        h.gate.clone(),
        &BrightnessConfig::default(),
    );
    let mut source =
        TestPatternSource::new(64, 48, 25.0, TestPattern::Scripted(dusk)).with_limit(50);

    run_to_end(&mut source, |frame| {
        let seq = frame.sequence();
        h.processor.process(frame);
        if seq % 10 == 1 {
            let decision = monitor.sample();
            if seq == 1 {
                assert!(matches!(decision, Some(MonitorDecision::Armed { .. })));
            }
            if seq == 31 {
                assert!(matches!(decision, Some(MonitorDecision::Disarmed { .. })));
            }
        }
    });
    h
}

#[test]
fn darkness_only_blocks_new_sessions_by_default() {
    let mut h = run_dusk(RecordingConfig::default());
    assert!(!h.gate.is_armed());
    assert!(h.processor.controller().is_recording());

    h.processor.controller_mut().shutdown().unwrap();
    let clips = h.factory.clips();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].frames, (5..=50).collect::<Vec<_>>());
}

#[test]
fn darkness_closes_session_when_configured() {
    let h = run_dusk(RecordingConfig {
        abort_on_darkness: true,
        ..RecordingConfig::default()
    });
    assert!(!h.processor.controller().is_recording());

    let clips = h.factory.clips();
    assert_eq!(clips.len(), 1);
    // Disarmed after frame 31 was processed; frame 32 closes the session
    assert_eq!(clips[0].frames, (5..=31).collect::<Vec<_>>());
    assert!(clips[0].is_closed());

    let events = session_events(&h.events);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::SessionClosed {
            reason: CloseReason::Darkness,
            ..
        })
    ));
}
