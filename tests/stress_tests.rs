mod common;

use common::*;
use readaloud_ng::{SpeakOptions, SpeechError, SpeechEvents, Synthesizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn numbered_text(units: usize) -> String {
    (0..units).map(|i| format!("U{}. ", i)).collect::<String>().trim_end().to_string()
}

#[tokio::test(start_paused = true)]
async fn test_rapid_forward_rewind_presses() {
    let player = FakePlayer::default();
    let events = Arc::new(RecordingEvents::default());
    let synthesizer = Synthesizer::new(
        Arc::new(EchoPhonemizer),
        Arc::new(EchoEngine::default()),
        Arc::new(player.clone()),
        test_config(),
    );
    let speech = synthesizer.speak(&numbered_text(10), SpeakOptions::default(), events.clone());
    let playing = {
        let speech = speech.clone();
        tokio::spawn(async move { speech.play().await })
    };

    sleep(Duration::from_millis(5)).await;
    for _ in 0..5 {
        speech.forward();
        sleep(Duration::from_millis(1)).await;
    }
    for _ in 0..2 {
        speech.rewind();
        sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(playing.await.unwrap(), Ok(()));

    // Every press moves the cursor, only the last one is played.
    let starts: Vec<usize> = events.boundaries().iter().map(|(s, _)| *s).collect();
    assert_eq!(starts, vec![0, 4, 8, 12, 16, 20, 16, 12, 16, 20, 24, 28, 32, 36]);

    let log = player.log();
    let expected: Vec<String> = std::iter::once(0)
        .chain(3..10)
        .map(|i| format!("U{}", i))
        .collect();
    assert_eq!(log.words(), expected);
    assert_eq!(log.max_live, 1);
    assert_eq!(log.live, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_share_one_inference_lane() {
    let engine = Arc::new(EchoEngine::with_delay(Duration::from_millis(2)));
    let synthesizer = Synthesizer::new(
        Arc::new(EchoPhonemizer),
        engine.clone(),
        Arc::new(FakePlayer::default()),
        test_config(),
    );

    let sessions: Vec<_> = (0..3)
        .map(|_| {
            let events: Arc<dyn SpeechEvents> = Arc::new(RecordingEvents::default());
            synthesizer.speak(&numbered_text(8), SpeakOptions::default(), events)
        })
        .collect();
    let results = futures_util::future::join_all(sessions.iter().map(|s| s.play())).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(*engine.max_in_flight.lock().unwrap(), 1);
    assert_eq!(*engine.calls.lock().unwrap(), 3 * 8);
}

#[tokio::test(start_paused = true)]
async fn test_many_sessions_cancelled_at_random_points() {
    let player = FakePlayer::default();
    let synthesizer = Synthesizer::new(
        Arc::new(EchoPhonemizer),
        Arc::new(EchoEngine::with_delay(Duration::from_millis(1))),
        Arc::new(player.clone()),
        test_config(),
    );

    for i in 0..50u64 {
        let events = Arc::new(RecordingEvents::default());
        let speech = synthesizer.speak(&numbered_text(4), SpeakOptions::default(), events.clone());
        let playing = {
            let speech = speech.clone();
            tokio::spawn(async move { speech.play().await })
        };
        sleep(Duration::from_millis(i * 3 % 90)).await;
        speech.cancel();

        match playing.await.unwrap() {
            Ok(()) => {}
            Err(e) => assert_eq!(e, SpeechError::Cancelled),
        }
        assert!(events.errors().is_empty());
        assert_eq!(player.log().live, 0);
    }
    assert_eq!(player.log().max_live, 1);
}
