use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use frame_queue::{CancellationToken, Error, FillOutcome, FrameQueue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[test]
fn test_blocking_claim_wakes_on_advance() {
    init_tracing();
    let queue = Arc::new(FrameQueue::new());
    queue.allocate_buffers(2, 4096).unwrap();
    queue.submit(0).unwrap();

    let completer = queue.completer();
    let barrier = Arc::new(Barrier::new(2));

    let consumer = {
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            queue.claim(None)
        })
    };

    barrier.wait();
    // Give the consumer time to suspend on the buffer before completing it.
    thread::sleep(Duration::from_millis(50));
    let buf = completer.head().unwrap();
    completer.advance(&buf, FillOutcome::Done { used_bytes: 128 });

    let frame = consumer.join().unwrap().unwrap();
    assert_eq!(frame.buffer.index, 0);
    assert_eq!(frame.buffer.used_bytes, 128);
    assert!(!frame.corrupted);
}

#[test]
fn test_cancel_wakes_every_waiter() {
    init_tracing();
    let queue = Arc::new(FrameQueue::new());
    queue.allocate_buffers(4, 4096).unwrap();
    for index in 0..3 {
        queue.submit(index).unwrap();
    }

    // One claim per pending buffer; all of them suspend on the head first,
    // and all must come back once the queue is cancelled.
    let barrier = Arc::new(Barrier::new(4));
    let claimed: Vec<_> = (0..3)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                queue.claim(None)
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(50));
    queue.completer().cancel();

    let mut indices = Vec::new();
    for handle in claimed {
        let frame = handle.join().unwrap().unwrap();
        assert!(frame.corrupted);
        indices.push(frame.buffer.index);
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn test_blocking_claim_interrupted_by_token() {
    init_tracing();
    let queue = Arc::new(FrameQueue::new());
    queue.allocate_buffers(1, 4096).unwrap();
    queue.submit(0).unwrap();

    let token = CancellationToken::new();
    let consumer = {
        let queue = Arc::clone(&queue);
        let token = token.clone();
        thread::spawn(move || queue.claim(Some(&token)))
    };

    thread::sleep(Duration::from_millis(50));
    token.cancel();

    assert!(matches!(consumer.join().unwrap(), Err(Error::Interrupted)));
    // The buffer was never completed; it is still queued.
    assert!(queue.query_buffer(0).unwrap().queued);
}

#[test]
fn test_streaming_round_trips_many_frames() {
    init_tracing();
    const FRAMES: u32 = 200;
    const BUFFERS: usize = 8;

    let queue = Arc::new(FrameQueue::new());
    queue.allocate_buffers(BUFFERS, 4096).unwrap();
    queue.set_streaming(true).unwrap();
    for index in 0..BUFFERS {
        queue.submit(index).unwrap();
    }

    let completer = queue.completer();
    let failed = Arc::new(AtomicBool::new(false));

    let producer = {
        let failed = Arc::clone(&failed);
        thread::spawn(move || {
            let mut produced = 0u32;
            let mut current = None;
            while produced < FRAMES {
                let buf = match current.take().or_else(|| completer.head()) {
                    Some(buf) => buf,
                    None => {
                        // Availability queue ran dry; idle until a
                        // resubmission replenishes it.
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                };
                let payload = produced.to_le_bytes();
                if buf.write_at(0, &payload).is_err() {
                    failed.store(true, Ordering::SeqCst);
                    return;
                }
                current = completer.advance(
                    &buf,
                    FillOutcome::Done {
                        used_bytes: payload.len(),
                    },
                );
                produced += 1;
            }
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        let failed = Arc::clone(&failed);
        thread::spawn(move || {
            for expected in 0..FRAMES {
                let frame = match queue.claim(None) {
                    Ok(frame) => frame,
                    Err(e) => {
                        eprintln!("claim error: {:?}", e);
                        failed.store(true, Ordering::SeqCst);
                        return;
                    }
                };
                if frame.corrupted || frame.buffer.sequence != expected {
                    eprintln!(
                        "out of order: sequence {} expected {}",
                        frame.buffer.sequence, expected
                    );
                    failed.store(true, Ordering::SeqCst);
                    return;
                }
                queue.submit(frame.buffer.index as usize).unwrap();
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    assert!(!failed.load(Ordering::SeqCst));

    queue.set_streaming(false).unwrap();
    assert!(!queue.is_streaming());
}

#[test]
fn test_partial_fill_scenario() {
    // Pool of 4, two submissions: the first claim returns immediately, the
    // second suspends until the producer finishes buffer 1.
    init_tracing();
    let queue = Arc::new(FrameQueue::new());
    queue.allocate_buffers(4, 4096).unwrap();
    queue.submit(0).unwrap();
    queue.submit(1).unwrap();

    let completer = queue.completer();
    let buf = completer.head().unwrap();
    let next = completer
        .advance(&buf, FillOutcome::Done { used_bytes: 64 })
        .unwrap();

    let frame = queue.claim(None).unwrap();
    assert_eq!(frame.buffer.index, 0);

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.claim(None))
    };
    thread::sleep(Duration::from_millis(50));
    completer.advance(&next, FillOutcome::Done { used_bytes: 64 });

    let frame = consumer.join().unwrap().unwrap();
    assert_eq!(frame.buffer.index, 1);
}
