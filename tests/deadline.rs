use grpc2::{Channel, CompletionQueue, Metadata, Op, StatusCode};
use std::time::{Duration, Instant};

fn wait(cq: &CompletionQueue, seconds: u64) -> grpc2::Event {
    cq.next(Instant::now() + Duration::from_secs(seconds))
}

/// A call against an unreachable port fails through either the deadline or
/// the broken connection, whichever is noticed first.
#[test]
fn deadline_expiry_on_an_unreachable_target() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cq = CompletionQueue::new();
    let channel = Channel::insecure("127.0.0.1:1");
    let call = channel.create_call(
        "/echo.Echo/SayHello",
        None,
        Some(Instant::now() + Duration::from_millis(100)),
        &cq,
    );
    assert_eq!(
        call.start_batch(
            vec![
                Op::SendInitialMetadata(Metadata::new()),
                Op::RecvStatusOnClient,
            ],
            7,
        ),
        grpc2::CallError::Ok
    );

    let event = wait(&cq, 1);
    assert_eq!(event.tag, 7);
    assert!(!event.success);
    let status = call.status().expect("terminal status");
    assert!(
        status.code == StatusCode::DeadlineExceeded || status.code == StatusCode::Unavailable,
        "unexpected status {:?}",
        status
    );
}

#[test]
fn cancellation_flushes_the_pending_batch() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cq = CompletionQueue::new();
    let channel = Channel::insecure("127.0.0.1:1");
    let call = channel.create_call("/echo.Echo/SayHello", None, None, &cq);

    call.cancel();
    call.cancel(); // idempotent

    assert_eq!(
        call.start_batch(
            vec![
                Op::SendInitialMetadata(Metadata::new()),
                Op::RecvStatusOnClient,
            ],
            9,
        ),
        grpc2::CallError::Ok
    );
    let event = wait(&cq, 2);
    assert_eq!(event.tag, 9);
    assert!(!event.success);
    let status = call.status().expect("terminal status");
    assert!(
        status.code == StatusCode::Cancelled || status.code == StatusCode::Unavailable,
        "unexpected status {:?}",
        status
    );
}

/// Exactly one terminal status is observed, even with both a deadline and
/// an explicit cancel racing.
#[test]
fn one_terminal_status_per_call() {
    let cq = CompletionQueue::new();
    let channel = Channel::insecure("127.0.0.1:1");
    let call = channel.create_call(
        "/echo.Echo/SayHello",
        None,
        Some(Instant::now() + Duration::from_millis(50)),
        &cq,
    );
    call.start_batch(vec![Op::RecvStatusOnClient], 1);
    call.cancel();

    let first = wait(&cq, 2);
    assert_eq!(first.tag, 1);
    assert!(!first.success);
    // No second terminal event ever shows up.
    let second = cq.next(Instant::now() + Duration::from_millis(300));
    assert_eq!(second.kind, grpc2::EventKind::QueueTimeout);
    // And later batches are refused outright.
    assert_eq!(
        call.start_batch(vec![Op::RecvMessage], 2),
        grpc2::CallError::AlreadyFinished
    );
}
