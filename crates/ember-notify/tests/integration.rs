//! Integration tests for the ember-notify crate.
//!
//! These tests exercise sender registration, type-filtered delivery, and
//! queue lifecycle against a real device registry.

use std::time::Duration;

use ember_kernel::{DeviceRegistry, KernelConfig, KernelError, Label, Wait};
use ember_notify::{NotificationCenter, NotifyConfig, NotifyError};

fn center() -> NotificationCenter {
    let registry = DeviceRegistry::new(KernelConfig {
        max_devices: 8,
        discovery_task: false,
        ..Default::default()
    })
    .expect("registry");
    NotificationCenter::new(registry).expect("center")
}

fn label(tag: &str) -> Label {
    Label::new(tag).expect("label")
}

#[tokio::test]
async fn typed_delivery_respects_filters() {
    // Scenario E: sender {"S"}; two listeners with mask 0xFF and types 0x01
    // and 0x02; a type 0x01 send reaches only the first.
    let center = center();
    let sender = center.register_sender(label("S")).expect("register");

    let q1 = center.queue_create().expect("q1");
    let q2 = center.queue_create().expect("q2");
    center.listen_start(&q1, sender, 0x01, 0xFF).expect("listen 1");
    center.listen_start(&q2, sender, 0x02, 0xFF).expect("listen 2");

    center.send(sender, 0x01, b"one").await.expect("send");

    let hit = center.get(&q1, Wait::No).await.expect("q1 message");
    assert_eq!(hit.sender, sender);
    assert_eq!(hit.msg_type, 0x01);
    assert_eq!(hit.payload, b"one");

    assert!(matches!(
        center.get(&q2, Wait::No).await,
        Err(NotifyError::Kernel(KernelError::PipeEmpty))
    ));
}

#[tokio::test]
async fn wildcard_listener_sees_every_type() {
    let center = center();
    let sender = center.register_sender(label("W")).expect("register");

    let all = center.queue_create().expect("all");
    center.listen_start(&all, sender, 0, 0).expect("wildcard");

    for msg_type in [0x01u32, 0x80, 0xFFFF_0000] {
        center
            .send(sender, msg_type, &msg_type.to_le_bytes())
            .await
            .expect("send");
    }
    for msg_type in [0x01u32, 0x80, 0xFFFF_0000] {
        let hit = center.get(&all, Wait::No).await.expect("get");
        assert_eq!(hit.msg_type, msg_type);
        assert_eq!(hit.payload, msg_type.to_le_bytes());
    }
}

#[tokio::test]
async fn masked_filter_matches_type_family() {
    let center = center();
    let sender = center.register_sender(label("F")).expect("register");

    // Listen to the 0x10 family: any type whose low nibble varies.
    let queue = center.queue_create().expect("queue");
    center.listen_start(&queue, sender, 0x10, 0xF0).expect("listen");

    center.send(sender, 0x11, b"in").await.expect("send 0x11");
    center.send(sender, 0x21, b"out").await.expect("send 0x21");
    center.send(sender, 0x1F, b"in2").await.expect("send 0x1F");

    let first = center.get(&queue, Wait::No).await.expect("first");
    assert_eq!(first.msg_type, 0x11);
    let second = center.get(&queue, Wait::No).await.expect("second");
    assert_eq!(second.msg_type, 0x1F);
    assert!(center.get(&queue, Wait::No).await.is_err());
}

#[tokio::test]
async fn blocking_get_wakes_on_send() {
    let center = center();
    let sender = center.register_sender(label("B")).expect("register");
    let queue = center.queue_create().expect("queue");
    center.listen_start(&queue, sender, 0, 0).expect("listen");

    let getter = {
        let center = center.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            center.get(&queue, Wait::For(Duration::from_secs(5))).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    center.send(sender, 0x07, b"wake up").await.expect("send");
    let hit = getter.await.expect("join").expect("get");
    assert_eq!(hit.msg_type, 0x07);
    assert_eq!(hit.payload, b"wake up");
}

#[tokio::test]
async fn get_times_out_when_nothing_arrives() {
    let center = center();
    let queue = center.queue_create().expect("queue");
    assert!(matches!(
        center.get(&queue, Wait::For(Duration::from_millis(20))).await,
        Err(NotifyError::Kernel(KernelError::Timeout))
    ));
}

#[tokio::test]
async fn one_queue_can_listen_to_many_senders() {
    let center = center();
    let tick = center.register_sender(label("tick")).expect("tick");
    let tock = center.register_sender(label("tock")).expect("tock");

    let queue = center.queue_create().expect("queue");
    center.listen_start(&queue, tick, 0, 0).expect("listen tick");
    center.listen_start(&queue, tock, 0, 0).expect("listen tock");

    center.send(tick, 1, b"t1").await.expect("send tick");
    center.send(tock, 2, b"t2").await.expect("send tock");

    let first = center.get(&queue, Wait::No).await.expect("first");
    assert_eq!(first.sender, tick);
    let second = center.get(&queue, Wait::No).await.expect("second");
    assert_eq!(second.sender, tock);
}

#[tokio::test]
async fn queue_delete_sweeps_every_sender() {
    let center = center();
    let a = center.register_sender(label("a")).expect("a");
    let b = center.register_sender(label("b")).expect("b");

    let doomed = center.queue_create().expect("doomed");
    let survivor = center.queue_create().expect("survivor");
    center.listen_start(&doomed, a, 0, 0).expect("doomed a");
    center.listen_start(&doomed, b, 0, 0).expect("doomed b");
    center.listen_start(&survivor, a, 0, 0).expect("survivor a");

    center.queue_delete(&doomed).expect("delete");

    // The deleted queue is gone from both senders; sender b now has no
    // listeners at all.
    assert!(matches!(
        center.send(b, 1, &[]).await,
        Err(NotifyError::NoActiveListeners { .. })
    ));
    center.send(a, 1, b"still here").await.expect("send a");
    let hit = center.get(&survivor, Wait::No).await.expect("survivor gets it");
    assert_eq!(hit.payload, b"still here");

    // Receiving from the deleted queue reports deletion distinctly.
    assert!(matches!(
        center.get(&doomed, Wait::No).await,
        Err(NotifyError::Kernel(KernelError::PipeDeleted))
    ));
}

#[tokio::test]
async fn delivery_to_full_queue_drops_without_failing_sender() {
    let registry = DeviceRegistry::new(KernelConfig {
        max_devices: 4,
        discovery_task: false,
        ..Default::default()
    })
    .expect("registry");
    // A queue only big enough for a couple of messages.
    let center = NotificationCenter::with_config(
        registry,
        NotifyConfig {
            queue_capacity: 64,
            max_payload: 16,
            listen_slots: 4,
        },
    )
    .expect("center");

    let sender = center.register_sender(label("noisy")).expect("register");
    let queue = center.queue_create().expect("queue");
    center.listen_start(&queue, sender, 0, 0).expect("listen");

    // Flood well past the queue capacity; the sender never blocks or errors.
    for i in 0..32u32 {
        center.send(sender, i, &[0u8; 8]).await.expect("send");
    }

    // Whatever fit is still delivered in order.
    let mut received = 0u32;
    while let Ok(hit) = center.get(&queue, Wait::No).await {
        assert_eq!(hit.msg_type, received);
        received += 1;
    }
    assert!(received > 0);
    assert!(received < 32);
}
