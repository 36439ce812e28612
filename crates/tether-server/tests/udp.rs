//! UDP endpoint and inbound queue tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::UdpConfig;
use tether_server::{InboundEntry, InboundQueue, UdpEndpoint, UdpEvent};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn entry(text: String) -> InboundEntry {
    InboundEntry::new(text.into_bytes(), "127.0.0.1:5000".parse().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueue_keeps_per_producer_order() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let queue = InboundQueue::new("udp", PRODUCERS * PER_PRODUCER, move |e: InboundEntry| {
        sink.lock().unwrap().push(e.text);
    });

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for n in 0..PER_PRODUCER {
                    assert!(queue.enqueue(entry(format!("{p}:{n}"))));
                    if n % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().len() < PRODUCERS * PER_PRODUCER {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never drained");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
    let mut last = [None::<usize>; PRODUCERS];
    for text in seen.iter() {
        let (p, n) = text.split_once(':').unwrap();
        let (p, n): (usize, usize) = (p.parse().unwrap(), n.parse().unwrap());
        assert!(last[p].is_none_or(|prev| prev < n), "{text} out of order");
        last[p] = Some(n);
    }
}

#[tokio::test]
async fn drain_restarts_after_dispatcher_panic() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = InboundQueue::new("udp", 16, move |e: InboundEntry| {
        if e.text == "boom" {
            panic!("dispatcher failed");
        }
        let _ = tx.send(e.text);
    });

    for text in ["a", "boom", "b"] {
        queue.enqueue(entry(text.to_string()));
    }
    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, "a");

    timeout(Duration::from_secs(2), async {
        while queue.is_draining() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("drain flag never released");
    assert_eq!(queue.len(), 1, "entry after the panic is still queued");

    queue.enqueue(entry("c".to_string()));
    for expected in ["b", "c"] {
        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, expected);
    }
}

fn loopback() -> UdpConfig {
    UdpConfig {
        bind_address: "127.0.0.1".into(),
        ..UdpConfig::default()
    }
}

#[tokio::test]
async fn datagrams_become_events_in_order() {
    let endpoint = UdpEndpoint::bind("sensor", loopback()).await.unwrap();
    let target = endpoint.local_addr().unwrap();
    let mut events = endpoint.subscribe();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let source = sender.local_addr().unwrap();
    for text in ["one", "two", "three"] {
        sender.send_to(text.as_bytes(), target).await.unwrap();
    }

    for expected in ["one", "two", "three"] {
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        let UdpEvent::Message(entry) = event else {
            panic!("unexpected {event:?}");
        };
        assert_eq!(entry.text, expected);
        assert_eq!(entry.source(), source);
    }

    endpoint.close();
    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, UdpEvent::Closed);
}

#[tokio::test]
async fn sends_to_configured_remote() {
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    let config = UdpConfig {
        remote_host: Some("127.0.0.1".into()),
        remote_port: Some(remote_addr.port()),
        ..loopback()
    };
    let endpoint = UdpEndpoint::bind("sensor", config).await.unwrap();
    assert_eq!(endpoint.send_text("PING").await.unwrap(), 4);

    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"PING");
    assert_eq!(from, endpoint.local_addr().unwrap());
}
