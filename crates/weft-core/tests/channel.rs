//! Request/channel over a full in-memory wire: two endpoints, frames
//! pumped both ways.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;

use weft_core::{
    Endpoint, FrameType, Payload, PayloadLedger, PayloadStream, RequestHandler, Role, WeftError,
};
use weft_testkit::{pump, TestConnection};

/// Consumes everything the peer sends, then replies with `replies` items.
struct BatchReplyHandler {
    replies: usize,
    ledger: PayloadLedger,
}

impl RequestHandler for BatchReplyHandler {
    fn request_channel(&self, inbound: PayloadStream) -> PayloadStream {
        let replies = self.replies;
        let ledger = self.ledger.clone();
        let drained = inbound.fold(0usize, |seen, item| async move {
            match item {
                Ok(payload) => {
                    let _ = payload.into_parts();
                    seen + 1
                }
                Err(_) => seen,
            }
        });
        futures_util::FutureExt::flatten_stream(futures_util::FutureExt::map(
            drained,
            move |seen| {
                let items: Vec<Result<Payload, WeftError>> = (0..replies)
                    .map(|i| {
                        Ok(ledger.track(Payload::new(Bytes::from(format!("reply-{i}-after-{seen}")))))
                    })
                    .collect();
                futures_util::stream::iter(items)
            },
        ))
        .boxed()
    }
}

struct Wire {
    client: Arc<Endpoint>,
    server: Arc<Endpoint>,
    /// Frame types the client received, in arrival order.
    client_rx_types: Arc<Mutex<Vec<FrameType>>>,
}

fn wire(handler: Arc<dyn RequestHandler>) -> Wire {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (client_conn, client_out) = TestConnection::channel();
    let (server_conn, server_out) = TestConnection::channel();

    let client = Arc::new(
        Endpoint::builder(Role::Client, client_conn).build().unwrap(),
    );
    let server = Arc::new(
        Endpoint::builder(Role::Server, server_conn)
            .handler(handler)
            .build()
            .unwrap(),
    );

    let client_rx_types = Arc::new(Mutex::new(Vec::new()));

    {
        let server = server.clone();
        tokio::spawn(pump(client_out, move |frame| {
            server.multiplexer().handle_frame(frame);
        }));
    }
    {
        let client = client.clone();
        let types = client_rx_types.clone();
        tokio::spawn(pump(server_out, move |frame| {
            types.lock().push(frame.frame_type);
            client.multiplexer().handle_frame(frame);
        }));
    }

    Wire {
        client,
        server,
        client_rx_types,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn one_item_channel_with_five_replies() {
    let client_ledger = PayloadLedger::new();
    let server_ledger = PayloadLedger::new();
    let handler = Arc::new(BatchReplyHandler {
        replies: 5,
        ledger: server_ledger.clone(),
    });
    let wire = wire(handler);

    // One outbound item, then the source completes.
    let outbound: PayloadStream = futures_util::stream::iter(vec![Ok(
        client_ledger.track(Payload::new(Bytes::from_static(b"the-one-item")))
    )])
    .boxed();

    let requester = wire.client.requester().request_channel(outbound);
    let mut rx = requester.subscribe().unwrap();
    requester.request(5);

    let mut received = Vec::new();
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = rx.recv().await {
            let payload = item.unwrap();
            let (data, _) = payload.into_parts().unwrap();
            received.push(data);
        }
    });
    deadline.await.expect("channel did not finish");

    assert_eq!(received.len(), 5);
    assert_eq!(received[0], Bytes::from_static(b"reply-0-after-1"));
    assert_eq!(received[4], Bytes::from_static(b"reply-4-after-1"));

    // COMPLETE arrives after the fifth NEXT.
    let types = wire.client_rx_types.lock().clone();
    let next_count = types.iter().filter(|t| **t == FrameType::Next).count();
    assert_eq!(next_count, 5);
    assert_eq!(*types.last().unwrap(), FrameType::Complete);

    // Every buffer on both sides was consumed or released.
    for _ in 0..500 {
        if client_ledger.outstanding() == 0 && server_ledger.outstanding() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(client_ledger.outstanding(), 0, "client leaked payloads");
    assert_eq!(server_ledger.outstanding(), 0, "server leaked payloads");

    assert_eq!(wire.client.live_streams(), 0);
    assert_eq!(wire.server.live_streams(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_outbound_source_never_opens_a_stream() {
    let handler = Arc::new(BatchReplyHandler {
        replies: 1,
        ledger: PayloadLedger::new(),
    });
    let wire = wire(handler);

    let outbound: PayloadStream = futures_util::stream::empty().boxed();
    let requester = wire.client.requester().request_channel(outbound);
    let mut rx = requester.subscribe().unwrap();
    requester.request(1);

    let err = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err, WeftError::EmptySource);
    assert_eq!(wire.client.live_streams(), 0);
    assert_eq!(wire.server.live_streams(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_echo_round_trip() {
    struct EchoChannel;
    impl RequestHandler for EchoChannel {
        fn request_channel(&self, inbound: PayloadStream) -> PayloadStream {
            inbound.boxed()
        }
    }

    let wire = wire(Arc::new(EchoChannel));
    let items: Vec<Result<Payload, WeftError>> = (0..3)
        .map(|i| Ok(Payload::new(Bytes::from(format!("item-{i}")))))
        .collect();
    let outbound: PayloadStream = futures_util::stream::iter(items).boxed();

    let requester = wire.client.requester().request_channel(outbound);
    let mut rx = requester.subscribe().unwrap();
    requester.request(weft_core::REQUEST_MAX);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = rx.recv().await {
            let (data, _) = item.unwrap().into_parts().unwrap();
            received.push(data);
        }
    })
    .await
    .expect("echo channel did not finish");

    assert_eq!(
        received,
        vec![
            Bytes::from_static(b"item-0"),
            Bytes::from_static(b"item-1"),
            Bytes::from_static(b"item-2"),
        ]
    );
}
