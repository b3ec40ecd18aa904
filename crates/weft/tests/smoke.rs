//! End-to-end smoke test through the facade: two endpoints over an
//! in-memory wire.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;

use weft::{Endpoint, Payload, RequestHandler, Role, WeftError};
use weft_testkit::{pump, TestConnection};

struct Reverse;

impl RequestHandler for Reverse {
    fn request_response(
        &self,
        payload: Payload,
    ) -> futures_util::future::BoxFuture<'static, Result<Payload, WeftError>> {
        async move {
            let (data, _) = payload.into_parts()?;
            let reversed: Vec<u8> = data.iter().rev().copied().collect();
            Ok(Payload::new(Bytes::from(reversed)))
        }
        .boxed()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn request_response_round_trip() {
    let (client_conn, client_out) = TestConnection::channel();
    let (server_conn, server_out) = TestConnection::channel();

    let client = Arc::new(Endpoint::builder(Role::Client, client_conn).build().unwrap());
    let server = Arc::new(
        Endpoint::builder(Role::Server, server_conn)
            .handler(Arc::new(Reverse))
            .build()
            .unwrap(),
    );

    {
        let server = server.clone();
        tokio::spawn(pump(client_out, move |frame| {
            server.multiplexer().handle_frame(frame);
        }));
    }
    {
        let client = client.clone();
        tokio::spawn(pump(server_out, move |frame| {
            client.multiplexer().handle_frame(frame);
        }));
    }

    let rx = client
        .requester()
        .request_response(Payload::new(Bytes::from_static(b"abc")))
        .subscribe()
        .unwrap();
    let answer = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(answer.data().unwrap(), &Bytes::from_static(b"cba"));
    assert_eq!(client.live_streams(), 0);
}
