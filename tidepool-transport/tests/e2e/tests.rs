//! Scenario tests for connections, links and endpoint lifecycle.

use std::time::Duration;

use tidepool_transport::{
    ConnectError, ConnectHints, ConnectionState, EndPointAddress, Event, EventErrorKind,
    MemoryNetworkProvider, NetworkProvider, Providers, Reliability, SendError, TokioProviders,
    Transport, TransportConfig, TransportError,
};

use super::{
    expect_closed, expect_opened, expect_received, memory_transport, next_event, run_local,
    wait_until,
};

fn bytes(text: &str) -> &[u8] {
    text.as_bytes()
}

#[test]
fn test_connect_send_receive_close() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let a = client.new_endpoint().expect("endpoint");

        let conn = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.remote(), b.address());
        assert_eq!(conn.local_id(), 1);

        let (id, remote) = expect_opened(&mut b).await;
        assert_eq!(&remote, a.address());
        assert_eq!(id.local_id(), 1);

        conn.send(&[bytes("pi"), bytes("ng"), bytes("")])
            .await
            .expect("send");
        assert_eq!(expect_received(&mut b).await, (id, b"ping".to_vec()));

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(expect_closed(&mut b).await, id);
        assert_eq!(
            conn.send(&[bytes("late")]).await,
            Err(SendError::ConnectionClosed)
        );
    });
}

#[test]
fn test_every_reliability_is_served_ordered() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let transport = memory_transport(&network, TransportConfig::default()).await;
        let mut b = transport.new_endpoint().expect("endpoint");
        let a = transport.new_endpoint().expect("endpoint");

        let conn = a
            .connect(b.address(), Reliability::Unreliable, ConnectHints::default())
            .await
            .expect("connect");
        assert_eq!(conn.reliability(), Reliability::ReliableOrdered);
        match next_event(&mut b).await {
            Event::ConnectionOpened { reliability, .. } => {
                assert_eq!(reliability, Reliability::ReliableOrdered)
            }
            other => panic!("expected ConnectionOpened, got {:?}", other),
        }
    });
}

#[test]
fn test_connections_share_one_link() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let a = client.new_endpoint().expect("endpoint");

        let first = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let second = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        assert_eq!(first.local_id(), 1);
        assert_eq!(second.local_id(), 2);

        let (id1, _) = expect_opened(&mut b).await;
        let (id2, _) = expect_opened(&mut b).await;
        assert_eq!(id1.link_seq(), id2.link_seq());
        assert!(id1.local_id() < id2.local_id());
        assert_eq!(a.link_count(), 1);
        assert_eq!(b.link_count(), 1);

        second.send(&[bytes("two")]).await.expect("send");
        first.send(&[bytes("one")]).await.expect("send");
        assert_eq!(expect_received(&mut b).await, (id2, b"two".to_vec()));
        assert_eq!(expect_received(&mut b).await, (id1, b"one".to_vec()));
    });
}

#[test]
fn test_reverse_connection_reuses_link() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let mut a = client.new_endpoint().expect("endpoint");

        let ab = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect a->b");
        let (ab_id, _) = expect_opened(&mut b).await;

        let ba = b
            .connect(a.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect b->a");
        let (ba_id, remote) = expect_opened(&mut a).await;
        assert_eq!(&remote, b.address());
        assert_eq!(a.link_count(), 1);
        assert_eq!(b.link_count(), 1);

        ab.send(&[bytes("to b")]).await.expect("send");
        ba.send(&[bytes("to a")]).await.expect("send");
        assert_eq!(expect_received(&mut b).await, (ab_id, b"to b".to_vec()));
        assert_eq!(expect_received(&mut a).await, (ba_id, b"to a".to_vec()));
    });
}

#[test]
fn test_connect_close_in_both_directions_does_not_deadlock() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let mut a = client.new_endpoint().expect("endpoint");
        let hints = ConnectHints::with_timeout(Duration::from_secs(2));

        let ab = a
            .connect(b.address(), Reliability::ReliableOrdered, hints)
            .await
            .expect("a->b");
        ab.close();

        let ba = b
            .connect(a.address(), Reliability::ReliableOrdered, hints)
            .await
            .expect("b->a");
        ba.close();

        let again = b
            .connect(a.address(), Reliability::ReliableOrdered, hints)
            .await
            .expect("b->a again");
        again.send(&[bytes("still alive")]).await.expect("send");

        let (opened, _) = expect_opened(&mut b).await;
        assert_eq!(expect_closed(&mut b).await, opened);

        let (first, _) = expect_opened(&mut a).await;
        assert_eq!(expect_closed(&mut a).await, first);
        let (second, _) = expect_opened(&mut a).await;
        assert_eq!(
            expect_received(&mut a).await,
            (second, b"still alive".to_vec())
        );
    });
}

#[test]
fn test_closing_handshake_retires_link() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let a = client.new_endpoint().expect("endpoint");

        let conn = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let (first, _) = expect_opened(&mut b).await;
        conn.close();
        assert_eq!(expect_closed(&mut b).await, first);

        wait_until("both sides to retire the link", || {
            a.link_count() == 0 && b.link_count() == 0
        })
        .await;

        // A new link instance starts its counters over.
        let conn = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("reconnect");
        assert_eq!(conn.local_id(), 1);
        let (second, _) = expect_opened(&mut b).await;
        assert_eq!(second.local_id(), 1);
        assert_ne!(second.link_seq(), first.link_seq());
        assert_ne!(second, first);
    });
}

#[test]
fn test_close_link_closes_outgoing_connections() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let a = client.new_endpoint().expect("endpoint");

        let first = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let second = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let (id1, _) = expect_opened(&mut b).await;
        let (id2, _) = expect_opened(&mut b).await;

        a.close_link(b.address());
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(second.state(), ConnectionState::Closed);
        assert_eq!(
            first.send(&[bytes("x")]).await,
            Err(SendError::ConnectionClosed)
        );

        assert_eq!(expect_closed(&mut b).await, id1);
        assert_eq!(expect_closed(&mut b).await, id2);
        wait_until("the link to close", || {
            a.link_count() == 0 && b.link_count() == 0
        })
        .await;
    });
}

#[test]
fn test_mutual_dial_converges_on_one_link() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let left = memory_transport(&network, TransportConfig::default()).await;
        let right = memory_transport(&network, TransportConfig::default()).await;
        let mut a = left.new_endpoint().expect("endpoint");
        let mut b = right.new_endpoint().expect("endpoint");

        let (ab, ba) = tokio::join!(
            a.connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default()),
            b.connect(a.address(), Reliability::ReliableOrdered, ConnectHints::default()),
        );
        let ab = ab.expect("a->b");
        let ba = ba.expect("b->a");
        assert_eq!(a.link_count(), 1);
        assert_eq!(b.link_count(), 1);

        ab.send(&[bytes("from a")]).await.expect("send");
        ba.send(&[bytes("from b")]).await.expect("send");

        let (to_b, _) = expect_opened(&mut b).await;
        assert_eq!(expect_received(&mut b).await, (to_b, b"from a".to_vec()));
        let (to_a, _) = expect_opened(&mut a).await;
        assert_eq!(expect_received(&mut a).await, (to_a, b"from b".to_vec()));
    });
}

#[test]
fn test_ids_strictly_increase_on_a_link() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let a = client.new_endpoint().expect("endpoint");

        let mut connections = Vec::new();
        for _ in 0..20 {
            connections.push(
                a.connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
                    .await
                    .expect("connect"),
            );
        }
        let local: Vec<u32> = connections.iter().map(|c| c.local_id()).collect();
        assert_eq!(local, (1..=20).collect::<Vec<u32>>());

        let mut last = 0;
        for _ in 0..20 {
            let (id, _) = expect_opened(&mut b).await;
            assert!(id.local_id() > last);
            last = id.local_id();
        }
    });
}

#[test]
fn test_dropping_connection_closes_it() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let transport = memory_transport(&network, TransportConfig::default()).await;
        let mut b = transport.new_endpoint().expect("endpoint");
        let a = transport.new_endpoint().expect("endpoint");

        let conn = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let (id, _) = expect_opened(&mut b).await;
        drop(conn);
        assert_eq!(expect_closed(&mut b).await, id);
    });
}

#[test]
fn test_endpoint_close_reports_link_loss_to_remote() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let mut a = client.new_endpoint().expect("endpoint");
        let b_address = b.address().clone();

        let conn = a
            .connect(&b_address, Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        expect_opened(&mut b).await;

        b.close();
        assert!(b.is_closed());
        assert_eq!(next_event(&mut b).await, Event::EndPointClosed);
        assert_eq!(next_event(&mut b).await, Event::EndPointClosed);
        assert_eq!(b.try_receive(), Some(Event::EndPointClosed));
        assert_eq!(server.endpoint_count(), 0);

        match next_event(&mut a).await {
            Event::ConnectionError(error) => {
                assert_eq!(error.kind, EventErrorKind::ConnectionLost(b_address.clone()));
            }
            other => panic!("expected ConnectionError, got {:?}", other),
        }
        assert!(conn.send(&[bytes("lost")]).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Closed);

        let refused = a
            .connect(&b_address, Reliability::ReliableOrdered, ConnectHints::default())
            .await;
        assert!(matches!(refused, Err(ConnectError::HandshakeRefused(_))));
    });
}

/// A connect issued right after the target endpoint closed must fail,
/// whether it lands on the dying link or dials a new one.
async fn connect_to_closed_endpoint<P: Providers>(server: &Transport<P>, client: &Transport<P>) {
    let mut b = server.new_endpoint().expect("endpoint");
    let a = client.new_endpoint().expect("endpoint");
    let b_address = b.address().clone();

    let _first = a
        .connect(&b_address, Reliability::ReliableOrdered, ConnectHints::default())
        .await
        .expect("connect");
    expect_opened(&mut b).await;

    b.close();
    assert!(b.is_closed());

    let second = a
        .connect(&b_address, Reliability::ReliableOrdered, ConnectHints::default())
        .await;
    assert!(
        matches!(
            second,
            Err(ConnectError::AddressUnreachable(_) | ConnectError::HandshakeRefused(_))
        ),
        "connect to a closed endpoint returned {:?}",
        second.map(|c| c.local_id())
    );
}

#[test]
fn test_connect_to_closed_endpoint_fails() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        connect_to_closed_endpoint(&server, &client).await;
    });
}

#[test]
fn test_connect_to_closed_endpoint_fails_over_tcp() {
    run_local(async {
        let server = Transport::new(TokioProviders::new(), TransportConfig::local_network())
            .await
            .expect("bind tcp");
        let client = Transport::new(TokioProviders::new(), TransportConfig::local_network())
            .await
            .expect("bind tcp");
        connect_to_closed_endpoint(&server, &client).await;
    });
}

#[test]
fn test_closed_endpoint_rejects_connect() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let transport = memory_transport(&network, TransportConfig::default()).await;
        let b = transport.new_endpoint().expect("endpoint");
        let a = transport.new_endpoint().expect("endpoint");

        a.close();
        let result = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await;
        assert_eq!(result.err(), Some(ConnectError::EndpointClosed));
    });
}

#[test]
fn test_transport_close_unblocks_receive() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let transport = memory_transport(&network, TransportConfig::default()).await;
        let mut endpoint = transport.new_endpoint().expect("endpoint");
        assert_eq!(transport.endpoint_count(), 1);

        let waiter = tokio::task::spawn_local(async move {
            let first = endpoint.receive().await;
            let second = endpoint.receive().await;
            (first, second)
        });
        tokio::task::yield_now().await;

        transport.close();
        let (first, second) = waiter.await.expect("receive task");
        assert_eq!(first, Event::EndPointClosed);
        assert_eq!(second, Event::EndPointClosed);
        assert!(transport.is_closed());
        assert_eq!(transport.endpoint_count(), 0);
        assert!(matches!(
            transport.new_endpoint(),
            Err(TransportError::Closed)
        ));
    });
}

#[test]
fn test_unknown_endpoint_index_is_refused() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let server = memory_transport(&network, TransportConfig::default()).await;
        let client = memory_transport(&network, TransportConfig::default()).await;
        let a = client.new_endpoint().expect("endpoint");

        let missing = EndPointAddress::new(server.address(), 99);
        let result = a
            .connect(&missing, Reliability::ReliableOrdered, ConnectHints::default())
            .await;
        assert!(matches!(result, Err(ConnectError::HandshakeRefused(_))));
        assert_eq!(a.link_count(), 0);
    });
}

#[test]
fn test_unreachable_transport() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let client = memory_transport(&network, TransportConfig::default()).await;
        let a = client.new_endpoint().expect("endpoint");

        let nowhere: EndPointAddress = "10.9.9.9:9999:0".parse().expect("address");
        let result = a
            .connect(&nowhere, Reliability::ReliableOrdered, ConnectHints::default())
            .await;
        assert!(matches!(result, Err(ConnectError::AddressUnreachable(_))));
    });
}

#[test]
fn test_connect_timeout_hint() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let client = memory_transport(&network, TransportConfig::default()).await;
        let a = client.new_endpoint().expect("endpoint");

        // Accepts sockets into its backlog but never answers a handshake.
        let _silent = network.bind("10.0.0.9:7000").await.expect("bind");
        let target: EndPointAddress = "10.0.0.9:7000:0".parse().expect("address");

        let result = a
            .connect(
                &target,
                Reliability::ReliableOrdered,
                ConnectHints::with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(result.err(), Some(ConnectError::Timeout));
    });
}

#[test]
fn test_self_connection_stays_local() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let transport = memory_transport(&network, TransportConfig::default()).await;
        let mut a = transport.new_endpoint().expect("endpoint");
        let own = a.address().clone();

        let conn = a
            .connect(&own, Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("self connect");
        assert_eq!(conn.state(), ConnectionState::Open);

        let (id, remote) = expect_opened(&mut a).await;
        assert_eq!(remote, own);
        assert_eq!(id.link_seq(), 0);

        conn.send(&[bytes("me"), bytes("ow")]).await.expect("send");
        assert_eq!(expect_received(&mut a).await, (id, b"meow".to_vec()));

        conn.close();
        assert_eq!(expect_closed(&mut a).await, id);
        assert_eq!(a.link_count(), 0);
        assert_eq!(a.try_receive(), None);
    });
}

#[test]
fn test_message_size_limit() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let config = TransportConfig::default().with_max_message_size(16);
        let server = memory_transport(&network, config.clone()).await;
        let client = memory_transport(&network, config).await;
        let mut b = server.new_endpoint().expect("endpoint");
        let a = client.new_endpoint().expect("endpoint");

        let conn = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let (id, _) = expect_opened(&mut b).await;

        let oversized = vec![7u8; 17];
        assert_eq!(
            conn.send(&[oversized.as_slice()]).await,
            Err(SendError::MessageTooLarge { size: 17, max: 16 })
        );

        let fits = vec![7u8; 16];
        conn.send(&[&fits[..8], &fits[8..]]).await.expect("send");
        assert_eq!(expect_received(&mut b).await, (id, fits));
    });
}

#[test]
fn test_bind_conflict_is_reported() {
    run_local(async {
        let network = MemoryNetworkProvider::new();
        let config = TransportConfig::new("10.0.0.1:5000");
        let _first = memory_transport(&network, config.clone()).await;

        let second = Transport::new(TokioProviders::with_network(network.clone()), config).await;
        match second {
            Err(TransportError::Bind { address, .. }) => assert_eq!(address, "10.0.0.1:5000"),
            Err(other) => panic!("expected Bind, got {:?}", other),
            Ok(_) => panic!("second bind on the same address succeeded"),
        }
    });
}

#[test]
fn test_round_trip_over_tcp() {
    run_local(async {
        let transport = Transport::new(TokioProviders::new(), TransportConfig::local_network())
            .await
            .expect("bind tcp");
        let mut b = transport.new_endpoint().expect("endpoint");
        let a = transport.new_endpoint().expect("endpoint");
        assert!(b.address().as_str().starts_with(transport.address()));

        let conn = a
            .connect(b.address(), Reliability::ReliableOrdered, ConnectHints::default())
            .await
            .expect("connect");
        let (id, _) = expect_opened(&mut b).await;

        let payload = vec![0xAB; 64 * 1024];
        conn.send(&[&payload[..1], &payload[1..]]).await.expect("send");
        assert_eq!(expect_received(&mut b).await, (id, payload));

        conn.close();
        assert_eq!(expect_closed(&mut b).await, id);
    });
}
