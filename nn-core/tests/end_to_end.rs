//! Two-or-more-node scenarios driven entirely through the public
//! [`nn_core::NodeHandle`] API over real multicast sockets.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use nn_core::{NodeConfig, NodeHandle, ObjectKind, RequestError, UpdateError};
use uuid::Uuid;

/// Retries `poll` until it returns `Some`, or panics after `timeout`.
/// Network delivery and the coalescing flush are both asynchronous, so
/// assertions on a peer's view of the world can't just run once.
async fn wait_for<T, F, Fut>(timeout: Duration, mut poll: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = poll().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A bare multicast socket, bound and joined exactly like a real node's but
/// never registered as one — used to inspect the raw datagrams a node
/// actually puts on the wire, independent of how a peer's directory
/// reconciles them.
async fn raw_listener(config: &NodeConfig) -> tokio::net::UdpSocket {
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
    socket.set_reuse_address(true).unwrap();
    #[cfg(unix)]
    socket.set_reuse_port(true).unwrap();
    socket.set_nonblocking(true).unwrap();
    socket.bind(&bind_addr.into()).unwrap();
    let socket: std::net::UdpSocket = socket.into();
    let socket = tokio::net::UdpSocket::from_std(socket).unwrap();
    socket.join_multicast_v4(config.group, config.interface).unwrap();
    socket
}

/// Collects whatever datagrams arrive on `listener`, stopping once `quiet`
/// has elapsed with nothing new.
async fn collect_datagrams(listener: &tokio::net::UdpSocket, quiet: Duration) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    loop {
        let mut buf = vec![0u8; nn_wire::MTU];
        match tokio::time::timeout(quiet, listener.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => {
                buf.truncate(n);
                datagrams.push(buf);
            }
            _ => break,
        }
    }
    datagrams
}

#[tokio::test]
async fn two_nodes_exchange_an_update() {
    let config = NodeConfig::new(45_901);
    let sender_uuid = Uuid::new_v4();
    let sender = NodeHandle::spawn(sender_uuid, config).await.unwrap();
    let observer = NodeHandle::spawn(Uuid::new_v4(), config).await.unwrap();

    let idx = sender.add_object(ObjectKind::ULTRASONIC, 4).await.unwrap();
    sender.update_object(idx, 0, &[1, 2, 3, 4]).await.unwrap();

    let found_uuid = wait_for(Duration::from_secs(2), || async {
        observer.read_uuids(None).await.filter(|u| *u == sender_uuid)
    })
    .await;
    assert_eq!(found_uuid, sender_uuid);

    let object = wait_for(Duration::from_secs(2), || async {
        observer.read_objects(sender_uuid, None).await
    })
    .await;
    assert_eq!(object.kind, ObjectKind::ULTRASONIC);
    assert_eq!(&object.payload[..], &[1, 2, 3, 4]);
}

#[tokio::test]
async fn two_senders_merge_into_one_observer() {
    let config = NodeConfig::new(45_902);
    let (uuid_a, uuid_b) = (Uuid::new_v4(), Uuid::new_v4());
    let node_a = NodeHandle::spawn(uuid_a, config).await.unwrap();
    let node_b = NodeHandle::spawn(uuid_b, config).await.unwrap();
    let observer = NodeHandle::spawn(Uuid::new_v4(), config).await.unwrap();

    let idx_a = node_a.add_object(ObjectKind::TOUCH, 1).await.unwrap();
    node_a.update_object(idx_a, 0, &[0xaa]).await.unwrap();
    let idx_b = node_b.add_object(ObjectKind::GYRO, 2).await.unwrap();
    node_b.update_object(idx_b, 0, &[0xbb, 0xcc]).await.unwrap();

    let seen_a = wait_for(Duration::from_secs(2), || async {
        observer.read_objects(uuid_a, None).await
    })
    .await;
    let seen_b = wait_for(Duration::from_secs(2), || async {
        observer.read_objects(uuid_b, None).await
    })
    .await;

    assert_eq!(&seen_a.payload[..], &[0xaa]);
    assert_eq!(&seen_b.payload[..], &[0xbb, 0xcc]);

    // Both senders are enumerable, each exactly once.
    let first = observer.read_uuids(None).await.unwrap();
    let second = observer.read_uuids(Some(first)).await.unwrap();
    let mut seen = [first, second];
    seen.sort();
    let mut expected = [uuid_a, uuid_b];
    expected.sort();
    assert_eq!(seen, expected);
    assert!(observer.read_uuids(Some(second)).await.is_none());
}

#[tokio::test]
async fn rapid_updates_in_one_tick_all_land() {
    let config = NodeConfig::new(45_903);
    let sender_uuid = Uuid::new_v4();
    let sender = NodeHandle::spawn(sender_uuid, config).await.unwrap();
    let observer = NodeHandle::spawn(Uuid::new_v4(), config).await.unwrap();

    let idx = sender.add_object(ObjectKind::RAW, 12).await.unwrap();
    // Fired back-to-back, well within the flush debounce: whichever
    // datagram(s) carry these should still reassemble into one merged
    // object by the time the observer's directory catches up. The
    // datagram-count claim itself is checked separately, at the wire
    // level, by `four_updates_in_one_window_coalesce_into_one_datagram`.
    sender.update_object(idx, 0, &[1, 1, 1, 1]).await.unwrap();
    sender.update_object(idx, 4, &[2, 2, 2, 2]).await.unwrap();
    sender.update_object(idx, 8, &[3, 3, 3, 3]).await.unwrap();

    let object = wait_for(Duration::from_secs(2), || async {
        observer
            .read_objects(sender_uuid, None)
            .await
            .filter(|o| o.size == 12)
    })
    .await;
    assert_eq!(&object.payload[..], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
}

#[tokio::test]
async fn four_updates_in_one_window_coalesce_into_one_datagram() {
    let config = NodeConfig::new(45_906);
    let sender_uuid = Uuid::new_v4();
    let sender = NodeHandle::spawn(sender_uuid, config).await.unwrap();
    let listener = raw_listener(&config).await;

    let mut idxs = Vec::new();
    for _ in 0..4u8 {
        idxs.push(sender.add_object(ObjectKind::RAW, 4).await.unwrap());
    }
    for (n, idx) in idxs.iter().enumerate() {
        let byte = n as u8;
        sender
            .update_object(*idx, 0, &[byte, byte, byte, byte])
            .await
            .unwrap();
    }

    let datagrams = collect_datagrams(&listener, Duration::from_millis(300)).await;
    assert_eq!(
        datagrams.len(),
        1,
        "four updates issued inside one flush window must land in a single datagram"
    );
    let parsed = nn_wire::parse(&datagrams[0]).expect("well formed");
    assert_eq!(parsed.records.len(), 4);
}

#[tokio::test]
async fn oversize_updates_split_across_two_datagrams_without_loss_or_duplication() {
    let config = NodeConfig::new(45_907);
    let sender_uuid = Uuid::new_v4();
    let sender = NodeHandle::spawn(sender_uuid, config).await.unwrap();
    let listener = raw_listener(&config).await;

    let idx = sender.add_object(ObjectKind::RAW, 1464).await.unwrap();
    // Fills the first datagram to exactly MTU by itself; the second record
    // cannot fit alongside it and forces an immediate flush-and-retry.
    let first = vec![0xaau8; 1460];
    let second = vec![0xbbu8; 4];
    sender.update_object(idx, 0, &first).await.unwrap();
    sender.update_object(idx, 1460, &second).await.unwrap();

    let datagrams = collect_datagrams(&listener, Duration::from_millis(300)).await;
    assert_eq!(
        datagrams.len(),
        2,
        "an update sequence exceeding one MTU must split into two datagrams"
    );

    let mut seen = Vec::new();
    for raw in &datagrams {
        let parsed = nn_wire::parse(raw).expect("well formed");
        for record in parsed.records {
            seen.push((record.header.offset, record.header.size));
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![(0, 1460), (1460, 4)]);
}

#[tokio::test]
async fn oversize_update_is_rejected_without_touching_state() {
    let config = NodeConfig::new(45_904);
    let sender = NodeHandle::spawn(Uuid::new_v4(), config).await.unwrap();
    let idx = sender.add_object(ObjectKind::RAW, 4096).await.unwrap();

    let huge = vec![0u8; nn_wire::MTU];
    let err = sender.update_object(idx, 0, &huge).await.unwrap_err();
    assert!(matches!(err, RequestError::Failed(UpdateError::Oversize)));
}

#[tokio::test]
async fn update_for_unregistered_idx_is_a_no_op() {
    let config = NodeConfig::new(45_905);
    let sender_uuid = Uuid::new_v4();
    let sender = NodeHandle::spawn(sender_uuid, config).await.unwrap();
    let observer = NodeHandle::spawn(Uuid::new_v4(), config).await.unwrap();

    // idx 3 was never registered with add_object.
    sender.update_object(3, 0, &[9, 9]).await.unwrap();
    // A real, registered object on the same node, sent afterwards, is the
    // only thing that should ever show up at the observer.
    let idx = sender.add_object(ObjectKind::LIGHT, 1).await.unwrap();
    sender.update_object(idx, 0, &[7]).await.unwrap();

    let object = wait_for(Duration::from_secs(2), || async {
        observer.read_objects(sender_uuid, None).await
    })
    .await;
    assert_eq!(object.idx, idx);
    assert_eq!(&object.payload[..], &[7]);
}
