//! Failure recovery: campaigns survive dead and dying slaves.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::UdpSocket;

use cascade_net::{Announcement, Endpoint, Message, MessageCodec, NetworkConfig};

use crate::common::{Stack, sir_unit};

/// A slave that announces itself but never listens: every dispatch to it
/// fails at connect and the batch must be re-dispatched elsewhere.
#[tokio::test]
async fn announced_but_dead_slave_is_struck_out() {
    let config = NetworkConfig {
        strike_limit: 1,
        // The ghost announces only once; keep it live until the failed
        // dispatch strikes it out.
        liveness_timeout: Duration::from_secs(30),
        ..Stack::test_config()
    };
    let stack = Stack::start_with_config(1, 2, config).await;

    let ghost = Endpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
    let codec = MessageCodec::new(stack.config.compression_threshold);
    let frame = codec
        .encode_frame(&Message::DiscoveryAnnounce(Announcement {
            endpoint: ghost,
            free_capacity: 64,
        }))
        .unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&frame, stack.discovery_addr).await.unwrap();
    stack.await_slaves(2).await;

    let id = stack
        .coordinator
        .submit(sir_unit(20.0, 10), 50, 9)
        .unwrap();
    let report = stack.coordinator.await_report(id).await.unwrap();

    // No replication is lost: batches dispatched to the ghost come back
    // as transport failures and run on the live slave instead.
    assert_eq!(report.completed, 50);
    assert_eq!(report.failed, 0);
    assert!(stack.registry.entry(ghost).is_none());

    stack.shutdown().await;
}

/// A slave stopped mid-campaign finishes its running batch, and later
/// dispatches reroute to the surviving slave.
#[tokio::test]
async fn slave_lost_mid_campaign_does_not_lose_work() {
    let config = NetworkConfig {
        strike_limit: 1,
        max_batch: 4,
        // Stale announcements can briefly revive the dead slave; give
        // the scheduler room to retry past those extra failures.
        max_retries: 10,
        ..Stack::test_config()
    };
    let mut stack = Stack::start_with_config(2, 1, config).await;

    let replications = 200;
    let id = stack
        .coordinator
        .submit(sir_unit(30.0, 10), replications, 21)
        .unwrap();

    // Let the campaign get going, then take one slave away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let victim = stack.slaves.remove(0);
    victim.shutdown().await;

    let report = stack.coordinator.await_report(id).await.unwrap();
    assert_eq!(report.completed + report.failed, replications);
    assert_eq!(report.completed, replications);
    assert!(!report.cancelled);

    stack.shutdown().await;
}
